//! Answer-only WebRTC peer connection
//!
//! The signaling client only talks to [`AnswererPeer`]; [`WebRtcPeer`] is the
//! webrtc-rs implementation and tests plug in their own.

pub mod connection;
pub mod media;
pub mod stats;

pub use connection::{
    AnswererPeer, ConnectionState, PeerFactory, PeerSettings, WebRtcPeer, WebRtcPeerFactory,
};
pub use media::{LocalMedia, LocalTrack, MediaKind};
pub use stats::{InstanceLinks, StatsEntry, StatsPoller, StatsSample};

use crate::signaling::protocol::IceCandidate;

/// Callback-driven events raised by a peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Local candidate gathered; end-of-candidates is never reported
    LocalIceCandidate(IceCandidate),
    /// Remote track arrived
    RemoteTrack {
        /// `video` or `audio`
        kind: String,
        /// Track id
        id: String,
    },
    /// String message received on a data channel
    DataChannelText(String),
    /// Connection state changed
    ConnectionState(ConnectionState),
}
