//! WebRTC peer connection management

use super::media::{attach_local_media, LocalMedia};
use super::stats::StatsSample;
use super::PeerEvent;
use crate::config::{MediaConstraints, ViewerConfig};
use crate::signaling::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, connection not yet started
    New,
    /// Connection negotiation in progress
    Connecting,
    /// Connection established successfully
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connection failed
    Failed,
    /// Connection closed
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// Settings every new peer connection is built with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSettings {
    /// ICE server URLs (empty: host candidates only)
    pub ice_servers: Vec<String>,
    /// Label of the locally created data channel
    pub data_channel_label: String,
    /// Reply sent on the local channel for every incoming string message
    pub data_channel_greeting: Option<String>,
}

impl PeerSettings {
    /// Extract peer settings from the viewer configuration
    pub fn from_config(config: &ViewerConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            data_channel_label: config.media.data_channel_label.clone(),
            data_channel_greeting: config.media.data_channel_greeting.clone(),
        }
    }
}

/// The answering side of a WebRTC session.
///
/// Calls are issued one at a time, in signaling order.
#[async_trait]
pub trait AnswererPeer: Send + Sync {
    /// Apply a remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Create an answer, set it as local description and return it
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply one remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Sample connection statistics
    async fn stats(&self) -> Result<StatsSample>;

    /// Attach local capture tracks
    async fn add_local_media(&self, constraints: MediaConstraints) -> Result<LocalMedia>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Builds a peer connection per session
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Create a peer for `remote_peer_id`; callbacks are reported on `events`
    async fn create(
        &self,
        remote_peer_id: &str,
        settings: &PeerSettings,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn AnswererPeer>>;
}

/// Factory for [`WebRtcPeer`]
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcPeerFactory;

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        remote_peer_id: &str,
        settings: &PeerSettings,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn AnswererPeer>> {
        let peer = WebRtcPeer::new(remote_peer_id.to_string(), settings, events).await?;
        Ok(Arc::new(peer))
    }
}

/// WebRTC peer connection wrapper
///
/// Wraps a webrtc::RTCPeerConnection configured as the answering side, with
/// one locally created data channel.
pub struct WebRtcPeer {
    /// Remote peer identifier
    peer_id: String,

    /// Unique identifier for this connection instance
    connection_id: String,

    /// Current connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Actual WebRTC peer connection
    peer_connection: Arc<RTCPeerConnection>,

    /// Locally created data channel
    send_channel: Arc<RTCDataChannel>,
}

impl WebRtcPeer {
    /// Create a new peer connection
    ///
    /// # Arguments
    ///
    /// * `peer_id` - Identifier of the remote (offering) peer
    /// * `settings` - ICE servers and data channel behaviour
    /// * `events` - Receives candidates, tracks and data channel text
    #[instrument(skip(settings, events), fields(peer_id = %peer_id))]
    pub async fn new(
        peer_id: String,
        settings: &PeerSettings,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let connection_id = uuid::Uuid::new_v4().to_string();

        info!(
            "Creating RTCPeerConnection: peer_id={}, connection_id={}",
            peer_id, connection_id
        );

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = settings
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
            })?);

        let state = Arc::new(RwLock::new(ConnectionState::New));

        let state_clone = Arc::clone(&state);
        let events_state = events.clone();
        let peer_id_clone = peer_id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let state = Arc::clone(&state_clone);
                let events = events_state.clone();
                let peer_id = peer_id_clone.clone();
                Box::pin(async move {
                    let new_state = ConnectionState::from(s);
                    *state.write().await = new_state;
                    info!("Peer {} connection state: {:?}", peer_id, new_state);
                    let _ = events.send(PeerEvent::ConnectionState(new_state));
                })
            },
        ));

        let events_ice = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events_ice.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE Candidate was null, done");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalIceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let events_track = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = events_track.clone();
                Box::pin(async move {
                    let kind = track.kind().to_string();
                    let id = track.id();
                    info!("Incoming stream: kind={}, id={}", kind, id);
                    let _ = events.send(PeerEvent::RemoteTrack {
                        kind: kind.clone(),
                        id: id.clone(),
                    });

                    // Drain RTP so the receive buffers never back up.
                    tokio::spawn(async move {
                        let mut packets = 0u64;
                        while track.read_rtp().await.is_ok() {
                            packets += 1;
                        }
                        debug!("Remote {} track {} ended after {} packets", kind, id, packets);
                    });
                })
            },
        ));

        let send_channel = peer_connection
            .create_data_channel(&settings.data_channel_label, None)
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to create data channel: {}", e)))?;

        let reply_to = Arc::downgrade(&send_channel);
        wire_data_channel(
            &send_channel,
            reply_to.clone(),
            settings.data_channel_greeting.clone(),
            events.clone(),
        );

        let greeting = settings.data_channel_greeting.clone();
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let reply_to = reply_to.clone();
            let greeting = greeting.clone();
            let events = events.clone();
            Box::pin(async move {
                info!("Data channel created: {}", channel.label());
                wire_data_channel(&channel, reply_to, greeting, events);
            })
        }));

        Ok(Self {
            peer_id,
            connection_id,
            state,
            peer_connection,
            send_channel,
        })
    }

    /// Get remote peer ID
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Get connection ID
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Get current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Label of the locally created data channel
    pub fn data_channel_label(&self) -> String {
        self.send_channel.label().to_string()
    }
}

fn wire_data_channel(
    channel: &Arc<RTCDataChannel>,
    reply_to: Weak<RTCDataChannel>,
    greeting: Option<String>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let label = channel.label().to_string();

    let open_label = label.clone();
    channel.on_open(Box::new(move || {
        let label = open_label.clone();
        Box::pin(async move {
            debug!("dataChannel.OnOpen: {}", label);
        })
    }));

    let close_label = label.clone();
    channel.on_close(Box::new(move || {
        let label = close_label.clone();
        Box::pin(async move {
            debug!("dataChannel.OnClose: {}", label);
        })
    }));

    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let reply_to = reply_to.clone();
        let greeting = greeting.clone();
        let events = events.clone();
        Box::pin(async move {
            if msg.is_string {
                let text = String::from_utf8_lossy(&msg.data).to_string();
                let _ = events.send(PeerEvent::DataChannelText(text));
            } else {
                debug!("Incoming data message: {} bytes", msg.data.len());
            }

            if let (Some(greeting), Some(channel)) = (greeting, reply_to.upgrade()) {
                if let Err(e) = channel.send_text(greeting).await {
                    warn!("Failed to answer on data channel: {}", e);
                }
            }
        })
    }));
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(Error::SdpError("Rollback is not supported".to_string()));
        }
    };
    parsed.map_err(|e| Error::SdpError(format!("Failed to parse remote description: {}", e)))
}

#[async_trait]
impl AnswererPeer for WebRtcPeer {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        debug!("Setting remote description for peer {}", self.peer_id);

        let remote = to_rtc_description(desc)?;
        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let sdp = match self.peer_connection.local_description().await {
            Some(local) => local.sdp,
            None => answer.sdp,
        };

        debug!("Created answer for peer {}", self.peer_id);
        Ok(SessionDescription::answer(sdp))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        debug!(
            "Adding ICE candidate for peer {}: {}",
            self.peer_id, candidate.candidate
        );

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    async fn stats(&self) -> Result<StatsSample> {
        let report = self.peer_connection.get_stats().await;
        Ok(StatsSample::from_report(&report))
    }

    async fn add_local_media(&self, constraints: MediaConstraints) -> Result<LocalMedia> {
        info!("Adding local media to peer {}: {:?}", self.peer_id, constraints);
        attach_local_media(&self.peer_connection, constraints, &self.connection_id).await
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for peer {}", self.peer_id);

        *self.state.write().await = ConnectionState::Closed;

        self.peer_connection.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close connection: {}", e))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PeerSettings {
        PeerSettings::from_config(&ViewerConfig::default())
    }

    #[test]
    fn test_settings_from_default_config() {
        let settings = settings();
        assert!(settings.ice_servers.is_empty());
        assert_eq!(settings.data_channel_label, "label");
        assert_eq!(settings.data_channel_greeting.as_deref(), Some("Hi! (from browser)"));
    }

    #[test]
    fn test_rollback_is_rejected() {
        let desc = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(to_rtc_description(desc), Err(Error::SdpError(_))));
    }

    #[tokio::test]
    async fn test_peer_creation() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = WebRtcPeer::new("1234".to_string(), &settings(), tx).await.unwrap();

        assert_eq!(peer.peer_id(), "1234");
        assert!(!peer.connection_id().is_empty());
        assert_eq!(peer.state().await, ConnectionState::New);
        assert_eq!(peer.data_channel_label(), "label");

        peer.close().await.unwrap();
        assert_eq!(peer.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_garbage_offer_is_sdp_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = WebRtcPeer::new("1234".to_string(), &settings(), tx).await.unwrap();

        let err = peer
            .set_remote_description(SessionDescription::offer("not sdp"))
            .await
            .unwrap_err();
        assert!(err.is_peer_error());
    }
}
