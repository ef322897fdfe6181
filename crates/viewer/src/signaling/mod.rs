//! WebSocket signaling for answer-only WebRTC sessions

pub mod client;
pub mod machine;
pub mod protocol;

pub use client::{SessionSnapshot, SignalingClient, SignalingHandle};
pub use machine::{Effect, Input, SessionContext, SessionState, SocketState};
pub use protocol::{ClientMessage, IceCandidate, SdpType, ServerMessage, SessionDescription};

use async_trait::async_trait;

/// Control over a signaling session's connect attempt counter.
///
/// Lets the pipeline lifecycle stop reconnects once its instance has ended,
/// and re-arm them on a new launch.
#[async_trait]
pub trait RetryControl: Send + Sync {
    /// Force the counter to the ceiling so no further reconnect happens
    async fn expire_retries(&self);

    /// Clear the counter and any hard stop
    async fn reset_retries(&self);
}
