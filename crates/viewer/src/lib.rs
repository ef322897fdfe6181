//! Pipeline viewer
//!
//! Launches media-analytics pipelines on a pipeline server and views their
//! WebRTC frame output as an answer-only peer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  PipelineLifecycleManager (REST: launch / status / stop) │
//! │     │ expire / reset retries                             │
//! │     ↓                                                    │
//! │  SignalingClient (WebSocket relay, one event loop)       │
//! │  ├─ SessionContext (pure state machine → effects)        │
//! │  ├─ AnswererPeer (webrtc-rs, answer only)                │
//! │  └─ StatsPoller (periodic getStats samples)              │
//! │     ↓                                                    │
//! │  Notice stream → front end                               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pipeline_viewer::{
//!     notice_channel, HttpPipelineServer, LaunchParams, PipelineLifecycleManager,
//!     SignalingClient, ViewerConfig, WebRtcPeerFactory,
//! };
//! use std::sync::Arc;
//!
//! let config = ViewerConfig::default();
//! let (notices, mut rx) = notice_channel();
//!
//! let (client, signaling) =
//!     SignalingClient::new(&config, Arc::new(WebRtcPeerFactory), notices.clone())?;
//! client.spawn();
//!
//! let server = HttpPipelineServer::new(&config.pipeline_server.base_url, config.pipeline_server.request_timeout())?;
//! let manager = PipelineLifecycleManager::new(Arc::new(server), &config, notices)
//!     .with_retry_control(Arc::new(signaling.clone()));
//!
//! manager.launch(LaunchParams { .. }).await?;
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod notice;
pub mod peer;
pub mod pipeline;
pub mod signaling;
pub mod timer;

pub use config::{MediaConstraints, ViewerConfig};
pub use error::{Error, ErrorKind, Result};
pub use notice::{notice_channel, Notice, NoticeSink};
pub use peer::{AnswererPeer, InstanceLinks, PeerEvent, PeerFactory, StatsSample, WebRtcPeerFactory};
pub use pipeline::{
    HttpPipelineServer, InstanceRef, InstanceState, LaunchParams, PipelineLifecycleManager,
    PipelineServerApi,
};
pub use signaling::{RetryControl, SessionSnapshot, SessionState, SignalingClient, SignalingHandle};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
