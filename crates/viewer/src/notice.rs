//! User-visible notices emitted by the signaling client and pipeline manager
//!
//! Both state machines report progress as a stream of [`Notice`] values
//! instead of touching any view directly. A front end subscribes with
//! [`notice_channel`] and renders however it likes.

use crate::peer::stats::StatsSample;
use crate::signaling::machine::SessionState;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Something a user should see
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Signaling progress line
    Status(String),
    /// Signaling or negotiation error line
    Error(String),
    /// Session state changed
    SessionState(SessionState),
    /// Hint about what to do next with the visualization
    Visualization(String),
    /// Pipeline status line from the status poll
    PipelineStatus(String),
    /// Connection stats sample
    Stats(StatsSample),
    /// Remote media track arrived
    RemoteTrack {
        /// `video` or `audio`
        kind: String,
        /// Track id
        id: String,
    },
    /// Text received over the data channel
    DataChannelText(String),
}

/// Sending side of the notice stream. Cheap to clone; sends never fail.
#[derive(Debug, Clone)]
pub struct NoticeSink {
    tx: Option<mpsc::UnboundedSender<Notice>>,
}

/// Create a connected sink/receiver pair
pub fn notice_channel() -> (NoticeSink, mpsc::UnboundedReceiver<Notice>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NoticeSink { tx: Some(tx) }, rx)
}

impl NoticeSink {
    /// A sink that only logs
    pub fn log_only() -> Self {
        Self { tx: None }
    }

    /// Log and forward a notice
    pub fn emit(&self, notice: Notice) {
        match &notice {
            Notice::Status(text) | Notice::Visualization(text) => info!("{}", text),
            Notice::Error(text) => error!("{}", text),
            Notice::SessionState(state) => debug!(?state, "Session state"),
            Notice::PipelineStatus(text) => info!("{}", text),
            Notice::Stats(sample) => debug!(reports = sample.reports.len(), "Stats sample"),
            Notice::RemoteTrack { kind, id } => info!(%kind, %id, "Incoming stream"),
            Notice::DataChannelText(text) => info!("Incoming string message: {}", text),
        }

        if let Some(tx) = &self.tx {
            if tx.send(notice).is_err() {
                warn!("Notice receiver dropped");
            }
        }
    }

    /// Emit a [`Notice::Status`]
    pub fn status(&self, text: impl Into<String>) {
        self.emit(Notice::Status(text.into()));
    }

    /// Emit a [`Notice::Error`]
    pub fn error(&self, text: impl Into<String>) {
        self.emit(Notice::Error(text.into()));
    }

    /// Emit a [`Notice::Visualization`]
    pub fn visualization(&self, text: impl Into<String>) {
        self.emit(Notice::Visualization(text.into()));
    }
}
