//! Error types for the pipeline viewer

/// Result type alias using the viewer Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classes used to decide how a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed local input, detected before any network call
    InvalidInput,
    /// Socket-level failure, eligible for bounded auto-retry
    Transport,
    /// Malformed or unexpected message, fatal to the session only
    Protocol,
    /// Server reported the instance invalid or aborted
    RemoteRejection,
    /// Non-2xx poll response, retried silently
    Transient,
    /// Everything else
    Internal,
}

/// Errors that can occur while launching, polling or viewing a pipeline
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid caller-supplied input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A required launch parameter was empty
    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    /// No pipeline instance that this client may act on
    #[error("No active pipeline instance: {0}")]
    NoActiveInstance(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not allowed in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Malformed or unexpected signaling message
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Pipeline server rejected or aborted the instance
    #[error("Remote rejection: {0}")]
    RemoteRejection(String),

    /// Pipeline server returned a non-success response worth retrying
    #[error("Transient server error: {0}")]
    Transient(String),

    /// Connect attempts reached the configured ceiling
    #[error("Too many connection attempts ({0}), reset required")]
    RetryCeilingExceeded(u32),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_)
            | Error::MissingParameter(_)
            | Error::NoActiveInstance(_)
            | Error::InvalidConfig(_)
            | Error::InvalidState(_) => ErrorKind::InvalidInput,
            Error::WebSocketError(_) | Error::IoError(_) | Error::HttpError(_) => {
                ErrorKind::Transport
            }
            Error::ProtocolError(_)
            | Error::SerializationError(_)
            | Error::SdpError(_) => ErrorKind::Protocol,
            Error::RemoteRejection(_) => ErrorKind::RemoteRejection,
            Error::Transient(_) => ErrorKind::Transient,
            _ => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Transient)
    }

    /// Check if this error was raised locally before any network call
    pub fn is_input_error(&self) -> bool {
        self.kind() == ErrorKind::InvalidInput
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerConnectionError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
                | Error::MediaTrackError(_)
        )
    }
}
