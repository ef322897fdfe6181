//! Signaling session state machine
//!
//! [`SessionContext`] owns every counter and flag of one signaling session and
//! reacts to [`Input`]s by returning the [`Effect`]s the driver must perform.
//! It never touches a socket, timer or peer connection itself, which keeps the
//! ordering rules testable without a network.

use super::protocol::{ClientMessage, IceCandidate, ServerMessage, SessionDescription};
use crate::config::RetryConfig;
use crate::notice::Notice;
use crate::{Error, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never connected
    Idle,
    /// Socket is being opened
    Connecting,
    /// Socket open, `HELLO` sent
    Registered,
    /// `SESSION_OK` received, stream start requested
    SessionRequested,
    /// SDP/ICE exchange in progress
    Negotiating,
    /// Answer sent, media flowing
    Streaming,
    /// Tearing down after a failure
    Erroring,
    /// Torn down; may reconnect
    Closed,
}

/// Signaling socket state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No socket yet
    Disconnected,
    /// Connect in flight
    Connecting,
    /// Open
    Open,
    /// Close requested
    Closing,
    /// Closed
    Closed,
}

/// Something that happened to the session
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Connect request (manual or from a fired retry)
    Connect {
        /// Identity to register with
        local_peer_id: String,
        /// Peer to request a session with
        remote_peer_id: String,
    },
    /// Socket finished opening
    SocketOpened,
    /// Socket-level failure
    SocketError(String),
    /// Remote end closed the socket
    SocketClosed,
    /// Text frame from the relay
    Message(String),
    /// Remote description applied to the peer connection
    RemoteDescriptionSet {
        /// The applied description was an offer
        was_offer: bool,
    },
    /// Answer created and set as local description
    AnswerCreated(SessionDescription),
    /// Setting a description or creating the answer failed
    NegotiationFailed(String),
    /// Applying a remote ICE candidate failed
    IceCandidateFailed(String),
    /// Peer connection gathered a local candidate
    LocalIceCandidate(IceCandidate),
    /// Remote track arrived
    RemoteTrack,
    /// Manual disconnect
    Disconnect,
    /// Retry delay elapsed
    RetryTimerFired {
        /// Fresh identity for the new attempt
        local_peer_id: String,
    },
    /// Force the attempt counter to the ceiling
    ExpireRetries,
    /// Clear the attempt counter and any hard stop
    ResetRetries,
}

/// Work the driver must perform, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open the relay socket
    OpenSocket,
    /// Send a frame
    Send(ClientMessage),
    /// Close the relay socket
    CloseSocket,
    /// Create the peer connection
    CreatePeerConnection,
    /// Apply a remote description
    SetRemoteDescription(SessionDescription),
    /// Create and set the local answer
    CreateAnswer,
    /// Apply remote candidates, in order
    AddIceCandidates(Vec<IceCandidate>),
    /// Start sampling connection stats
    StartStats,
    /// Stop sampling connection stats
    CancelStats,
    /// Reconnect after a delay
    ScheduleRetry(Duration),
    /// Drop a scheduled reconnect
    CancelRetry,
    /// Close and discard the peer connection
    ClosePeerConnection,
    /// Stop local capture tracks
    ReleaseLocalMedia,
    /// Surface a notice
    Notify(Notice),
}

#[derive(Debug)]
enum Teardown {
    RelayError(String),
    Protocol(String),
    Negotiation(String),
    Socket(String),
    RemoteClosed,
    Disconnect,
}

impl Teardown {
    fn is_error(&self) -> bool {
        !matches!(self, Teardown::RemoteClosed | Teardown::Disconnect)
    }
}

/// State of one signaling session
#[derive(Debug)]
pub struct SessionContext {
    state: SessionState,
    socket_state: SocketState,
    local_peer_id: String,
    remote_peer_id: String,
    connect_attempts: u32,
    hard_stopped: bool,
    retry_pending: bool,
    session_requested: bool,
    has_peer: bool,
    remote_description_pending: bool,
    remote_description_set: bool,
    local_description_set: bool,
    pending_ice: Vec<IceCandidate>,
    retry: RetryConfig,
}

impl SessionContext {
    /// New idle session
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            state: SessionState::Idle,
            socket_state: SocketState::Disconnected,
            local_peer_id: String::new(),
            remote_peer_id: String::new(),
            connect_attempts: 0,
            hard_stopped: false,
            retry_pending: false,
            session_requested: false,
            has_peer: false,
            remote_description_pending: false,
            remote_description_set: false,
            local_description_set: false,
            pending_ice: Vec::new(),
            retry,
        }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current socket state
    pub fn socket_state(&self) -> SocketState {
        self.socket_state
    }

    /// Attempts made since the last successful peer creation or reset
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// True once the ceiling was hit; cleared by [`Input::ResetRetries`]
    pub fn is_hard_stopped(&self) -> bool {
        self.hard_stopped
    }

    /// Remote candidates waiting for the remote description
    pub fn pending_ice_len(&self) -> usize {
        self.pending_ice.len()
    }

    /// Identity used for the current attempt
    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Target peer of the current or last attempt
    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    /// True while a peer connection exists
    pub fn has_peer(&self) -> bool {
        self.has_peer
    }

    /// Feed one input.
    ///
    /// # Errors
    ///
    /// Only connect requests fail: an empty remote peer id, a session that is
    /// still active, or the attempt ceiling. The state is left unchanged.
    pub fn handle(&mut self, input: Input) -> Result<Vec<Effect>> {
        let effects = match input {
            Input::Connect {
                local_peer_id,
                remote_peer_id,
            } => self.connect(local_peer_id, remote_peer_id)?,
            Input::RetryTimerFired { local_peer_id } => {
                self.retry_pending = false;
                if self.state != SessionState::Closed {
                    debug!(state = ?self.state, "Retry fired on an active session, ignoring");
                    return Ok(Vec::new());
                }
                let remote = self.remote_peer_id.clone();
                self.connect(local_peer_id, remote)?
            }
            Input::SocketOpened => self.on_socket_opened(),
            Input::SocketError(reason) => {
                if !self.socket_live() {
                    return Ok(Vec::new());
                }
                self.teardown(Teardown::Socket(reason))
            }
            Input::SocketClosed => {
                if !self.socket_live() {
                    return Ok(Vec::new());
                }
                self.teardown(Teardown::RemoteClosed)
            }
            Input::Message(text) => self.on_message(&text),
            Input::RemoteDescriptionSet { was_offer } => self.on_remote_description_set(was_offer),
            Input::AnswerCreated(answer) => self.on_answer_created(answer),
            Input::NegotiationFailed(reason) => {
                if !self.has_peer {
                    return Ok(Vec::new());
                }
                self.teardown(Teardown::Negotiation(reason))
            }
            Input::IceCandidateFailed(reason) => {
                vec![Effect::Notify(Notice::Error(reason))]
            }
            Input::LocalIceCandidate(candidate) => {
                if self.socket_state == SocketState::Open {
                    vec![Effect::Send(ClientMessage::Ice(candidate))]
                } else {
                    Vec::new()
                }
            }
            Input::RemoteTrack => self.on_remote_track(),
            Input::Disconnect => self.teardown(Teardown::Disconnect),
            Input::ExpireRetries => {
                self.connect_attempts = self.retry.max_attempts;
                Vec::new()
            }
            Input::ResetRetries => {
                self.connect_attempts = 0;
                self.hard_stopped = false;
                Vec::new()
            }
        };
        Ok(effects)
    }

    fn socket_live(&self) -> bool {
        matches!(
            self.socket_state,
            SocketState::Connecting | SocketState::Open
        )
    }

    fn connect(&mut self, local_peer_id: String, remote_peer_id: String) -> Result<Vec<Effect>> {
        if remote_peer_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "remote peer id must not be empty".to_string(),
            ));
        }

        if !matches!(self.state, SessionState::Idle | SessionState::Closed) {
            return Err(Error::InvalidState(format!(
                "session already active ({:?})",
                self.state
            )));
        }

        if self.connect_attempts >= self.retry.max_attempts {
            self.hard_stopped = true;
            return Err(Error::RetryCeilingExceeded(self.connect_attempts));
        }

        self.connect_attempts += 1;
        self.local_peer_id = local_peer_id;
        self.remote_peer_id = remote_peer_id;
        self.session_requested = false;
        self.state = SessionState::Connecting;
        self.socket_state = SocketState::Connecting;

        let mut effects = Vec::new();
        if self.retry_pending {
            self.retry_pending = false;
            effects.push(Effect::CancelRetry);
        }
        effects.push(Effect::OpenSocket);
        effects.push(Effect::Notify(Notice::SessionState(SessionState::Connecting)));
        Ok(effects)
    }

    fn on_socket_opened(&mut self) -> Vec<Effect> {
        if self.state != SessionState::Connecting {
            warn!(state = ?self.state, "Socket opened outside of connect, ignoring");
            return Vec::new();
        }

        self.socket_state = SocketState::Open;
        self.state = SessionState::Registered;
        vec![
            Effect::Send(ClientMessage::Hello(self.local_peer_id.clone())),
            Effect::Notify(Notice::Status("Registering with server".to_string())),
            Effect::Notify(Notice::SessionState(SessionState::Registered)),
        ]
    }

    fn on_message(&mut self, text: &str) -> Vec<Effect> {
        if self.socket_state != SocketState::Open {
            debug!("Frame for a closed socket, ignoring");
            return Vec::new();
        }

        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => return self.teardown(Teardown::Protocol(e.to_string())),
        };

        match message {
            ServerMessage::Hello => match self.state {
                SessionState::Registered | SessionState::SessionRequested => {
                    self.session_requested = true;
                    vec![
                        Effect::Send(ClientMessage::Session(self.remote_peer_id.clone())),
                        Effect::Notify(Notice::Status(
                            "Registered with server, waiting for call".to_string(),
                        )),
                    ]
                }
                state => {
                    warn!(?state, "Unexpected HELLO, ignoring");
                    Vec::new()
                }
            },
            ServerMessage::SessionOk => {
                if self.state == SessionState::Registered && self.session_requested {
                    self.state = SessionState::SessionRequested;
                    vec![
                        Effect::Send(ClientMessage::StartWebrtcStream),
                        Effect::Notify(Notice::Status("Initiating stream session".to_string())),
                        Effect::Notify(Notice::SessionState(SessionState::SessionRequested)),
                    ]
                } else {
                    warn!(state = ?self.state, "Unexpected SESSION_OK, ignoring");
                    Vec::new()
                }
            }
            ServerMessage::Error(text) => self.teardown(Teardown::RelayError(text)),
            ServerMessage::Sdp(desc) => {
                let Some(mut effects) = self.begin_call() else {
                    return Vec::new();
                };
                if self.remote_description_pending || self.remote_description_set {
                    warn!("Renegotiation is not supported, ignoring SDP");
                    return effects;
                }
                self.remote_description_pending = true;
                effects.push(Effect::SetRemoteDescription(desc));
                effects
            }
            ServerMessage::Ice(candidate) => {
                let Some(mut effects) = self.begin_call() else {
                    return Vec::new();
                };
                if self.remote_description_set {
                    effects.push(Effect::AddIceCandidates(vec![candidate]));
                } else {
                    self.pending_ice.push(candidate);
                }
                effects
            }
        }
    }

    /// Enter negotiation on the first SDP/ICE frame. `None` when the session
    /// has not been registered yet.
    fn begin_call(&mut self) -> Option<Vec<Effect>> {
        if !matches!(
            self.state,
            SessionState::Registered
                | SessionState::SessionRequested
                | SessionState::Negotiating
                | SessionState::Streaming
        ) {
            warn!(state = ?self.state, "Negotiation message before registration, ignoring");
            return None;
        }

        let mut effects = Vec::new();
        if !self.has_peer {
            self.has_peer = true;
            // A call that reaches negotiation gets a fresh budget, even after
            // ExpireRetries arrived during the handshake.
            self.connect_attempts = 0;
            effects.push(Effect::CreatePeerConnection);
            effects.push(Effect::StartStats);
        }
        if matches!(
            self.state,
            SessionState::Registered | SessionState::SessionRequested
        ) {
            self.state = SessionState::Negotiating;
            effects.push(Effect::Notify(Notice::SessionState(SessionState::Negotiating)));
        }
        Some(effects)
    }

    fn on_remote_description_set(&mut self, was_offer: bool) -> Vec<Effect> {
        if !self.has_peer || !self.remote_description_pending {
            return Vec::new();
        }

        self.remote_description_pending = false;
        self.remote_description_set = true;

        let mut effects = vec![Effect::Notify(Notice::Status("Remote SDP set".to_string()))];
        if !self.pending_ice.is_empty() {
            effects.push(Effect::AddIceCandidates(std::mem::take(&mut self.pending_ice)));
        }
        if was_offer {
            effects.push(Effect::Notify(Notice::Status("Got SDP offer".to_string())));
            effects.push(Effect::CreateAnswer);
        }
        effects
    }

    fn on_answer_created(&mut self, answer: SessionDescription) -> Vec<Effect> {
        if !self.has_peer || self.socket_state != SocketState::Open {
            return Vec::new();
        }

        self.local_description_set = true;
        let mut effects = vec![
            Effect::Notify(Notice::Status("Sending SDP answer".to_string())),
            Effect::Send(ClientMessage::Sdp(answer)),
        ];
        effects.extend(self.enter_streaming());
        effects
    }

    fn on_remote_track(&mut self) -> Vec<Effect> {
        if self.remote_description_set && self.local_description_set {
            self.enter_streaming()
        } else {
            Vec::new()
        }
    }

    fn enter_streaming(&mut self) -> Vec<Effect> {
        if self.state != SessionState::Negotiating {
            return Vec::new();
        }
        self.state = SessionState::Streaming;
        vec![Effect::Notify(Notice::SessionState(SessionState::Streaming))]
    }

    fn teardown(&mut self, reason: Teardown) -> Vec<Effect> {
        let mut effects = Vec::new();

        match &reason {
            Teardown::RelayError(text)
            | Teardown::Protocol(text)
            | Teardown::Negotiation(text) => {
                effects.push(Effect::Notify(Notice::Error(text.clone())));
            }
            Teardown::Socket(text) => {
                debug!(reason = %text, "Socket error");
                effects.push(Effect::Notify(Notice::Error(
                    "Unable to connect to server. Confirm it is running and accessible on network."
                        .to_string(),
                )));
            }
            Teardown::RemoteClosed => {
                effects.push(Effect::Notify(Notice::Status(
                    "Stream ended. Disconnected from server".to_string(),
                )));
            }
            Teardown::Disconnect => {}
        }

        if reason.is_error() {
            self.state = SessionState::Erroring;
            effects.push(Effect::Notify(Notice::SessionState(SessionState::Erroring)));
        }

        if self.socket_live() {
            self.socket_state = SocketState::Closing;
            effects.push(Effect::CloseSocket);
        }
        self.socket_state = match self.socket_state {
            SocketState::Disconnected => SocketState::Disconnected,
            _ => SocketState::Closed,
        };

        if self.has_peer {
            effects.push(Effect::CancelStats);
            effects.push(Effect::ClosePeerConnection);
        }
        effects.push(Effect::ReleaseLocalMedia);

        self.has_peer = false;
        self.session_requested = false;
        self.remote_description_pending = false;
        self.remote_description_set = false;
        self.local_description_set = false;
        self.pending_ice.clear();

        let was_closed = matches!(self.state, SessionState::Idle | SessionState::Closed);
        self.state = match self.state {
            SessionState::Idle => SessionState::Idle,
            _ => SessionState::Closed,
        };
        if !was_closed || reason.is_error() {
            effects.push(Effect::Notify(Notice::SessionState(self.state)));
        }

        match reason {
            Teardown::Disconnect => {
                if self.retry_pending {
                    self.retry_pending = false;
                    effects.push(Effect::CancelRetry);
                }
            }
            Teardown::RemoteClosed => {}
            _ => {
                if self.retry.auto_retry {
                    self.retry_pending = true;
                    effects.push(Effect::ScheduleRetry(self.retry.delay()));
                }
            }
        }

        effects
    }
}
