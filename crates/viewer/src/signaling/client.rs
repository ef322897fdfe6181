//! WebSocket signaling client
//!
//! [`SignalingClient`] is a single event loop task. It feeds socket frames,
//! timer firings, user commands and peer results into the
//! [`SessionContext`] in arrival order and performs the returned effects.
//! Peer operations run on a per-peer worker so SDP and ICE calls happen in
//! signaling order without blocking the loop.

use super::machine::{Effect, Input, SessionContext, SessionState, SocketState};
use super::protocol::{ClientMessage, IceCandidate, SessionDescription};
use super::RetryControl;
use crate::config::{MediaConstraints, PollingConfig, ViewerConfig};
use crate::notice::{Notice, NoticeSink};
use crate::peer::{
    AnswererPeer, InstanceLinks, LocalMedia, PeerEvent, PeerFactory, PeerSettings, StatsPoller,
};
use crate::timer::TimerHandle;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Grace period for the close handshake before the socket task is aborted
const SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lowest generated local peer id
const LOCAL_PEER_ID_MIN: u32 = 10;

/// Upper bound (exclusive) of generated local peer ids
const LOCAL_PEER_ID_MAX: u32 = 9000;

/// Point-in-time view of a signaling session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session state
    pub state: SessionState,
    /// Socket state
    pub socket_state: SocketState,
    /// Attempts since the last successful peer creation or reset
    pub connect_attempts: u32,
    /// Attempt ceiling reached; needs a reset
    pub hard_stopped: bool,
    /// Identity of the current or last attempt
    pub local_peer_id: String,
    /// Target peer
    pub remote_peer_id: String,
    /// A peer connection exists
    pub has_peer: bool,
    /// A reconnect is scheduled
    pub retry_scheduled: bool,
    /// Local tracks currently held for the call
    pub local_tracks: usize,
}

enum Command {
    Connect {
        remote_peer_id: String,
        instance: Option<InstanceLinks>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    ExpireRetries {
        reply: oneshot::Sender<()>,
    },
    ResetRetries {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown,
}

enum SocketEvent {
    Opened,
    Frame(String),
    Error(Error),
    Closed,
}

enum PeerOutcome {
    Event(PeerEvent),
    Input(Input),
    LocalMedia(LocalMedia),
    Notice(Notice),
}

enum Event {
    Socket { generation: u64, event: SocketEvent },
    Peer { generation: u64, outcome: PeerOutcome },
    RetryFired { generation: u64 },
}

enum PeerJob {
    AddLocalMedia(MediaConstraints),
    SetRemote(SessionDescription),
    CreateAnswer,
    AddIce(Vec<IceCandidate>),
}

struct SocketSession {
    generation: u64,
    outgoing: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

struct PeerSession {
    generation: u64,
    peer: Arc<dyn AnswererPeer>,
    jobs: mpsc::UnboundedSender<PeerJob>,
    worker: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

/// Answer-only signaling client
pub struct SignalingClient {
    /// Relay WebSocket URL
    url: String,

    /// Session state machine
    context: SessionContext,

    /// Builds the peer connection for each call
    factory: Arc<dyn PeerFactory>,

    settings: PeerSettings,
    polling: PollingConfig,
    constraints: MediaConstraints,
    send_local_media: bool,
    fixed_local_peer_id: Option<String>,

    notices: NoticeSink,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,

    socket: Option<SocketSession>,
    socket_generation: u64,
    peer: Option<PeerSession>,
    peer_generation: u64,
    retry_timer: Option<(u64, TimerHandle)>,
    retry_generation: u64,
    stats_timer: Option<TimerHandle>,
    local_media: Option<LocalMedia>,
    instance_links: Option<InstanceLinks>,
}

impl SignalingClient {
    /// Create a client and the handle that drives it.
    ///
    /// Nothing runs until [`SignalingClient::run`] is awaited or
    /// [`SignalingClient::spawn`] is called.
    pub fn new(
        config: &ViewerConfig,
        factory: Arc<dyn PeerFactory>,
        notices: NoticeSink,
    ) -> Result<(Self, SignalingHandle)> {
        let url = config.signaling.resolve_url()?;
        let (commands_tx, commands) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let client = Self {
            url,
            context: SessionContext::new(config.retry.clone()),
            factory,
            settings: PeerSettings::from_config(config),
            polling: config.polling.clone(),
            constraints: config.media.constraints,
            send_local_media: config.media.send_local_media,
            fixed_local_peer_id: config.signaling.local_peer_id.clone(),
            notices,
            commands,
            events_tx,
            events_rx,
            socket: None,
            socket_generation: 0,
            peer: None,
            peer_generation: 0,
            retry_timer: None,
            retry_generation: 0,
            stats_timer: None,
            local_media: None,
            instance_links: None,
        };

        Ok((client, SignalingHandle { commands: commands_tx }))
    }

    /// Relay URL this client connects to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run the event loop on a new task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the event loop until shutdown or every handle is dropped
    pub async fn run(mut self) {
        info!("Signaling client started for {}", self.url);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
            }
        }

        self.process_logged(Input::Disconnect).await;
        info!("Signaling client stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                remote_peer_id,
                instance,
                reply,
            } => {
                self.instance_links = instance;
                let local_peer_id = self.next_local_peer_id();
                let result = self
                    .process(Input::Connect {
                        local_peer_id,
                        remote_peer_id,
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.process_logged(Input::Disconnect).await;
                let _ = reply.send(());
            }
            Command::ExpireRetries { reply } => {
                self.process_logged(Input::ExpireRetries).await;
                let _ = reply.send(());
            }
            Command::ResetRetries { reply } => {
                self.process_logged(Input::ResetRetries).await;
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Socket { generation, event } => {
                if self.socket.as_ref().map(|s| s.generation) != Some(generation) {
                    debug!("Dropping event from stale socket {}", generation);
                    return;
                }
                let input = match event {
                    SocketEvent::Opened => Input::SocketOpened,
                    SocketEvent::Frame(text) => {
                        debug!("Received {}", text);
                        Input::Message(text)
                    }
                    SocketEvent::Error(err) => {
                        debug!(kind = ?err.kind(), retryable = err.is_retryable(), "Socket failed");
                        Input::SocketError(err.to_string())
                    }
                    SocketEvent::Closed => Input::SocketClosed,
                };
                self.process_logged(input).await;
            }
            Event::Peer {
                generation,
                outcome,
            } => {
                if self.peer.as_ref().map(|p| p.generation) != Some(generation) {
                    debug!("Dropping event from stale peer {}", generation);
                    return;
                }
                match outcome {
                    PeerOutcome::Input(input) => self.process_logged(input).await,
                    PeerOutcome::Event(PeerEvent::LocalIceCandidate(candidate)) => {
                        self.process_logged(Input::LocalIceCandidate(candidate)).await
                    }
                    PeerOutcome::Event(PeerEvent::RemoteTrack { kind, id }) => {
                        self.notices.emit(Notice::RemoteTrack { kind, id });
                        self.process_logged(Input::RemoteTrack).await;
                    }
                    PeerOutcome::Event(PeerEvent::DataChannelText(text)) => {
                        self.notices.status("Received data channel message");
                        self.notices.emit(Notice::DataChannelText(text));
                    }
                    PeerOutcome::Event(PeerEvent::ConnectionState(state)) => {
                        debug!(?state, "Peer connection state");
                    }
                    PeerOutcome::LocalMedia(media) => {
                        if let Some(mut previous) = self.local_media.replace(media) {
                            previous.release().await;
                        }
                    }
                    PeerOutcome::Notice(notice) => self.notices.emit(notice),
                }
            }
            Event::RetryFired { generation } => {
                if self.retry_timer.as_ref().map(|(g, _)| *g) != Some(generation) {
                    debug!("Dropping cancelled retry {}", generation);
                    return;
                }
                self.retry_timer = None;
                let local_peer_id = self.next_local_peer_id();
                self.process_logged(Input::RetryTimerFired { local_peer_id })
                    .await;
            }
        }
    }

    /// Feed an input and every follow-up it produces. Only the first
    /// input's rejection is returned.
    async fn process(&mut self, input: Input) -> Result<()> {
        let mut queue = VecDeque::from([input]);
        let mut result = Ok(());
        let mut first = true;

        while let Some(input) = queue.pop_front() {
            match self.context.handle(input) {
                Ok(effects) => {
                    for effect in effects {
                        self.apply(effect, &mut queue).await;
                    }
                }
                Err(e) => {
                    if matches!(e, Error::RetryCeilingExceeded(_)) {
                        self.notices.error(
                            "Too many connection attempts, aborting. Reset retries to try again",
                        );
                    }
                    if first {
                        result = Err(e);
                    } else {
                        warn!("Follow-up input rejected: {}", e);
                    }
                }
            }
            first = false;
        }

        result
    }

    async fn process_logged(&mut self, input: Input) {
        if let Err(e) = self.process(input).await {
            debug!("Input rejected: {}", e);
        }
    }

    async fn apply(&mut self, effect: Effect, queue: &mut VecDeque<Input>) {
        match effect {
            Effect::OpenSocket => self.open_socket(),
            Effect::Send(message) => self.send(message),
            Effect::CloseSocket => self.close_socket(),
            Effect::CreatePeerConnection => {
                if let Err(e) = self.create_peer().await {
                    error!("Failed to create peer connection: {}", e);
                    queue.push_back(Input::NegotiationFailed(e.to_string()));
                }
            }
            Effect::SetRemoteDescription(desc) => self.submit(PeerJob::SetRemote(desc)),
            Effect::CreateAnswer => self.submit(PeerJob::CreateAnswer),
            Effect::AddIceCandidates(candidates) => self.submit(PeerJob::AddIce(candidates)),
            Effect::StartStats => self.start_stats(),
            Effect::CancelStats => {
                if let Some(timer) = self.stats_timer.take() {
                    timer.cancel();
                }
            }
            Effect::ScheduleRetry(delay) => self.schedule_retry(delay),
            Effect::CancelRetry => {
                if let Some((_, timer)) = self.retry_timer.take() {
                    timer.cancel();
                }
            }
            Effect::ClosePeerConnection => self.close_peer().await,
            Effect::ReleaseLocalMedia => {
                if let Some(mut media) = self.local_media.take() {
                    media.release().await;
                }
            }
            Effect::Notify(notice) => self.notices.emit(notice),
        }
    }

    fn next_local_peer_id(&self) -> String {
        match &self.fixed_local_peer_id {
            Some(id) => id.clone(),
            None => rand::thread_rng()
                .gen_range(LOCAL_PEER_ID_MIN..LOCAL_PEER_ID_MAX)
                .to_string(),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.context.state(),
            socket_state: self.context.socket_state(),
            connect_attempts: self.context.connect_attempts(),
            hard_stopped: self.context.is_hard_stopped(),
            local_peer_id: self.context.local_peer_id().to_string(),
            remote_peer_id: self.context.remote_peer_id().to_string(),
            has_peer: self.peer.is_some(),
            retry_scheduled: self.retry_timer.is_some(),
            local_tracks: self.local_media.as_ref().map_or(0, |m| m.tracks().len()),
        }
    }

    fn open_socket(&mut self) {
        self.socket_generation += 1;
        let generation = self.socket_generation;
        let (outgoing, rx) = mpsc::unbounded_channel();

        self.notices
            .status(format!("Connecting to server {}", self.url));
        let task = tokio::spawn(socket_task(
            self.url.clone(),
            generation,
            rx,
            self.events_tx.clone(),
        ));

        if let Some(previous) = self.socket.replace(SocketSession {
            generation,
            outgoing,
            task,
        }) {
            previous.task.abort();
        }
    }

    fn send(&self, message: ClientMessage) {
        let Some(socket) = &self.socket else {
            warn!("No signaling socket, dropping {:?}", message);
            return;
        };
        match message.encode() {
            Ok(text) => {
                debug!("Sending {}", text);
                if socket.outgoing.send(Message::Text(text)).is_err() {
                    warn!("Signaling socket sender is gone");
                }
            }
            Err(e) => warn!("Failed to encode signaling message: {}", e),
        }
    }

    fn close_socket(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        let _ = socket.outgoing.send(Message::Close(None));
        let abort = socket.task.abort_handle();
        let task = socket.task;
        tokio::spawn(async move {
            if tokio::time::timeout(SOCKET_CLOSE_TIMEOUT, task).await.is_err() {
                debug!("Close handshake timed out, aborting socket task");
                abort.abort();
            }
        });
    }

    async fn create_peer(&mut self) -> Result<()> {
        self.notices.status("Creating RTCPeerConnection");

        self.peer_generation += 1;
        let generation = self.peer_generation;
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let peer = self
            .factory
            .create(self.context.remote_peer_id(), &self.settings, peer_tx)
            .await?;

        let events = self.events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                let outcome = PeerOutcome::Event(event);
                if events.send(Event::Peer { generation, outcome }).is_err() {
                    break;
                }
            }
        });

        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(negotiation_worker(
            Arc::clone(&peer),
            generation,
            jobs_rx,
            self.events_tx.clone(),
        ));

        if self.send_local_media && !self.constraints.is_empty() {
            let _ = jobs.send(PeerJob::AddLocalMedia(self.constraints));
        }

        if let Some(previous) = self.peer.replace(PeerSession {
            generation,
            peer,
            jobs,
            worker,
            forwarder,
        }) {
            warn!("Replacing a live peer connection");
            close_session(previous).await;
        }
        Ok(())
    }

    fn submit(&self, job: PeerJob) {
        match &self.peer {
            Some(session) => {
                if session.jobs.send(job).is_err() {
                    warn!("Negotiation worker is gone");
                }
            }
            None => warn!("No peer connection for negotiation step"),
        }
    }

    async fn close_peer(&mut self) {
        if let Some(session) = self.peer.take() {
            close_session(session).await;
        }
    }

    fn start_stats(&mut self) {
        let Some(session) = &self.peer else {
            return;
        };
        self.stats_timer = Some(StatsPoller::spawn(
            Arc::clone(&session.peer),
            self.instance_links.clone(),
            self.polling.stats_initial_delay(),
            self.polling.stats_interval(),
            self.notices.clone(),
        ));
    }

    fn schedule_retry(&mut self, delay: Duration) {
        self.retry_generation += 1;
        let generation = self.retry_generation;
        let events = self.events_tx.clone();

        info!("Reconnecting in {:?}", delay);
        let timer = TimerHandle::after("retry", delay, async move {
            let _ = events.send(Event::RetryFired { generation });
        });
        self.retry_timer = Some((generation, timer));
    }
}

async fn close_session(session: PeerSession) {
    session.worker.abort();
    session.forwarder.abort();
    if let Err(e) = session.peer.close().await {
        warn!("Failed to close peer connection: {}", e);
    }
}

/// Connect, then pump frames until the socket ends
async fn socket_task(
    url: String,
    generation: u64,
    outgoing: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<Event>,
) {
    let emit = |event: SocketEvent| {
        let _ = events.send(Event::Socket { generation, event });
    };

    info!("Connecting to signaling server: {}", url);
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            emit(SocketEvent::Error(Error::WebSocketError(format!(
                "Failed to connect: {}",
                e
            ))));
            return;
        }
    };

    info!("Connected to signaling server");
    emit(SocketEvent::Opened);

    let (write, mut read) = ws_stream.split();
    let sender = tokio::spawn(sender_task(write, outgoing));

    let ended = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => emit(SocketEvent::Frame(text)),
            Some(Ok(Message::Close(_))) | None => {
                info!("WebSocket connection closed");
                break SocketEvent::Closed;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("WebSocket error: {}", e);
                break SocketEvent::Error(Error::WebSocketError(e.to_string()));
            }
        }
    };

    emit(ended);
    sender.abort();
    debug!("Receiver task terminated");
}

/// Sender task: sends messages from channel to WebSocket
async fn sender_task(
    mut write: futures::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            error!("Failed to send WebSocket message: {}", e);
            break;
        }
        if closing {
            break;
        }
    }

    debug!("Sender task terminated");
}

fn report(events: &mpsc::UnboundedSender<Event>, generation: u64, outcome: PeerOutcome) -> bool {
    events.send(Event::Peer { generation, outcome }).is_ok()
}

/// Runs peer jobs one at a time, in submission order
async fn negotiation_worker(
    peer: Arc<dyn AnswererPeer>,
    generation: u64,
    mut jobs: mpsc::UnboundedReceiver<PeerJob>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(job) = jobs.recv().await {
        let outcome = match job {
            PeerJob::AddLocalMedia(constraints) => match peer.add_local_media(constraints).await {
                Ok(media) => PeerOutcome::LocalMedia(media),
                Err(e) => PeerOutcome::Notice(Notice::Error(e.to_string())),
            },
            PeerJob::SetRemote(desc) => {
                let was_offer = desc.is_offer();
                match peer.set_remote_description(desc).await {
                    Ok(()) => PeerOutcome::Input(Input::RemoteDescriptionSet { was_offer }),
                    Err(e) => PeerOutcome::Input(Input::NegotiationFailed(e.to_string())),
                }
            }
            PeerJob::CreateAnswer => match peer.create_answer().await {
                Ok(answer) => PeerOutcome::Input(Input::AnswerCreated(answer)),
                Err(e) => PeerOutcome::Input(Input::NegotiationFailed(e.to_string())),
            },
            PeerJob::AddIce(candidates) => {
                for candidate in candidates {
                    if let Err(e) = peer.add_ice_candidate(candidate).await {
                        let failed = PeerOutcome::Input(Input::IceCandidateFailed(e.to_string()));
                        if !report(&events, generation, failed) {
                            return;
                        }
                    }
                }
                continue;
            }
        };

        if !report(&events, generation, outcome) {
            break;
        }
    }

    debug!("Negotiation worker {} terminated", generation);
}

/// Cloneable handle to a running [`SignalingClient`]
#[derive(Debug, Clone)]
pub struct SignalingHandle {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Connect { .. } => "Connect",
            Command::Disconnect { .. } => "Disconnect",
            Command::ExpireRetries { .. } => "ExpireRetries",
            Command::ResetRetries { .. } => "ResetRetries",
            Command::Snapshot { .. } => "Snapshot",
            Command::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

fn client_stopped() -> Error {
    Error::InvalidState("signaling client is not running".to_string())
}

impl SignalingHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| client_stopped())?;
        rx.await.map_err(|_| client_stopped())
    }

    /// Open a session with `remote_peer_id`.
    ///
    /// `instance` links are attached to every stats sample of the session.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for an empty peer id, [`Error::InvalidState`]
    /// while a session is active, [`Error::RetryCeilingExceeded`] after a
    /// hard stop.
    pub async fn connect(
        &self,
        remote_peer_id: impl Into<String>,
        instance: Option<InstanceLinks>,
    ) -> Result<()> {
        let remote_peer_id = remote_peer_id.into();
        self.request(|reply| Command::Connect {
            remote_peer_id,
            instance,
            reply,
        })
        .await?
    }

    /// Tear the session down and cancel any scheduled reconnect
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Current session snapshot
    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stop the event loop after a final teardown
    pub async fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).await.is_err() {
            debug!("Signaling client already stopped");
        }
    }
}

#[async_trait]
impl RetryControl for SignalingHandle {
    async fn expire_retries(&self) {
        if let Err(e) = self.request(|reply| Command::ExpireRetries { reply }).await {
            debug!("Could not expire retries: {}", e);
        }
    }

    async fn reset_retries(&self) {
        if let Err(e) = self.request(|reply| Command::ResetRetries { reply }).await {
            debug!("Could not reset retries: {}", e);
        }
    }
}
