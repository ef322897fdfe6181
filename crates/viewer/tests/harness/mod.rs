//! Shared fixtures for the integration tests
//!
//! - [`RelayStub`]: a WebSocket signaling relay the test scripts frame by frame
//! - [`RecordingPeerFactory`]: a fake answerer that records every call
//! - [`PipelineServerStub`]: an axum stub of the pipeline server REST API
//!
//! Every server binds `127.0.0.1:0`.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use pipeline_viewer::config::MediaConstraints;
use pipeline_viewer::peer::media::{LocalTrack, MediaKind};
use pipeline_viewer::peer::{AnswererPeer, LocalMedia, PeerEvent, PeerFactory, PeerSettings};
use pipeline_viewer::signaling::{IceCandidate, SdpType, SessionDescription};
use pipeline_viewer::{Notice, StatsSample, ViewerConfig};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// How long any single expectation may wait
pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `check` until it returns true or [`WAIT`] elapses
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Wait for the first notice matching `pred`
pub async fn wait_for_notice(
    rx: &mut mpsc::UnboundedReceiver<Notice>,
    pred: impl Fn(&Notice) -> bool,
) -> Notice {
    tokio::time::timeout(WAIT, async {
        while let Some(notice) = rx.recv().await {
            if pred(&notice) {
                return notice;
            }
        }
        panic!("notice stream ended");
    })
    .await
    .expect("timed out waiting for notice")
}

/// Config pointing at the relay on `port`, with short timers
pub fn test_config(port: u16) -> ViewerConfig {
    let mut config = ViewerConfig::default();
    config.signaling.server = Some("127.0.0.1".to_string());
    config.signaling.port = port;
    config.signaling.local_peer_id = Some("42".to_string());
    config.retry.delay_ms = 50;
    config.polling.status_interval_ms = 50;
    config.polling.stats_interval_ms = 100;
    config.polling.stats_initial_delay_ms = 100;
    config
}

/// Signaling relay stub
pub struct RelayStub {
    port: u16,
    connections: mpsc::UnboundedReceiver<RelayConnection>,
    task: JoinHandle<()>,
}

/// One client connection accepted by [`RelayStub`]
pub struct RelayConnection {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl RelayStub {
    /// Start the relay on a random available port
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let (conn_tx, connections) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (mut write, mut read) = ws.split();
                let (in_tx, incoming) = mpsc::unbounded_channel();
                let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Message>();

                tokio::spawn(async move {
                    while let Some(msg) = out_rx.recv().await {
                        let closing = matches!(msg, Message::Close(_));
                        if write.send(msg).await.is_err() || closing {
                            break;
                        }
                    }
                });
                tokio::spawn(async move {
                    while let Some(Ok(msg)) = read.next().await {
                        match msg {
                            Message::Text(text) => {
                                if in_tx.send(text).is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                });

                if conn_tx.send(RelayConnection { incoming, outgoing }).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            port,
            connections,
            task,
        })
    }

    /// Port the relay listens on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Next accepted connection
    pub async fn accept(&mut self) -> RelayConnection {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a relay connection")
            .expect("relay stopped")
    }

    /// True if no further connection arrives within `within`
    pub async fn no_connection_within(&mut self, within: Duration) -> bool {
        tokio::time::timeout(within, self.connections.recv())
            .await
            .is_err()
    }
}

impl Drop for RelayStub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl RelayConnection {
    /// Next text frame from the client; `None` once the client closed
    pub async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.incoming.recv())
            .await
            .expect("timed out waiting for a client frame")
    }

    /// Next frame, which must equal `expected`
    pub async fn expect(&mut self, expected: &str) {
        let frame = self.recv().await.expect("client closed the socket");
        assert_eq!(frame, expected);
    }

    /// Next frame parsed as JSON
    pub async fn recv_json(&mut self) -> Value {
        let frame = self.recv().await.expect("client closed the socket");
        serde_json::from_str(&frame).expect("client frame is not JSON")
    }

    /// Send a text frame to the client
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.outgoing.send(Message::Text(text.into()));
    }

    /// Send a JSON frame to the client
    pub fn send_json(&self, value: Value) {
        self.send(value.to_string());
    }

    /// Start the close handshake
    pub fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }

    /// Run the relay side of the handshake up to `START_WEBRTC_STREAM`
    pub async fn handshake(&mut self, local_peer_id: &str, remote_peer_id: &str) {
        self.expect(&format!("HELLO {}", local_peer_id)).await;
        self.send("HELLO");
        self.expect(&format!("SESSION {}", remote_peer_id)).await;
        self.send("SESSION_OK");
        self.expect("START_WEBRTC_STREAM").await;
    }

    /// Wait until the client closes the socket, dropping frames
    pub async fn closed(&mut self) {
        tokio::time::timeout(WAIT, async {
            while self.incoming.recv().await.is_some() {}
        })
        .await
        .expect("client never closed the socket");
    }
}

/// Offer frame as the relay forwards it
pub fn offer_frame(sdp: &str) -> Value {
    json!({"sdp": {"type": "offer", "sdp": sdp}})
}

/// Remote candidate frame as the relay forwards it
pub fn ice_frame(candidate: &str) -> Value {
    json!({"ice": {"candidate": candidate, "sdpMid": "0", "sdpMLineIndex": 0}})
}

/// One call made on a [`RecordingPeer`]
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCall {
    Create(String),
    SetRemote(SdpType),
    CreateAnswer,
    AddIce(String),
    AddLocalMedia,
    Close,
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<PeerCall>>,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
}

impl Recorder {
    fn record(&self, call: PeerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Fake peer factory recording every call on the peers it creates
#[derive(Clone, Default)]
pub struct RecordingPeerFactory {
    recorder: Arc<Recorder>,
    fail_remote_description: bool,
}

impl RecordingPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers reject every remote description
    pub fn failing_remote_description() -> Self {
        Self {
            fail_remote_description: true,
            ..Self::default()
        }
    }

    /// Calls recorded so far, in order
    pub fn calls(&self) -> Vec<PeerCall> {
        self.recorder.calls.lock().unwrap().clone()
    }

    /// Number of peers created
    pub fn created(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, PeerCall::Create(_)))
            .count()
    }

    /// Raise an event on the most recently created peer
    pub fn emit(&self, event: PeerEvent) {
        let events = self.recorder.events.lock().unwrap();
        events
            .as_ref()
            .expect("no peer created yet")
            .send(event)
            .expect("client dropped peer events");
    }
}

struct RecordingPeer {
    recorder: Arc<Recorder>,
    fail_remote_description: bool,
}

#[async_trait]
impl PeerFactory for RecordingPeerFactory {
    async fn create(
        &self,
        remote_peer_id: &str,
        _settings: &PeerSettings,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> pipeline_viewer::Result<Arc<dyn AnswererPeer>> {
        self.recorder
            .record(PeerCall::Create(remote_peer_id.to_string()));
        *self.recorder.events.lock().unwrap() = Some(events);
        Ok(Arc::new(RecordingPeer {
            recorder: Arc::clone(&self.recorder),
            fail_remote_description: self.fail_remote_description,
        }))
    }
}

#[async_trait]
impl AnswererPeer for RecordingPeer {
    async fn set_remote_description(&self, desc: SessionDescription) -> pipeline_viewer::Result<()> {
        self.recorder.record(PeerCall::SetRemote(desc.sdp_type));
        if self.fail_remote_description {
            return Err(pipeline_viewer::Error::SdpError(
                "rejected remote description".to_string(),
            ));
        }
        Ok(())
    }

    async fn create_answer(&self) -> pipeline_viewer::Result<SessionDescription> {
        self.recorder.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer("v=0 recorded-answer"))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> pipeline_viewer::Result<()> {
        self.recorder.record(PeerCall::AddIce(candidate.candidate));
        Ok(())
    }

    async fn stats(&self) -> pipeline_viewer::Result<StatsSample> {
        Ok(StatsSample::default())
    }

    async fn add_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> pipeline_viewer::Result<LocalMedia> {
        self.recorder.record(PeerCall::AddLocalMedia);
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(LocalTrack::detached(MediaKind::Video, "video-recorded"));
        }
        if constraints.audio {
            tracks.push(LocalTrack::detached(MediaKind::Audio, "audio-recorded"));
        }
        Ok(LocalMedia::new(tracks))
    }

    async fn close(&self) -> pipeline_viewer::Result<()> {
        self.recorder.record(PeerCall::Close);
        Ok(())
    }
}

/// Recorded traffic and scripts of [`PipelineServerStub`]
#[derive(Default)]
pub struct PipelineServerState {
    /// Id returned by the next launch
    pub next_id: String,
    /// Status bodies served to the next launched instance
    pub launch_script: Vec<Value>,
    /// Status bodies per known instance; the last one repeats
    pub instances: HashMap<String, VecDeque<Value>>,
    /// `(pipeline, body)` of every launch
    pub launches: Vec<(String, Value)>,
    /// Ids of every stop request
    pub stops: Vec<String>,
    /// Number of status requests
    pub status_requests: usize,
}

type Shared = Arc<Mutex<PipelineServerState>>;

/// Pipeline server REST stub
pub struct PipelineServerStub {
    base_url: String,
    state: Shared,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PipelineServerStub {
    /// Start the stub; launches return `next_id` and then serve `script` as status bodies
    pub async fn start(next_id: &str, script: Vec<Value>) -> anyhow::Result<Self> {
        let state: Shared = Arc::new(Mutex::new(PipelineServerState {
            next_id: next_id.to_string(),
            launch_script: script,
            ..PipelineServerState::default()
        }));

        let app = Router::new()
            .route("/pipelines", get(list_pipelines))
            .route("/pipelines/:name/:version", post(launch))
            .route("/pipelines/:name", axum::routing::delete(stop))
            .route("/pipelines/status/:id", get(status))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await;
        });

        Ok(Self {
            base_url,
            state,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    /// Base URL, e.g. `http://127.0.0.1:12345`
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Make `id` known with the given status bodies
    pub fn register(&self, id: &str, script: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(id.to_string(), script.into());
    }

    pub fn launches(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().launches.clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.state.lock().unwrap().stops.clone()
    }

    pub fn status_requests(&self) -> usize {
        self.state.lock().unwrap().status_requests
    }
}

impl Drop for PipelineServerStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}

fn invalid_instance() -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, "\"Invalid instance\"".to_string())
}

async fn list_pipelines() -> Json<Value> {
    Json(json!([
        {"name": "object_detection", "version": "1", "type": "GStreamer"},
        {"name": "audio_detection", "version": "environment", "type": "GStreamer"}
    ]))
}

async fn launch(
    State(state): State<Shared>,
    Path((name, version)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> String {
    let mut state = state.lock().unwrap();
    state.launches.push((format!("{}/{}", name, version), body));
    let id = state.next_id.clone();
    if !id.is_empty() {
        let script = state.launch_script.clone();
        state.instances.insert(id.clone(), script.into());
    }
    format!("\"{}\"\n", id)
}

async fn status(State(state): State<Shared>, Path(id): Path<String>) -> (StatusCode, String) {
    let mut state = state.lock().unwrap();
    state.status_requests += 1;
    let Some(script) = state.instances.get_mut(&id) else {
        return invalid_instance();
    };
    let body = if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    };
    match body {
        Some(body) => (StatusCode::OK, body.to_string()),
        None => invalid_instance(),
    }
}

async fn stop(State(state): State<Shared>, Path(id): Path<String>) -> (StatusCode, String) {
    let mut state = state.lock().unwrap();
    if !state.instances.contains_key(&id) {
        return invalid_instance();
    }
    state.stops.push(id.clone());
    (StatusCode::OK, format!("\"{}\"", id))
}
