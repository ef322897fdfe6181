//! Pipeline instance state

use serde::Deserialize;

/// Server-assigned instance identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceRef {
    /// Id returned by the server
    Known(String),
    /// Instance exists but its id was never learned; cannot be polled or stopped
    Unknown,
}

impl InstanceRef {
    /// Identity for an externally supplied instance id; blank ids become [`InstanceRef::Unknown`]
    pub fn external(instance_id: Option<&str>) -> Self {
        match instance_id.map(str::trim) {
            Some(id) if !id.is_empty() && id != "unknown" => InstanceRef::Known(id.to_string()),
            _ => InstanceRef::Unknown,
        }
    }

    /// The id, when known
    pub fn id(&self) -> Option<&str> {
        match self {
            InstanceRef::Known(id) => Some(id),
            InstanceRef::Unknown => None,
        }
    }
}

impl std::fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceRef::Known(id) => write!(f, "{}", id),
            InstanceRef::Unknown => write!(f, "unknown"),
        }
    }
}

/// Client-side lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Nothing launched
    NotLaunched,
    /// Launch requested, server not yet running it
    Launching,
    /// Server reported RUNNING
    Running,
    /// Server reported COMPLETED
    Completed,
    /// Server reported ABORTED or ERROR, or the launch returned no id
    Aborted,
    /// Stopped by this client
    Stopped,
    /// Server does not know the instance
    InvalidInstance,
}

impl InstanceState {
    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Completed
                | InstanceState::Aborted
                | InstanceState::Stopped
                | InstanceState::InvalidInstance
        )
    }

    /// Status polling runs only in these states
    pub fn is_pollable(&self) -> bool {
        matches!(self, InstanceState::Launching | InstanceState::Running)
    }

    fn rank(&self) -> u8 {
        match self {
            InstanceState::NotLaunched => 0,
            InstanceState::Launching => 1,
            InstanceState::Running => 2,
            _ => 3,
        }
    }
}

/// State string reported by the pipeline server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    /// QUEUED
    Queued,
    /// RUNNING
    Running,
    /// COMPLETED
    Completed,
    /// ERROR
    Error,
    /// ABORTED
    Aborted,
    /// Anything else
    Other(String),
}

impl ServerState {
    /// Parse a server state string
    pub fn parse(state: &str) -> Self {
        match state {
            "QUEUED" => ServerState::Queued,
            "RUNNING" => ServerState::Running,
            "COMPLETED" => ServerState::Completed,
            "ERROR" => ServerState::Error,
            "ABORTED" => ServerState::Aborted,
            other => ServerState::Other(other.to_string()),
        }
    }
}

/// Body of a successful status response
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StatusReport {
    /// Server state string
    pub state: Option<String>,
    /// Average frames per second
    pub avg_fps: Option<f64>,
    /// Seconds since start
    pub elapsed_time: Option<f64>,
    /// Instance id as echoed by the server (string or number)
    pub id: Option<serde_json::Value>,
}

impl StatusReport {
    /// `Pipeline State: RUNNING    29.97 fps (avg)   Elapsed: 12s`
    pub fn status_line(&self) -> String {
        format!(
            "Pipeline State: {}    {:.2} fps (avg)   Elapsed: {:.0}s",
            self.state.as_deref().unwrap_or("null"),
            self.avg_fps.unwrap_or(f64::NAN),
            self.elapsed_time.unwrap_or(f64::NAN)
        )
    }
}

/// Status line for a rejected poll
pub fn error_status_line(body: &str, http_status: u16) -> String {
    format!("Pipeline State: {}    http_status: {}", body, http_status)
}

/// Last polled throughput snapshot
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PipelineMetrics {
    /// Average frames per second
    pub average_fps: f64,
    /// Seconds since start
    pub elapsed_seconds: f64,
}

/// A launched or attached pipeline instance
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineInstance {
    instance: Option<InstanceRef>,
    pipeline_name: String,
    media_source_uri: String,
    destination_peer_id: String,
    state: InstanceState,
    metrics: PipelineMetrics,
}

impl Default for PipelineInstance {
    fn default() -> Self {
        Self {
            instance: None,
            pipeline_name: String::new(),
            media_source_uri: String::new(),
            destination_peer_id: String::new(),
            state: InstanceState::NotLaunched,
            metrics: PipelineMetrics::default(),
        }
    }
}

impl PipelineInstance {
    /// A launch that has been requested but not yet answered
    pub fn launching(
        pipeline_name: impl Into<String>,
        media_source_uri: impl Into<String>,
        destination_peer_id: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            media_source_uri: media_source_uri.into(),
            destination_peer_id: destination_peer_id.into(),
            state: InstanceState::Launching,
            ..Default::default()
        }
    }

    /// An instance launched elsewhere.
    ///
    /// Known instances start in `Launching` until a poll says otherwise;
    /// unknown ones are assumed running since they can never be polled.
    pub fn attached(instance: InstanceRef, destination_peer_id: impl Into<String>) -> Self {
        let state = match instance {
            InstanceRef::Known(_) => InstanceState::Launching,
            InstanceRef::Unknown => InstanceState::Running,
        };
        Self {
            instance: Some(instance),
            destination_peer_id: destination_peer_id.into(),
            state,
            ..Default::default()
        }
    }

    /// Instance identity, once assigned
    pub fn instance(&self) -> Option<&InstanceRef> {
        self.instance.as_ref()
    }

    /// Pipeline `name/version`
    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    /// Media source URI
    pub fn media_source_uri(&self) -> &str {
        &self.media_source_uri
    }

    /// Frame destination peer id
    pub fn destination_peer_id(&self) -> &str {
        &self.destination_peer_id
    }

    /// Lifecycle state
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Last polled metrics
    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics
    }

    /// True when a status poll should be issued
    pub fn should_poll(&self) -> bool {
        self.state.is_pollable() && matches!(self.instance, Some(InstanceRef::Known(_)))
    }

    /// Record the id returned by a launch. An empty id aborts the instance.
    pub fn assign_instance(&mut self, raw_id: &str) -> bool {
        if self.instance.is_some() || self.state.is_terminal() {
            return false;
        }
        if raw_id.is_empty() {
            self.mark_aborted();
            return false;
        }
        self.instance = Some(InstanceRef::Known(raw_id.to_string()));
        true
    }

    /// Apply a successful status report; returns the new state when it changed
    pub fn apply_status(&mut self, report: &StatusReport) -> Option<InstanceState> {
        if self.state.is_terminal() {
            return None;
        }

        if let Some(fps) = report.avg_fps {
            self.metrics.average_fps = fps;
        }
        if let Some(elapsed) = report.elapsed_time {
            self.metrics.elapsed_seconds = elapsed;
        }

        let next = match report.state.as_deref().map(ServerState::parse) {
            Some(ServerState::Queued) => InstanceState::Launching,
            Some(ServerState::Running) => InstanceState::Running,
            Some(ServerState::Completed) => InstanceState::Completed,
            Some(ServerState::Aborted) | Some(ServerState::Error) => InstanceState::Aborted,
            Some(ServerState::Other(_)) | None => return None,
        };

        if self.transition(next) {
            Some(next)
        } else {
            None
        }
    }

    /// Server does not know the instance
    pub fn mark_invalid(&mut self) -> bool {
        self.transition(InstanceState::InvalidInstance)
    }

    /// Launch failed
    pub fn mark_aborted(&mut self) -> bool {
        self.transition(InstanceState::Aborted)
    }

    /// Stopped by this client
    pub fn mark_stopped(&mut self) -> bool {
        self.transition(InstanceState::Stopped)
    }

    fn transition(&mut self, next: InstanceState) -> bool {
        if self.state.is_terminal() || next.rank() < self.state.rank() || next == self.state {
            return false;
        }
        self.state = next;
        true
    }
}
