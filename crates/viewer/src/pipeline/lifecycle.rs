//! Pipeline instance lifecycle: launch, status poll, stop

use super::api::{
    LaunchRequest, PipelineDescriptor, PipelineServerApi, StatusResponse, INVALID_INSTANCE,
};
use super::instance::{error_status_line, InstanceRef, InstanceState, PipelineInstance};
use crate::config::ViewerConfig;
use crate::notice::{Notice, NoticeSink};
use crate::signaling::RetryControl;
use crate::timer::TimerHandle;
use crate::{Error, Result};
use rand::Rng;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// Placeholder in a destination peer id replaced by a random number
pub const RANDOM_PLACEHOLDER: &str = "$RANDOM";

/// Visualization hint shown once an instance reaches a terminal server state
pub const LAUNCH_NEW_PIPELINE: &str = "Launch a new pipeline...";

/// Launch parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    /// Pipeline `name/version`
    pub pipeline_name: String,
    /// Media source URI
    pub media_source_uri: String,
    /// Frame destination peer id; may contain `$RANDOM`
    pub destination_peer_id: String,
    /// Pace frames to source and destination
    pub sync_playback: bool,
}

/// Replace the first `$RANDOM` with a random integer in `[0, 100000)`
pub fn expand_peer_id_template(template: &str) -> String {
    if !template.contains(RANDOM_PLACEHOLDER) {
        return template.to_string();
    }
    let n: u32 = rand::thread_rng().gen_range(0..100_000);
    template.replacen(RANDOM_PLACEHOLDER, &n.to_string(), 1)
}

struct Inner {
    api: Arc<dyn PipelineServerApi>,
    retry: OnceLock<Arc<dyn RetryControl>>,
    notices: NoticeSink,
    poll_interval: Duration,
    metadata: serde_json::Value,
    parameters: serde_json::Value,
    instance: RwLock<PipelineInstance>,
    state_tx: watch::Sender<InstanceState>,
}

/// Owns one pipeline instance at a time
pub struct PipelineLifecycleManager {
    inner: Arc<Inner>,
    poll: Mutex<Option<TimerHandle>>,
}

impl PipelineLifecycleManager {
    /// Create a manager for the server behind `api`
    pub fn new(api: Arc<dyn PipelineServerApi>, config: &ViewerConfig, notices: NoticeSink) -> Self {
        let (state_tx, _) = watch::channel(InstanceState::NotLaunched);
        Self {
            inner: Arc::new(Inner {
                api,
                retry: OnceLock::new(),
                notices,
                poll_interval: config.polling.status_interval(),
                metadata: config.pipeline_server.metadata_destination.clone(),
                parameters: config.pipeline_server.parameters.clone(),
                instance: RwLock::new(PipelineInstance::default()),
                state_tx,
            }),
            poll: Mutex::new(None),
        }
    }

    /// Couple to a signaling session's retry counter
    pub fn with_retry_control(self, retry: Arc<dyn RetryControl>) -> Self {
        if self.inner.retry.set(retry).is_err() {
            warn!("Retry control already attached, keeping the first one");
        }
        self
    }

    /// Watch instance state changes
    pub fn subscribe(&self) -> watch::Receiver<InstanceState> {
        self.inner.state_tx.subscribe()
    }

    /// Snapshot of the current instance
    pub async fn instance(&self) -> PipelineInstance {
        self.inner.instance.read().await.clone()
    }

    /// Peer id the pipeline streams frames to, once known
    pub async fn destination_peer_id(&self) -> Option<String> {
        let instance = self.inner.instance.read().await;
        let peer = instance.destination_peer_id();
        if peer.is_empty() || instance.state() == InstanceState::NotLaunched {
            None
        } else {
            Some(peer.to_string())
        }
    }

    /// Base URL of the pipeline server
    pub fn server_url(&self) -> &str {
        self.inner.api.base_url()
    }

    /// True while the status poll task runs
    pub async fn is_polling(&self) -> bool {
        self.poll
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Available pipelines
    pub async fn list_pipelines(&self) -> Result<Vec<PipelineDescriptor>> {
        let pipelines = self.inner.api.list_pipelines().await?;
        for pipeline in &pipelines {
            debug!("Pipeline available: {}", pipeline.identifier());
        }
        Ok(pipelines)
    }

    /// Launch a pipeline instance and start polling it.
    ///
    /// # Errors
    ///
    /// [`Error::MissingParameter`] before any request when a parameter is
    /// empty; [`Error::RemoteRejection`] when the server returns no id.
    #[instrument(skip(self), fields(pipeline = %params.pipeline_name))]
    pub async fn launch(&self, params: LaunchParams) -> Result<InstanceRef> {
        let missing = if params.pipeline_name.trim().is_empty() {
            Some(("pipeline", "You must specify a pipeline!"))
        } else if params.media_source_uri.trim().is_empty() {
            Some(("media_source_uri", "You must specify a media source!"))
        } else if params.destination_peer_id.trim().is_empty() {
            Some(("destination_peer_id", "You must specify a destination peer id!"))
        } else {
            None
        };
        if let Some((name, message)) = missing {
            self.inner.notices.error(message);
            return Err(Error::MissingParameter(name));
        }

        self.stop_polling().await;

        let destination_peer_id = expand_peer_id_template(&params.destination_peer_id);
        *self.inner.instance.write().await = PipelineInstance::launching(
            params.pipeline_name.clone(),
            params.media_source_uri.clone(),
            destination_peer_id.clone(),
        );
        self.inner.publish(InstanceState::Launching);

        if let Some(retry) = self.inner.retry.get() {
            retry.reset_retries().await;
        }

        let request = LaunchRequest::new(
            params.media_source_uri,
            destination_peer_id.clone(),
            params.sync_playback,
            self.inner.metadata.clone(),
            self.inner.parameters.clone(),
        );

        let raw_id = match self
            .inner
            .api
            .create_instance(&params.pipeline_name, &request)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.inner.abort_launch().await;
                self.inner
                    .notices
                    .error(format!("ERROR launching Pipeline Server pipeline instance: {}", e));
                return Err(e);
            }
        };

        let assigned = self.inner.instance.write().await.assign_instance(&raw_id);
        if !assigned {
            self.inner.publish(InstanceState::Aborted);
            self.inner
                .notices
                .error("ERROR launching Pipeline Server pipeline instance!");
            return Err(Error::RemoteRejection(
                "pipeline server returned no instance id".to_string(),
            ));
        }

        info!(
            "Pipeline Server instance: {} was launched with destination_peerid: {}.",
            raw_id, destination_peer_id
        );
        self.inner.notices.visualization(format!(
            "Stream may be viewed with instance_id={} destination_peer_id={}",
            raw_id, destination_peer_id
        ));

        self.start_polling().await;
        Ok(InstanceRef::Known(raw_id))
    }

    /// Track an instance launched elsewhere.
    ///
    /// A missing instance id yields [`InstanceRef::Unknown`]: the session can
    /// still be viewed, but the instance is never polled or stopped.
    pub async fn attach(
        &self,
        instance_id: Option<&str>,
        destination_peer_id: &str,
    ) -> Result<InstanceRef> {
        if destination_peer_id.trim().is_empty() {
            return Err(Error::MissingParameter("destination_peer_id"));
        }

        self.stop_polling().await;

        let instance = InstanceRef::external(instance_id);
        let attached = PipelineInstance::attached(instance.clone(), destination_peer_id);
        let state = attached.state();
        *self.inner.instance.write().await = attached;
        self.inner.publish(state);

        match &instance {
            InstanceRef::Known(id) => {
                info!("Attached to pipeline instance {} ({})", id, destination_peer_id);
                self.start_polling().await;
            }
            InstanceRef::Unknown => {
                self.inner.notices.visualization(
                    "Pipeline Server instance_id is unknown; status will not be polled",
                );
            }
        }
        Ok(instance)
    }

    /// One status request for `instance_id`, rendered as a status line
    pub async fn query_status(&self, instance_id: &str) -> Result<String> {
        Ok(match self.inner.api.status(instance_id).await? {
            StatusResponse::Report(report) => report.status_line(),
            StatusResponse::InvalidInstance { http_status } => {
                error_status_line(INVALID_INSTANCE, http_status)
            }
            StatusResponse::Rejected { http_status, body } => error_status_line(&body, http_status),
        })
    }

    /// Stop the current instance.
    ///
    /// # Errors
    ///
    /// [`Error::NoActiveInstance`] without any request when there is no
    /// instance or its id is unknown.
    pub async fn stop(&self) -> Result<String> {
        let instance = self.inner.instance.read().await.instance().cloned();
        self.stop_ref(instance).await
    }

    /// Stop an instance by id; `"unknown"` is refused like an unknown current instance
    pub async fn stop_external(&self, instance_id: Option<&str>) -> Result<String> {
        let instance = match instance_id.map(str::trim) {
            None | Some("") => None,
            Some(id) => Some(InstanceRef::external(Some(id))),
        };
        self.stop_ref(instance).await
    }

    async fn stop_ref(&self, instance: Option<InstanceRef>) -> Result<String> {
        let id = match instance {
            Some(InstanceRef::Known(id)) if !id.is_empty() => id,
            Some(InstanceRef::Unknown) => {
                self.inner
                    .notices
                    .error("Pipeline Server instance_id was created offline (it is unknown)");
                return Err(Error::NoActiveInstance("instance id is unknown".to_string()));
            }
            _ => {
                self.inner
                    .notices
                    .error("No active Pipeline Server pipeline instance!");
                self.stop_polling().await;
                return Err(Error::NoActiveInstance("no instance launched".to_string()));
            }
        };

        self.inner.notices.visualization(format!(
            "Stopping primary pipeline ({}/pipelines/{})...",
            self.inner.api.base_url(),
            id
        ));
        let ack = self.inner.api.stop(&id).await?;
        debug!("Stop acknowledged: {}", ack.trim());

        let stopped = {
            let mut current = self.inner.instance.write().await;
            current.instance().and_then(InstanceRef::id) == Some(id.as_str())
                && current.mark_stopped()
        };
        if stopped {
            self.inner.publish(InstanceState::Stopped);
            self.stop_polling().await;
        }
        Ok(ack)
    }

    /// Cancel the status poll, if running
    pub async fn stop_polling(&self) {
        if let Some(handle) = self.poll.lock().await.take() {
            debug!("Cancelled {} task", handle.name());
            handle.cancel();
        }
    }

    async fn start_polling(&self) {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + inner.poll_interval;
            let mut ticker = tokio::time::interval_at(start, inner.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !inner.poll_once().await {
                    debug!("Status polling finished");
                    break;
                }
            }
        });
        *self.poll.lock().await = Some(TimerHandle::from_task("status-poll", task));
    }
}

impl Inner {
    fn publish(&self, state: InstanceState) {
        self.state_tx.send_replace(state);
    }

    async fn abort_launch(&self) {
        if self.instance.write().await.mark_aborted() {
            self.publish(InstanceState::Aborted);
        }
    }

    /// One poll; returns false once polling should end
    async fn poll_once(&self) -> bool {
        let id = {
            let instance = self.instance.read().await;
            if !instance.should_poll() {
                return false;
            }
            match instance.instance().and_then(InstanceRef::id) {
                Some(id) => id.to_string(),
                None => return false,
            }
        };

        match self.api.status(&id).await {
            Ok(StatusResponse::Report(report)) => {
                self.notices.emit(Notice::PipelineStatus(report.status_line()));
                let changed = self.instance.write().await.apply_status(&report);
                match changed {
                    Some(state @ (InstanceState::Completed | InstanceState::Aborted)) => {
                        info!(
                            "Pipeline state is {:?}, so will no longer query for pipeline status for instance {}.",
                            state, id
                        );
                        self.publish(state);
                        if let Some(retry) = self.retry.get() {
                            retry.expire_retries().await;
                        }
                        self.notices.visualization(LAUNCH_NEW_PIPELINE);
                        false
                    }
                    Some(state) => {
                        self.publish(state);
                        true
                    }
                    None => true,
                }
            }
            Ok(StatusResponse::InvalidInstance { http_status }) => {
                self.notices.emit(Notice::PipelineStatus(error_status_line(
                    INVALID_INSTANCE,
                    http_status,
                )));
                if self.instance.write().await.mark_invalid() {
                    self.publish(InstanceState::InvalidInstance);
                }
                false
            }
            Ok(StatusResponse::Rejected { http_status, body }) => {
                self.notices
                    .emit(Notice::PipelineStatus(error_status_line(&body, http_status)));
                true
            }
            Err(e) => {
                warn!("Status poll for instance {} failed: {}", id, e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::notice_channel;
    use crate::pipeline::instance::StatusReport;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct ScriptedServer {
        launch_id: String,
        statuses: std::sync::Mutex<VecDeque<StatusResponse>>,
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedServer {
        fn new(launch_id: &str, statuses: Vec<StatusResponse>) -> Arc<Self> {
            Arc::new(Self {
                launch_id: launch_id.to_string(),
                statuses: std::sync::Mutex::new(statuses.into()),
                calls: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PipelineServerApi for ScriptedServer {
        fn base_url(&self) -> &str {
            "http://scripted"
        }

        async fn list_pipelines(&self) -> Result<Vec<PipelineDescriptor>> {
            self.calls.lock().unwrap().push("list".to_string());
            Ok(Vec::new())
        }

        async fn create_instance(&self, pipeline: &str, request: &LaunchRequest) -> Result<String> {
            self.calls.lock().unwrap().push(format!(
                "create {} {}",
                pipeline, request.destination.frame.peer_id
            ));
            Ok(self.launch_id.clone())
        }

        async fn status(&self, instance_id: &str) -> Result<StatusResponse> {
            self.calls.lock().unwrap().push(format!("status {}", instance_id));
            match self.statuses.lock().unwrap().pop_front() {
                Some(response) => Ok(response),
                None => Err(Error::Transient("no scripted response".to_string())),
            }
        }

        async fn stop(&self, instance_id: &str) -> Result<String> {
            self.calls.lock().unwrap().push(format!("stop {}", instance_id));
            Ok("\"stopped\"".to_string())
        }
    }

    #[derive(Default)]
    struct CountingRetry {
        expired: AtomicU32,
        reset: AtomicU32,
    }

    #[async_trait]
    impl RetryControl for CountingRetry {
        async fn expire_retries(&self) {
            self.expired.fetch_add(1, Ordering::SeqCst);
        }

        async fn reset_retries(&self) {
            self.reset.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn params() -> LaunchParams {
        LaunchParams {
            pipeline_name: "object_detection/1".to_string(),
            media_source_uri: "https://example/video.mp4".to_string(),
            destination_peer_id: "1234".to_string(),
            sync_playback: true,
        }
    }

    fn running() -> StatusResponse {
        StatusResponse::Report(StatusReport {
            state: Some("RUNNING".to_string()),
            avg_fps: Some(29.97),
            elapsed_time: Some(12.0),
            id: None,
        })
    }

    fn completed() -> StatusResponse {
        StatusResponse::Report(StatusReport {
            state: Some("COMPLETED".to_string()),
            ..Default::default()
        })
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Notice>) -> Vec<Notice> {
        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        notices
    }

    #[tokio::test]
    async fn test_missing_parameters_fail_before_any_request() {
        let server = ScriptedServer::new("abc-1", vec![]);
        let manager =
            PipelineLifecycleManager::new(server.clone(), &ViewerConfig::default(), NoticeSink::log_only());

        for (field, expected) in [
            ("pipeline", "pipeline"),
            ("source", "media_source_uri"),
            ("peer", "destination_peer_id"),
        ] {
            let mut p = params();
            match field {
                "pipeline" => p.pipeline_name.clear(),
                "source" => p.media_source_uri.clear(),
                _ => p.destination_peer_id.clear(),
            }
            let err = manager.launch(p).await.unwrap_err();
            assert!(matches!(err, Error::MissingParameter(name) if name == expected));
        }

        assert!(server.calls().is_empty());
        assert_eq!(manager.instance().await.state(), InstanceState::NotLaunched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_then_running_status_line() {
        let server = ScriptedServer::new("abc-1", vec![running()]);
        let retry = Arc::new(CountingRetry::default());
        let (notices, mut rx) = notice_channel();
        let manager = PipelineLifecycleManager::new(server.clone(), &ViewerConfig::default(), notices)
            .with_retry_control(retry.clone());

        let instance = manager.launch(params()).await.unwrap();
        assert_eq!(instance, InstanceRef::Known("abc-1".to_string()));
        assert_eq!(retry.reset.load(Ordering::SeqCst), 1);
        assert_eq!(manager.destination_peer_id().await.as_deref(), Some("1234"));

        tokio::time::sleep(Duration::from_millis(3100)).await;

        let lines: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|n| match n {
                Notice::PipelineStatus(line) => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("RUNNING"));
        assert!(lines[0].contains("29.97"));
        assert_eq!(manager.instance().await.state(), InstanceState::Running);
        assert_eq!(
            server.calls(),
            vec!["create object_detection/1 1234".to_string(), "status abc-1".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_stops_polling_and_expires_retries() {
        let server = ScriptedServer::new("abc-1", vec![running(), completed(), running()]);
        let retry = Arc::new(CountingRetry::default());
        let (notices, mut rx) = notice_channel();
        let manager = PipelineLifecycleManager::new(server.clone(), &ViewerConfig::default(), notices)
            .with_retry_control(retry.clone());
        let mut states = manager.subscribe();

        manager.launch(params()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(6100)).await;

        assert_eq!(manager.instance().await.state(), InstanceState::Completed);
        assert_eq!(*states.borrow_and_update(), InstanceState::Completed);
        assert_eq!(retry.expired.load(Ordering::SeqCst), 1);
        assert!(drain(&mut rx).contains(&Notice::Visualization(LAUNCH_NEW_PIPELINE.to_string())));

        tokio::time::sleep(Duration::from_secs(9)).await;
        let polls = server.calls().iter().filter(|c| c.starts_with("status")).count();
        assert_eq!(polls, 2);
        assert!(!manager.is_polling().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_keep_polling() {
        let server = ScriptedServer::new(
            "abc-1",
            vec![
                StatusResponse::Rejected {
                    http_status: 503,
                    body: "busy".to_string(),
                },
                running(),
            ],
        );
        let (notices, mut rx) = notice_channel();
        let manager = PipelineLifecycleManager::new(server.clone(), &ViewerConfig::default(), notices);

        manager.launch(params()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(6100)).await;

        assert!(drain(&mut rx).contains(&Notice::PipelineStatus(
            "Pipeline State: busy    http_status: 503".to_string()
        )));
        assert_eq!(manager.instance().await.state(), InstanceState::Running);
        assert!(manager.is_polling().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_instance_is_terminal() {
        let server = ScriptedServer::new(
            "abc-1",
            vec![StatusResponse::InvalidInstance { http_status: 400 }, running()],
        );
        let manager =
            PipelineLifecycleManager::new(server.clone(), &ViewerConfig::default(), NoticeSink::log_only());

        manager.launch(params()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(manager.instance().await.state(), InstanceState::InvalidInstance);
        let polls = server.calls().iter().filter(|c| c.starts_with("status")).count();
        assert_eq!(polls, 1);
    }

    #[tokio::test]
    async fn test_empty_launch_id_aborts() {
        let server = ScriptedServer::new("", vec![]);
        let manager =
            PipelineLifecycleManager::new(server.clone(), &ViewerConfig::default(), NoticeSink::log_only());

        let err = manager.launch(params()).await.unwrap_err();
        assert!(matches!(err, Error::RemoteRejection(_)));
        assert_eq!(manager.instance().await.state(), InstanceState::Aborted);
        assert!(!manager.is_polling().await);
    }

    #[tokio::test]
    async fn test_stop_unknown_never_calls_server() {
        let server = ScriptedServer::new("abc-1", vec![]);
        let (notices, mut rx) = notice_channel();
        let manager = PipelineLifecycleManager::new(server.clone(), &ViewerConfig::default(), notices);

        manager.attach(None, "1234").await.unwrap();
        let err = manager.stop().await.unwrap_err();
        assert!(matches!(err, Error::NoActiveInstance(_)));

        let err = manager.stop_external(Some("unknown")).await.unwrap_err();
        assert!(matches!(err, Error::NoActiveInstance(_)));

        assert!(server.calls().is_empty());
        assert!(drain(&mut rx).iter().any(|n| matches!(n, Notice::Error(text) if text.contains("unknown"))));
    }

    #[tokio::test]
    async fn test_stop_without_instance() {
        let server = ScriptedServer::new("abc-1", vec![]);
        let manager =
            PipelineLifecycleManager::new(server.clone(), &ViewerConfig::default(), NoticeSink::log_only());

        assert!(matches!(manager.stop().await, Err(Error::NoActiveInstance(_))));
        assert!(matches!(
            manager.stop_external(Some("")).await,
            Err(Error::NoActiveInstance(_))
        ));
        assert!(server.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_marks_stopped_and_ends_polling() {
        let server = ScriptedServer::new("abc-1", vec![running()]);
        let manager =
            PipelineLifecycleManager::new(server.clone(), &ViewerConfig::default(), NoticeSink::log_only());

        manager.launch(params()).await.unwrap();
        manager.stop().await.unwrap();

        assert_eq!(manager.instance().await.state(), InstanceState::Stopped);
        assert!(!manager.is_polling().await);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            server.calls(),
            vec!["create object_detection/1 1234".to_string(), "stop abc-1".to_string()]
        );
    }

    #[test]
    fn test_random_peer_id_template() {
        let expanded = expand_peer_id_template("peer_$RANDOM");
        let n: u32 = expanded.trim_start_matches("peer_").parse().unwrap();
        assert!(n < 100_000);
        assert_eq!(expand_peer_id_template("1234"), "1234");
    }
}
