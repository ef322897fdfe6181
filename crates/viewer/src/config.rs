//! Configuration types for the pipeline viewer

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default signaling relay port
pub const DEFAULT_SIGNALING_PORT: u16 = 8443;

/// Default connect attempt ceiling
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 15;

/// Main configuration for the viewer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Signaling relay location and local identity
    pub signaling: SignalingConfig,

    /// Pipeline server REST endpoint and launch defaults
    pub pipeline_server: PipelineServerConfig,

    /// Reconnect behaviour of the signaling session
    pub retry: RetryConfig,

    /// Poll and sample intervals
    pub polling: PollingConfig,

    /// Media constraints and data channel behaviour
    pub media: MediaConfig,

    /// ICE server URLs handed to the peer connection (empty by default)
    pub ice_servers: Vec<String>,
}

/// Signaling relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Explicit relay host; overrides `origin` resolution when set
    pub server: Option<String>,

    /// Relay port (default: 8443)
    pub port: u16,

    /// Origin the viewer was served from (e.g. `http://host:8082/`).
    /// `file:` origins and an absent origin resolve to `127.0.0.1`.
    pub origin: Option<String>,

    /// Fixed local peer id; a random one in `[10, 9000)` is drawn per attempt when `None`
    pub local_peer_id: Option<String>,
}

/// Pipeline server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineServerConfig {
    /// Base URL (default: `http://localhost:8080`)
    pub base_url: String,

    /// Per-request timeout in seconds (default: 30)
    pub request_timeout_secs: u64,

    /// `destination.metadata` section of launch requests
    pub metadata_destination: serde_json::Value,

    /// `parameters` section of launch requests
    pub parameters: serde_json::Value,
}

/// Signaling reconnect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Reconnect automatically after a session error (default: true)
    pub auto_retry: bool,

    /// Connect attempts allowed before a hard stop (default: 15)
    pub max_attempts: u32,

    /// Delay before an automatic reconnect in milliseconds (default: 2000)
    pub delay_ms: u64,
}

/// Timer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Pipeline status poll interval in milliseconds (default: 3000)
    pub status_interval_ms: u64,

    /// Connection stats sample interval in milliseconds (default: 6000)
    pub stats_interval_ms: u64,

    /// Delay before the first stats sample in milliseconds (default: 4000)
    pub stats_initial_delay_ms: u64,
}

/// Media configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Local capture constraints
    pub constraints: MediaConstraints,

    /// Attach local tracks to the peer connection (default: false)
    pub send_local_media: bool,

    /// Label of the locally created data channel (default: `label`)
    pub data_channel_label: String,

    /// Reply sent on every incoming data channel message
    pub data_channel_greeting: Option<String>,
}

/// Local media constraints, same shape as `getUserMedia` constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture video
    #[serde(default)]
    pub video: bool,
    /// Capture audio
    #[serde(default)]
    pub audio: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: DEFAULT_SIGNALING_PORT,
            origin: None,
            local_peer_id: None,
        }
    }
}

impl Default for PipelineServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout_secs: 30,
            metadata_destination: serde_json::json!({
                "type": "file",
                "path": "/tmp/results.jsonl",
                "format": "json-lines"
            }),
            parameters: serde_json::json!({ "detection-device": "CPU" }),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auto_retry: true,
            max_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
            delay_ms: 2000,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: 3000,
            stats_interval_ms: 6000,
            stats_initial_delay_ms: 4000,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            constraints: MediaConstraints::default(),
            send_local_media: false,
            data_channel_label: "label".to_string(),
            data_channel_greeting: Some("Hi! (from browser)".to_string()),
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: false,
        }
    }
}

impl MediaConstraints {
    /// Parse constraints from their JSON form
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parse constraints, falling back to the defaults on a malformed value.
    ///
    /// The parse error is handed back so the caller can surface it.
    pub fn parse_or_default(text: &str) -> (Self, Option<Error>) {
        match Self::parse(text) {
            Ok(constraints) => (constraints, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    /// True when no track would be captured
    pub fn is_empty(&self) -> bool {
        !self.video && !self.audio
    }
}

impl SignalingConfig {
    /// Resolve the relay WebSocket URL.
    ///
    /// An explicit `server` wins; otherwise the host comes from `origin`.
    pub fn resolve_url(&self) -> Result<String> {
        if let Some(server) = self.server.as_deref().filter(|s| !s.is_empty()) {
            return Ok(format!("ws://{}:{}", server, self.port));
        }

        let host = match self.origin.as_deref() {
            None => "127.0.0.1".to_string(),
            Some(origin) => {
                let parsed = url::Url::parse(origin).map_err(|e| {
                    Error::InvalidConfig(format!("Invalid origin {}: {}", origin, e))
                })?;
                match parsed.scheme() {
                    "file" => "127.0.0.1".to_string(),
                    "http" | "https" => parsed
                        .host_str()
                        .ok_or_else(|| {
                            Error::InvalidConfig(format!("Origin {} has no host", origin))
                        })?
                        .to_string(),
                    _ => {
                        return Err(Error::InvalidConfig(format!(
                            "Don't know how to connect to the signaling server with uri {}",
                            origin
                        )))
                    }
                }
            }
        };

        Ok(format!("ws://{}:{}", host, self.port))
    }
}

impl PipelineServerConfig {
    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl RetryConfig {
    /// Delay before an automatic reconnect
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl PollingConfig {
    /// Pipeline status poll interval
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    /// Stats sample interval
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Delay before the first stats sample
    pub fn stats_initial_delay(&self) -> Duration {
        Duration::from_millis(self.stats_initial_delay_ms)
    }
}

impl ViewerConfig {
    /// Load configuration from a TOML file; missing keys keep their defaults
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text).map_err(|e| match e {
            Error::InvalidConfig(msg) => {
                Error::InvalidConfig(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the pipeline server URL is not http(s)
    /// - the signaling port is 0 or the relay URL cannot be resolved
    /// - `retry.max_attempts` is 0
    /// - any poll interval is 0
    /// - an ICE server URL has no `stun:`/`turn:`/`turns:` scheme
    pub fn validate(&self) -> Result<()> {
        let base_url = &self.pipeline_server.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::InvalidConfig(format!(
                "pipeline_server.base_url must start with http:// or https://, got {}",
                base_url
            )));
        }

        if self.signaling.port == 0 {
            return Err(Error::InvalidConfig(
                "signaling.port must be non-zero".to_string(),
            ));
        }
        self.signaling.resolve_url()?;

        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.polling.status_interval_ms == 0 || self.polling.stats_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "poll intervals must be non-zero".to_string(),
            ));
        }

        if let Some(bad) = self.ice_servers.iter().find(|url| {
            !url.starts_with("stun:") && !url.starts_with("turn:") && !url.starts_with("turns:")
        }) {
            return Err(Error::InvalidConfig(format!(
                "ice server must start with stun:, turn: or turns:, got {}",
                bad
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ViewerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 15);
        assert_eq!(config.polling.status_interval(), Duration::from_secs(3));
        assert_eq!(config.polling.stats_interval(), Duration::from_secs(6));
    }

    #[test]
    fn test_resolve_url_without_origin_uses_loopback() {
        let signaling = SignalingConfig::default();
        assert_eq!(signaling.resolve_url().unwrap(), "ws://127.0.0.1:8443");
    }

    #[test]
    fn test_resolve_url_from_http_origin() {
        let signaling = SignalingConfig {
            origin: Some("http://viewer.local:8082/index.html".to_string()),
            ..Default::default()
        };
        assert_eq!(signaling.resolve_url().unwrap(), "ws://viewer.local:8443");
    }

    #[test]
    fn test_resolve_url_from_file_origin() {
        let signaling = SignalingConfig {
            origin: Some("file:///home/user/index.html".to_string()),
            ..Default::default()
        };
        assert_eq!(signaling.resolve_url().unwrap(), "ws://127.0.0.1:8443");
    }

    #[test]
    fn test_explicit_server_overrides_origin() {
        let signaling = SignalingConfig {
            server: Some("relay".to_string()),
            port: 9000,
            origin: Some("http://viewer.local/".to_string()),
            ..Default::default()
        };
        assert_eq!(signaling.resolve_url().unwrap(), "ws://relay:9000");
    }

    #[test]
    fn test_unsupported_origin_scheme_fails() {
        let signaling = SignalingConfig {
            origin: Some("ftp://viewer.local/".to_string()),
            ..Default::default()
        };
        assert!(signaling.resolve_url().is_err());
    }

    #[test]
    fn test_invalid_pipeline_server_url_fails() {
        let mut config = ViewerConfig::default();
        config.pipeline_server.base_url = "localhost:8080".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_attempts_fails() {
        let mut config = ViewerConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_ice_server_fails() {
        let mut config = ViewerConfig::default();
        config.ice_servers = vec!["stun.l.google.com:19302".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_constraints_fallback() {
        let (constraints, err) = MediaConstraints::parse_or_default("{video: yes}");
        assert_eq!(constraints, MediaConstraints::default());
        assert!(err.is_some());

        let (constraints, err) = MediaConstraints::parse_or_default(r#"{"video": false, "audio": true}"#);
        assert!(!constraints.video);
        assert!(constraints.audio);
        assert!(err.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ViewerConfig::from_toml_str(
            r#"
            [signaling]
            server = "relay.example"

            [retry]
            auto_retry = false
            "#,
        )
        .unwrap();

        assert_eq!(config.signaling.server.as_deref(), Some("relay.example"));
        assert_eq!(config.signaling.port, DEFAULT_SIGNALING_PORT);
        assert!(!config.retry.auto_retry);
        assert_eq!(config.retry.max_attempts, DEFAULT_MAX_CONNECT_ATTEMPTS);
        assert_eq!(config.pipeline_server.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_toml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewer.toml");
        std::fs::write(&path, "[pipeline_server]\nbase_url = \"http://pipelines:8080\"\n").unwrap();

        let config = ViewerConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.pipeline_server.base_url, "http://pipelines:8080");
        assert!(config.validate().is_ok());
    }
}
