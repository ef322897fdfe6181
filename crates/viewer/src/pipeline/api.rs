//! Pipeline server REST client
//!
//! Consumes the pipeline server's REST surface:
//!
//! - `GET /pipelines` lists available pipelines
//! - `POST /pipelines/{name}/{version}` launches an instance
//! - `GET /pipelines/status/{id}` polls an instance
//! - `DELETE /pipelines/{id}` stops an instance

use super::instance::StatusReport;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Marker body returned for ids the server does not know
pub const INVALID_INSTANCE: &str = "Invalid instance";

/// One entry of `GET /pipelines`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PipelineDescriptor {
    /// Pipeline name
    pub name: String,
    /// Pipeline version (string or number on the wire)
    pub version: serde_json::Value,
}

impl PipelineDescriptor {
    /// `name/version`, the form launches expect
    pub fn identifier(&self) -> String {
        match &self.version {
            serde_json::Value::String(version) => format!("{}/{}", self.name, version),
            other => format!("{}/{}", self.name, other),
        }
    }
}

/// Media source section of a launch request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSpec {
    /// Media URI
    pub uri: String,
    /// Always `uri`
    #[serde(rename = "type")]
    pub source_type: String,
}

/// WebRTC frame destination section of a launch request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameDestination {
    /// Always `webrtc`
    #[serde(rename = "type")]
    pub destination_type: String,
    /// Peer id the pipeline will register with the relay
    #[serde(rename = "peer-id")]
    pub peer_id: String,
    /// Pace frames to the source
    #[serde(rename = "sync-with-source")]
    pub sync_with_source: bool,
    /// Pace frames to the destination
    #[serde(rename = "sync-with-destination")]
    pub sync_with_destination: bool,
}

/// Destination section of a launch request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationSpec {
    /// Inference metadata sink
    pub metadata: serde_json::Value,
    /// Frame sink
    pub frame: FrameDestination,
}

/// Body of `POST /pipelines/{name}/{version}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchRequest {
    /// Media source
    pub source: SourceSpec,
    /// Metadata and frame destinations
    pub destination: DestinationSpec,
    /// Pipeline parameters
    pub parameters: serde_json::Value,
}

impl LaunchRequest {
    /// Build a launch request for a WebRTC frame destination
    pub fn new(
        media_source_uri: impl Into<String>,
        destination_peer_id: impl Into<String>,
        sync_playback: bool,
        metadata: serde_json::Value,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            source: SourceSpec {
                uri: media_source_uri.into(),
                source_type: "uri".to_string(),
            },
            destination: DestinationSpec {
                metadata,
                frame: FrameDestination {
                    destination_type: "webrtc".to_string(),
                    peer_id: destination_peer_id.into(),
                    sync_with_source: sync_playback,
                    sync_with_destination: sync_playback,
                },
            },
            parameters,
        }
    }
}

/// Outcome of a status poll
#[derive(Debug, Clone, PartialEq)]
pub enum StatusResponse {
    /// 2xx with a status object
    Report(StatusReport),
    /// The server does not know the instance
    InvalidInstance {
        /// HTTP status code
        http_status: u16,
    },
    /// Any other response
    Rejected {
        /// HTTP status code
        http_status: u16,
        /// Response body
        body: String,
    },
}

impl StatusResponse {
    /// Classify a status response body
    pub fn from_body(http_status: u16, body: &str) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();

        let is_invalid = match &parsed {
            Some(serde_json::Value::String(text)) => text == INVALID_INSTANCE,
            _ => body.trim() == INVALID_INSTANCE,
        };
        if is_invalid {
            return StatusResponse::InvalidInstance { http_status };
        }

        if (200..300).contains(&http_status) {
            if let Some(value @ serde_json::Value::Object(_)) = &parsed {
                if let Ok(report) = StatusReport::deserialize(value) {
                    return StatusResponse::Report(report);
                }
            }
        }

        let body = match parsed {
            Some(serde_json::Value::String(text)) => text,
            _ => body.trim().to_string(),
        };
        StatusResponse::Rejected { http_status, body }
    }
}

/// Strip quotes and newlines from a returned instance id
pub fn clean_instance_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '\'' | '"' | '\n'))
        .collect()
}

/// Operations of the pipeline server
#[async_trait]
pub trait PipelineServerApi: Send + Sync {
    /// Server base URL
    fn base_url(&self) -> &str;

    /// `GET /pipelines`
    async fn list_pipelines(&self) -> Result<Vec<PipelineDescriptor>>;

    /// `POST /pipelines/{pipeline}`; returns the cleaned instance id (possibly empty)
    async fn create_instance(&self, pipeline: &str, request: &LaunchRequest) -> Result<String>;

    /// `GET /pipelines/status/{id}`
    async fn status(&self, instance_id: &str) -> Result<StatusResponse>;

    /// `DELETE /pipelines/{id}`; returns the acknowledgement body
    async fn stop(&self, instance_id: &str) -> Result<String>;
}

/// HTTP client for the pipeline server
pub struct HttpPipelineServer {
    /// Base URL (e.g., "http://localhost:8080")
    base_url: String,

    /// Reqwest HTTP client
    client: reqwest::Client,
}

impl HttpPipelineServer {
    /// Create a new HTTP client
    ///
    /// # Arguments
    ///
    /// * `base_url` - Server base URL (e.g., "http://localhost:8080")
    /// * `timeout` - Per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        if base_url.is_empty() {
            return Err(Error::InvalidConfig(
                "Pipeline server base_url cannot be empty".to_string(),
            ));
        }

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::InvalidConfig(format!(
                "Pipeline server base_url must start with http:// or https://, got: {}",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    async fn rejection(response: reqwest::Response) -> Error {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = format!(
            "HTTP {} {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown"),
            error_text
        );
        if error_text.contains(INVALID_INSTANCE) {
            Error::RemoteRejection(message)
        } else {
            Error::Transient(message)
        }
    }
}

#[async_trait]
impl PipelineServerApi for HttpPipelineServer {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn list_pipelines(&self) -> Result<Vec<PipelineDescriptor>> {
        let url = format!("{}/pipelines", self.base_url);
        debug!("Invoking GET on route {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }

        Ok(response.json().await?)
    }

    async fn create_instance(&self, pipeline: &str, request: &LaunchRequest) -> Result<String> {
        let url = format!("{}/pipelines/{}", self.base_url, pipeline.trim_matches('/'));
        debug!("Invoking POST on route {}", url);

        let response = self.client.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }

        let body = response.text().await?;
        Ok(clean_instance_id(&body))
    }

    async fn status(&self, instance_id: &str) -> Result<StatusResponse> {
        let url = format!("{}/pipelines/status/{}", self.base_url, instance_id);
        debug!("Invoking GET on route {}", url);

        let response = self.client.get(&url).send().await?;
        let http_status = response.status().as_u16();
        let body = response.text().await?;
        Ok(StatusResponse::from_body(http_status, &body))
    }

    async fn stop(&self, instance_id: &str) -> Result<String> {
        let url = format!("{}/pipelines/{}", self.base_url, instance_id);
        debug!("Invoking DELETE on route {}", url);

        let response = self.client.delete(&url).send().await?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }

        Ok(response.text().await?)
    }
}
