//! Pipeline server integration
//!
//! [`PipelineLifecycleManager`] launches one pipeline instance at a time,
//! polls its status until it ends, and stops it on request.

pub mod api;
pub mod instance;
pub mod lifecycle;

pub use api::{
    HttpPipelineServer, LaunchRequest, PipelineDescriptor, PipelineServerApi, StatusResponse,
    INVALID_INSTANCE,
};
pub use instance::{InstanceRef, InstanceState, PipelineInstance, PipelineMetrics, StatusReport};
pub use lifecycle::{expand_peer_id_template, LaunchParams, PipelineLifecycleManager};
