//! Pipeline viewer binary entry point
//!
//! Launches or attaches to a pipeline server instance and views its WebRTC
//! frame output as an answer-only peer.
//!
//! # Usage
//!
//! ```bash
//! # List pipelines
//! pipeline-viewer pipelines
//!
//! # Launch and view until the instance ends or Ctrl+C
//! pipeline-viewer launch object_detection/person_vehicle_bike \
//!     --source https://example/video.mp4 --peer-id 'viewer_$RANDOM'
//!
//! # View an instance launched elsewhere
//! pipeline-viewer attach --instance-id abc-1 --peer-id viewer_1234
//!
//! # One-off status / stop
//! pipeline-viewer status abc-1
//! pipeline-viewer stop abc-1
//! ```
//!
//! # Environment Variables
//!
//! - `VIEWER_CONFIG`: TOML configuration file
//! - `VIEWER_PIPELINE_SERVER`: Pipeline server base URL (default: `http://localhost:8080`)
//! - `VIEWER_SIGNALING_SERVER`: Signaling relay host (default: `127.0.0.1`)
//! - `VIEWER_SIGNALING_PORT`: Signaling relay port (default: `8443`)
//! - `VIEWER_LOCAL_PEER_ID`: Fixed local peer id (default: random per attempt)
//! - `VIEWER_MEDIA_CONSTRAINTS`: JSON media constraints (default: `{"video": true, "audio": false}`)
//! - `VIEWER_ICE_SERVERS`: Comma-separated ICE server URLs (default: none)
//! - `RUST_LOG`: Logging level (default: `info`)

use anyhow::Context;
use clap::{Parser, Subcommand};
use pipeline_viewer::config::MediaConstraints;
use pipeline_viewer::{
    notice_channel, HttpPipelineServer, InstanceLinks, InstanceRef, LaunchParams, Notice,
    PipelineLifecycleManager, SignalingClient, SignalingHandle, ViewerConfig, WebRtcPeerFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pipeline-viewer", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, env = "VIEWER_CONFIG")]
    config: Option<PathBuf>,

    /// Pipeline server base URL
    #[arg(long, env = "VIEWER_PIPELINE_SERVER")]
    pipeline_server: Option<String>,

    /// Signaling relay host
    #[arg(long, env = "VIEWER_SIGNALING_SERVER")]
    signaling_server: Option<String>,

    /// Signaling relay port
    #[arg(long, env = "VIEWER_SIGNALING_PORT")]
    signaling_port: Option<u16>,

    /// Fixed local peer id
    #[arg(long, env = "VIEWER_LOCAL_PEER_ID")]
    local_peer_id: Option<String>,

    /// Media constraints as JSON
    #[arg(long, env = "VIEWER_MEDIA_CONSTRAINTS")]
    media_constraints: Option<String>,

    /// ICE server URLs
    #[arg(long, env = "VIEWER_ICE_SERVERS", value_delimiter = ',')]
    ice_servers: Vec<String>,

    /// Do not reconnect after a session error
    #[arg(long)]
    no_auto_retry: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List available pipelines
    Pipelines,

    /// Launch a pipeline instance and view it
    Launch {
        /// Pipeline as `name/version`
        pipeline: String,

        /// Media source URI
        #[arg(long)]
        source: String,

        /// Destination peer id; `$RANDOM` is replaced by a random number
        #[arg(long, default_value = "$RANDOM")]
        peer_id: String,

        /// Sync frames with source and destination
        #[arg(long)]
        sync: bool,
    },

    /// View an instance launched elsewhere
    Attach {
        /// Instance id; omit when unknown
        #[arg(long)]
        instance_id: Option<String>,

        /// Destination peer id the instance streams to
        #[arg(long)]
        peer_id: String,
    },

    /// Print one status line for an instance
    Status {
        /// Instance id
        instance_id: String,
    },

    /// Stop an instance
    Stop {
        /// Instance id
        instance_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    info!(
        version = pipeline_viewer::version(),
        "Pipeline viewer starting"
    );

    let config = load_config(&cli)?;
    info!(
        pipeline_server = %config.pipeline_server.base_url,
        signaling_port = config.signaling.port,
        ice_servers = config.ice_servers.len(),
        auto_retry = config.retry.auto_retry,
        "Configuration loaded"
    );

    let (notices, notice_rx) = notice_channel();
    let server = HttpPipelineServer::new(
        config.pipeline_server.base_url.clone(),
        config.pipeline_server.request_timeout(),
    )?;
    let manager = PipelineLifecycleManager::new(Arc::new(server), &config, notices.clone());

    match cli.command {
        Command::Pipelines => {
            for pipeline in manager.list_pipelines().await? {
                println!("{}", pipeline.identifier());
            }
        }
        Command::Status { instance_id } => {
            println!("{}", manager.query_status(&instance_id).await?);
        }
        Command::Stop { instance_id } => {
            let ack = manager
                .stop_external(Some(&instance_id))
                .await
                .with_context(|| format!("Failed to stop instance {}", instance_id))?;
            println!("{}", ack.trim());
        }
        Command::Launch {
            pipeline,
            source,
            peer_id,
            sync,
        } => {
            let (client, signaling) =
                SignalingClient::new(&config, Arc::new(WebRtcPeerFactory), notices.clone())?;
            let client_task = client.spawn();
            let manager = manager.with_retry_control(Arc::new(signaling.clone()));

            let instance = manager
                .launch(LaunchParams {
                    pipeline_name: pipeline,
                    media_source_uri: source,
                    destination_peer_id: peer_id,
                    sync_playback: sync,
                })
                .await
                .context("Failed to launch pipeline")?;
            let peer_id = manager
                .destination_peer_id()
                .await
                .context("Launched instance has no destination peer id")?;

            view(&manager, &signaling, instance, &peer_id, notice_rx).await?;
            signaling.shutdown().await;
            let _ = client_task.await;
        }
        Command::Attach {
            instance_id,
            peer_id,
        } => {
            let (client, signaling) =
                SignalingClient::new(&config, Arc::new(WebRtcPeerFactory), notices.clone())?;
            let client_task = client.spawn();
            let manager = manager.with_retry_control(Arc::new(signaling.clone()));

            let instance = manager.attach(instance_id.as_deref(), &peer_id).await?;
            view(&manager, &signaling, instance, &peer_id, notice_rx).await?;
            signaling.shutdown().await;
            let _ = client_task.await;
        }
    }

    Ok(())
}

/// Connect to `peer_id` and render notices until Ctrl+C, the instance ends,
/// or the session hard-stops
async fn view(
    manager: &PipelineLifecycleManager,
    signaling: &SignalingHandle,
    instance: InstanceRef,
    peer_id: &str,
    mut notices: mpsc::UnboundedReceiver<Notice>,
) -> anyhow::Result<()> {
    let links = InstanceLinks::for_instance(manager.server_url(), &instance);
    signaling
        .connect(peer_id, Some(links))
        .await
        .with_context(|| format!("Failed to connect to peer {}", peer_id))?;

    let mut states = manager.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    info!("Viewing {} ({}). Press Ctrl+C to stop.", instance, peer_id);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Shutdown signal received, cleaning up...");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if state.is_terminal() {
                    info!(?state, "Pipeline instance ended");
                    break;
                }
            }
            notice = notices.recv() => match notice {
                Some(Notice::Stats(sample)) => println!("{}", sample.summary()),
                Some(Notice::Error(_)) => {
                    if signaling.snapshot().await?.hard_stopped {
                        warn!("Signaling session stopped retrying");
                        break;
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    signaling.disconnect().await?;
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<ViewerConfig> {
    let mut config = match &cli.config {
        Some(path) => ViewerConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ViewerConfig::default(),
    };

    if let Some(url) = &cli.pipeline_server {
        config.pipeline_server.base_url = url.clone();
    }
    if let Some(server) = &cli.signaling_server {
        config.signaling.server = Some(server.clone());
    }
    if let Some(port) = cli.signaling_port {
        config.signaling.port = port;
    }
    if let Some(id) = &cli.local_peer_id {
        config.signaling.local_peer_id = Some(id.clone());
    }
    if let Some(text) = &cli.media_constraints {
        let (constraints, error) = MediaConstraints::parse_or_default(text);
        if let Some(e) = error {
            warn!("Invalid media constraints, using defaults: {}", e);
        }
        config.media.constraints = constraints;
    }
    if !cli.ice_servers.is_empty() {
        config.ice_servers = cli.ice_servers.clone();
    }
    if cli.no_auto_retry {
        config.retry.auto_retry = false;
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
