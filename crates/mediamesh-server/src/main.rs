//! MediaMesh Server
//!
//! A standalone federation node for a self-hosted media manager.
//!
//! ## Features
//!
//! - **Operator API**: Link peers, manage API keys, control networking
//! - **Federation API**: Catalog, streaming and address gossip for peers
//! - **NAT traversal**: UPnP port mapping or a manually configured URL
//! - **Replication**: Periodic pulls from auto-replicating peers

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mediamesh::{Collaborators, Config, HttpFederationClient, IgdPortMapper, Mesh};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mediamesh_server::local::{FsCatalog, FsLibraryMover, HttpDownloadPipeline};
use mediamesh_server::{app, AppState};

/// MediaMesh Server - federation node for self-hosted media managers
#[derive(Parser, Debug)]
#[command(name = "mediamesh-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Data directory for the database, downloads and libraries
    #[arg(long, env = "MEDIAMESH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory whose files are offered to peers (default: {data_dir}/media)
    #[arg(long, env = "MEDIAMESH_MEDIA_DIR")]
    media_dir: Option<PathBuf>,

    /// Instance name used when the identity is first created
    #[arg(long, default_value = "MediaMesh", env = "MEDIAMESH_INSTANCE_NAME")]
    instance_name: String,

    /// HTTP API port, also the port UPnP maps
    #[arg(long, default_value_t = mediamesh::DEFAULT_API_PORT, env = "MEDIAMESH_API_PORT")]
    api_port: u16,

    /// Seconds between replication cycles
    #[arg(
        long,
        default_value_t = mediamesh::DEFAULT_SYNC_INTERVAL_SECS,
        env = "MEDIAMESH_SYNC_INTERVAL",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    sync_interval: u64,

    /// Seconds to wait for the UPnP gateway
    #[arg(
        long,
        default_value_t = 10,
        env = "MEDIAMESH_UPNP_TIMEOUT",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    upnp_timeout: u64,

    /// Log level
    #[arg(long, default_value = "info", env = "MEDIAMESH_LOG_LEVEL")]
    log_level: Level,
}

impl Args {
    fn config(&self) -> Config {
        let data_dir = self.data_dir.clone().unwrap_or_else(Config::default_data_dir);
        let mut config = Config::new(data_dir)
            .with_instance_name(self.instance_name.clone())
            .with_api_port(self.api_port)
            .with_sync_interval(Duration::from_secs(self.sync_interval))
            .with_upnp_timeout(Duration::from_secs(self.upnp_timeout));
        if let Some(media_dir) = &self.media_dir {
            config = config.with_media_dir(media_dir);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = args.config();
    info!("Starting MediaMesh Server");
    info!(data_dir = %config.data_dir.display(), "Data directory");
    info!(media_dir = %config.media_path().display(), "Catalog directory");
    info!(api_port = config.api_port, "HTTP API port");

    for dir in [config.downloads_path(), config.libraries_path()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let collaborators = Collaborators {
        client: Arc::new(HttpFederationClient::new()),
        mapper: Arc::new(IgdPortMapper::new(config.upnp_timeout)),
        pipeline: Arc::new(HttpDownloadPipeline::new(config.downloads_path())),
        mover: Arc::new(FsLibraryMover::new(config.libraries_path())),
    };
    let catalog = Arc::new(FsCatalog::new(config.media_path()));
    let api_port = config.api_port;
    let mesh = Arc::new(Mesh::init(config, collaborators).context("Failed to initialize mesh")?);

    // Bind before announcing so peers can reach us as soon as they hear
    let api_addr: SocketAddr = ([0, 0, 0, 0], api_port).into();
    let listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .context("Failed to bind API server")?;
    info!(addr = %api_addr, "HTTP API listening");

    match mesh.start().await {
        Ok(status) => match &status.external_url {
            Some(url) => info!(url = %url, "Reachable from peers"),
            None => warn!(
                error = ?status.upnp.error,
                "External URL unknown; set one via PUT /networking/external-url"
            ),
        },
        Err(e) => return Err(e).context("Failed to start mesh"),
    }

    let state = Arc::new(AppState {
        mesh: mesh.clone(),
        catalog,
    });

    // Run with graceful shutdown on ctrl-c
    let served = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    mesh.shutdown().await;
    served.context("API server error")?;

    info!("MediaMesh Server stopped");
    Ok(())
}

/// Wait for a ctrl-c signal for graceful shutdown
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Received ctrl-c, initiating graceful shutdown");
}
