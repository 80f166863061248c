//! Tape daemon - main entry point.
//!
//! Hosts the backup pipeline and the HTTP control surface used to start,
//! cancel, and observe backup jobs.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tape_daemon::{api, config::Config, device::registry::DeviceRegistry, utils};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if let Some(config_path) = args.config {
        Config::from_file(&config_path)?
    } else {
        Config::with_default_library()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;
    api::health::init_start_time();

    tracing::info!(
        "Starting tape-daemon v{} (daemon_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.daemon.id
    );

    std::fs::create_dir_all(&config.daemon.data_dir)?;

    // Build the device registry; this creates the virtual libraries' media.
    let registry = Arc::new(DeviceRegistry::from_config(&config)?);
    if registry.libraries.is_empty() {
        tracing::warn!("no tape libraries configured; backup requests will be rejected");
    }

    let port = args.port.unwrap_or(config.daemon.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let state = api::AppState::new(Arc::new(config), registry);
    let app = api::create_router(state.clone());

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Library inventory: http://{}/api/libraries", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop any jobs still running before the process exits.
    tracing::info!("Shutting down...");
    state.jobs.abort_all().await;
    tracing::info!("Daemon stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
