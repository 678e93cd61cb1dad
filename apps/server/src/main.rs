//! Lumina Server - standalone headless relay.
//!
//! Runs the session-scoped WebSocket relay as a background daemon. Any number
//! of these processes can sit behind a load balancer; they coordinate through
//! the shared Redis substrate configured via `REDIS_URL`.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use lumina_core::{start_server, AppState};
use tokio::signal;

use crate::config::ServerConfig;

/// Lumina Server - headless relay for controller/display sessions.
#[derive(Parser, Debug)]
#[command(name = "lumina-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "LUMINA_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "PORT")]
    port: Option<u16>,

    /// Redis URL (overrides config file).
    #[arg(short = 'r', long, env = "REDIS_URL")]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Lumina Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(redis_url) = args.redis_url {
        config.redis_url = Some(redis_url);
    }

    log::info!(
        "Configuration: port={}, substrate={}, require_code={}, trust_proxy={}",
        config.port,
        if config.redis_url.is_some() {
            "redis"
        } else {
            "local-only"
        },
        config.require_code,
        config.trust_proxy
    );

    // Bootstrap services (substrate connection, hub, identify pool, limiters)
    let state = AppState::bootstrap(config.to_core_config()).await;

    log::info!(
        "Services bootstrapped (instance {}, {} identify workers)",
        state.hub.instance_id(),
        state.identify.worker_count()
    );

    // Spawn the HTTP/WS server on the main runtime.
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(state).await {
            log::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // In-flight identify jobs and room state are process-local; dropping the
    // server task closes every connection and the substrate TTLs take care
    // of the rest.
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
