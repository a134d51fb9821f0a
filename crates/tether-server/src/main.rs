//! tetherd: hosts the session registry and recorder, runs the stale-session
//! and retention sweeps, and finalizes live recordings on shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether_server::{Overrides, RecordingMode, TetherConfig, TetherServer};
use tracing::info;

/// tetherd: shared terminal session daemon
#[derive(Parser, Debug)]
#[command(name = "tetherd", version, about = "Shared terminal session daemon")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.tether/config.toml")]
    config: String,

    /// Directory recordings are written under
    #[arg(long)]
    recording_root: Option<String>,

    /// Recording mode (disabled, optional, forced)
    #[arg(long)]
    mode: Option<RecordingMode>,

    /// Days to keep recordings (0 keeps them forever)
    #[arg(long)]
    retention_days: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tetherd");

    let config = TetherConfig::load(
        Some(PathBuf::from(&cli.config).as_path()),
        Overrides {
            recording_root: cli.recording_root,
            mode: cli.mode,
            retention_days: cli.retention_days,
        },
    )
    .context("failed to load config")?;

    let server = Arc::new(TetherServer::new(config).context("failed to start tether")?);
    let tasks = server.spawn_maintenance();

    info!(
        sweep_secs = server.config().sweep_interval.as_secs(),
        cleanup_secs = server.config().cleanup_interval.as_secs(),
        "tetherd ready"
    );

    shutdown_signal().await?;
    info!("received shutdown signal");

    for task in tasks {
        task.abort();
    }
    server.shutdown().await;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to listen for Ctrl+C")?;
    }

    Ok(())
}
