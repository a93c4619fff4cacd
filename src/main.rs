//! # lipsync
//!
//! Server binary: loads settings, installs logging and metrics, and serves
//! the WebSocket endpoint until Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lipsync_engine::{JobPipeline, ProcessJobRunner};
use lipsync_server::{ServerConfig, ShutdownCoordinator};
use lipsync_settings::LipsyncSettings;
use lipsync_telemetry::{TelemetryConfig, init_telemetry};

/// Lipsync job gateway.
#[derive(Parser, Debug)]
#[command(name = "lipsync", version, about = "WebSocket gateway for talking-head generation jobs")]
struct Cli {
    /// Settings file (defaults to `~/.lipsync/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (default).
    Serve {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, 0 for auto-assign (overrides settings).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate settings and print the effective values.
    CheckConfig,
}

fn load(path: Option<&PathBuf>) -> Result<LipsyncSettings> {
    let path = path.cloned().unwrap_or_else(lipsync_settings::settings_path);
    let settings = lipsync_settings::load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load(cli.config.as_ref())?;

    let (host, port) = match cli.command {
        Some(Command::CheckConfig) => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            return Ok(());
        }
        Some(Command::Serve { host, port }) => (host, port),
        None => (None, None),
    };
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }

    init_telemetry(&TelemetryConfig::from_settings(&settings.logging))?;
    let metrics = match lipsync_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics disabled");
            None
        }
    };

    tokio::fs::create_dir_all(&settings.staging.work_root)
        .await
        .with_context(|| format!("failed to create {}", settings.staging.work_root.display()))?;

    let runner = Arc::new(ProcessJobRunner::from_settings(&settings.job));
    let pipeline = Arc::new(JobPipeline::from_settings(&settings, runner));
    let config = ServerConfig::from_settings(&settings.server);
    let grace = config.shutdown_grace;

    let shutdown = ShutdownCoordinator::new();
    let server = lipsync_server::start(config, pipeline, shutdown.clone(), metrics)
        .await
        .context("failed to start server")?;
    tracing::info!(
        addr = %server.addr(),
        program = %settings.job.program,
        work_root = %settings.staging.work_root.display(),
        "lipsync ready"
    );

    shutdown.wait_for_signal().await;
    let registry = Arc::clone(server.registry());
    let listener_closed = shutdown.graceful_shutdown(vec![server.into_task()], grace).await;
    let sessions_closed = tokio::time::timeout(grace, async {
        while registry.count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_ok();
    if !(listener_closed && sessions_closed) {
        tracing::warn!(open_sessions = registry.count(), "forced shutdown");
    }
    tracing::info!("lipsync stopped");
    Ok(())
}
