//! # hotline
//!
//! Call-brokering signaling server binary: loads settings, initialises
//! logging and metrics, and serves until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use hotline_server::ShutdownCoordinator;
use hotline_settings::{HotlineSettings, LoggingSettings};
use tracing_subscriber::EnvFilter;

/// Grace period for connections and the dispatcher to wind down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines.
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Staffer/user call-brokering server.
#[derive(Parser, Debug)]
#[command(name = "hotline", about = "Staffer/user call-brokering signaling server")]
struct Cli {
    /// JSON settings file, merged over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log format (overrides `logging.json`).
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Do not install the Prometheus recorder; `/metrics` answers 404.
    #[arg(long)]
    no_metrics: bool,
}

impl Cli {
    fn apply(&self, settings: &mut HotlineSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(format) = self.log_format {
            settings.logging.json = format == LogFormat::Json;
        }
    }
}

fn init_logging(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings = hotline_settings::load_settings(args.config.as_deref())
        .context("Failed to load settings")?;
    args.apply(&mut settings);

    init_logging(&settings.logging);
    tracing::info!(
        config = ?args.config,
        selection = ?settings.dispatcher.selection,
        overflow = ?settings.channel.overflow,
        "starting hotline"
    );

    let metrics = if args.no_metrics {
        None
    } else {
        Some(hotline_server::metrics::install_recorder().context("Failed to install metrics recorder")?)
    };

    let shutdown = ShutdownCoordinator::new();
    let handle = hotline_server::start(&settings, metrics, &shutdown)
        .await
        .context("Failed to start server")?;
    tracing::info!(
        "hotline listening on ws://{}{}",
        handle.addr(),
        settings.server.ws_path
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    shutdown
        .graceful_shutdown(handle.into_tasks(), Some(SHUTDOWN_TIMEOUT))
        .await;
    tracing::info!("shutdown complete");
    Ok(())
}
