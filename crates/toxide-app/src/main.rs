//! Toxide - TCP proxy for simulating network faults.
//!
//! Runs the REST control API. Proxies and toxics are created through the API
//! and live until they are deleted or the process exits.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use toxide_proxy::ProxyRegistry;
use toxide_server::{Server, ServerConfig, DEFAULT_HOST, DEFAULT_PORT};

/// Toxide - TCP proxy for simulating network faults
#[derive(Parser, Debug)]
#[command(name = "toxide", version, about)]
struct Args {
    /// Host for the control API
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port for the control API
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to daily rotated files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig::default()
            .with_host(&self.host)
            .with_port(self.port)
    }
}

/// Default filter directive when `RUST_LOG` is not set.
fn default_directive(args: &Args) -> String {
    let log_level = if args.debug { "debug" } else { &args.log_level };
    format!("toxide={},warn", log_level)
}

/// Initialize logging, optionally with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(args)));

    if let Some(log_dir) = &args.log_dir {
        let file_appender = std::fs::create_dir_all(log_dir).ok().and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("toxide")
                .filename_suffix("log")
                .build(log_dir)
                .ok()
        });

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }

        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        tracing::warn!("File logging unavailable at {:?}, using console only", log_dir);
        return None;
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    None
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Toxide {}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Args: {:?}", args);

    let registry = Arc::new(ProxyRegistry::new());
    let server = Server::new(args.server_config(), registry.clone())?;

    let result = server.run_until(shutdown_signal()).await;

    registry.shutdown().await;
    tracing::info!("Toxide shutting down");

    result.map_err(Into::into)
}
