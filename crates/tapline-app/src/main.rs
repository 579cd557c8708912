//! Tapline - local forwarding proxy.
//!
//! Records every proxied exchange, tunnels HTTPS via CONNECT and can point the
//! host's system proxy settings at itself.

mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use tapline_proxy::system_proxy::default_backup_dir;
use tapline_proxy::{DEFAULT_HTTPS_PORT, DEFAULT_PROXY_PORT};
use tapline_server::{LogLevel, Server, ServerConfig, DEFAULT_HOST};

/// Tapline - local forwarding proxy
#[derive(Parser, Debug)]
#[command(name = "tapline", version, about)]
struct Args {
    /// Host to listen on
    #[arg(long, env = "PROXY_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(long, short, env = "PROXY_PORT", default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Log level (silent, error, warn, info, debug)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Append logs to this file as well as stdout
    #[arg(long, env = "LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Advertise HTTPS support
    #[arg(long, env = "ENABLE_HTTPS")]
    enable_https: bool,

    /// Port reserved for HTTPS
    #[arg(long, env = "HTTPS_PORT", default_value_t = DEFAULT_HTTPS_PORT)]
    https_port: u16,

    /// Directory for system proxy backups
    #[arg(long, env = "TAPLINE_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            log_level: self.log_level,
            enable_https: self.enable_https,
            https_port: self.https_port,
            log_file: self.log_file,
            backup_dir: self.backup_dir.unwrap_or_else(default_backup_dir),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config();
    config.validate().context("invalid configuration")?;

    // Held until exit so buffered log lines are flushed.
    let _guard = logging::init_logging(config.log_level, config.log_file.as_deref())?;

    let server = Server::new(config).context("failed to create proxy server")?;
    let handle = server.start().await.context("failed to start proxy server")?;

    shutdown_signal().await;

    info!("Stopping proxy server");
    handle.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
