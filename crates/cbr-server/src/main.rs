//! CBR relay daemon entry point.
//!
//! This binary starts the relay server that brokers chat messages and
//! remote commands between configured bridge clients.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod correlator;
mod error;
mod liveness;
mod plugin;
mod registry;
mod router;
mod server;

use config::ServerConfig;

/// CBR relay - brokers chat and remote commands between bridge clients
#[derive(Parser, Debug)]
#[command(name = "cbr-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, value_name = "PATH", default_value = "cbr.json")]
    config: PathBuf,

    /// Override the configured listen address (host:port)
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,
}

/// Set up logging with file output for debugging.
/// In debug builds, defaults to debug level and logs to timestamped file.
/// In release builds, defaults to info level and logs to stderr.
fn setup_logging() {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cbr={default_level}")));

    if cfg!(debug_assertions) {
        let temp_dir = std::env::temp_dir();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("cbr-server-{timestamp}.log");
        let log_path = temp_dir.join(&log_filename);

        #[cfg(unix)]
        {
            let symlink_path = temp_dir.join("cbr-server.log");
            let _ = std::fs::remove_file(&symlink_path);
            let _ = std::os::unix::fs::symlink(&log_path, &symlink_path);
        }

        let file_appender = tracing_appender::rolling::never(&temp_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .with(filter)
            .init();

        eprintln!("Logging to: {} (and stderr)", log_path.display());
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn apply_listen_override(config: &mut ServerConfig, listen: &str) -> anyhow::Result<()> {
    let (host, port) = listen
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("--listen expects host:port, got {listen}"))?;
    config.host = host.to_string();
    config.port = port.parse()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    setup_logging();

    let mut config = ServerConfig::load(&args.config)?;
    if let Some(listen) = &args.listen {
        apply_listen_override(&mut config, listen)?;
    }

    info!(
        "Starting CBR relay ({} configured clients)...",
        config.clients.len()
    );

    let state = Arc::new(server::ServerState::new(config));
    server::run(state).await?;

    info!("CBR relay stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_override() {
        let mut config = ServerConfig::default();
        apply_listen_override(&mut config, "0.0.0.0:9000").unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn test_listen_override_rejects_garbage() {
        let mut config = ServerConfig::default();
        assert!(apply_listen_override(&mut config, "no-port").is_err());
        assert!(apply_listen_override(&mut config, "host:not-a-port").is_err());
    }
}
