//! Election updates client
//!
//! Connects to the election-updates channel and logs the store commands the
//! event bridge derives from each server push.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use election_updates::bridge::{CommandSink, EventBridge, StoreCommand};
use election_updates::client::{ConnectionManager, FileToken, StaticToken, WsConnector};
use election_updates::config::{ClientConfig, CONFIG_FILE};

/// Election updates client
///
/// Follows real-time election updates over WebSocket
#[derive(Parser, Debug)]
#[command(name = "election-updates")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Page origin the socket URL is derived from
    #[arg(long)]
    origin: Option<String>,

    /// Explicit server URL, overriding the origin
    #[arg(long)]
    base_url: Option<String>,

    /// Authentication token
    #[arg(long, conflicts_with = "token_file")]
    token: Option<String>,

    /// File holding the authentication token, re-read on every reconnect
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Seconds between health reports
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    health_interval: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Election updates client v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ClientConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(origin) = args.origin {
        config = config.with_origin(origin);
    }
    if args.base_url.is_some() {
        config = config.with_base_url(args.base_url);
    }

    let manager = ConnectionManager::new(config, WsConnector);
    match (args.token_file, args.token) {
        (Some(path), _) => {
            info!("Reading token from {}", path.display());
            manager.set_token_provider(FileToken::new(path));
        }
        (None, Some(token)) => manager.set_token_provider(StaticToken::new(token)),
        (None, None) => anyhow::bail!("A token is required: pass --token or --token-file"),
    }

    let sink: Arc<dyn CommandSink> = Arc::new(|command: StoreCommand| log_command(&command));
    let mut bridge = EventBridge::start(manager.clone(), sink).await;

    let mut health = tokio::time::interval(Duration::from_secs(args.health_interval));
    health.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = health.tick() => log_health(&manager),
        }
    }

    info!("Initiating graceful shutdown...");
    bridge.shutdown();
    info!("Shutdown complete");
    Ok(())
}

fn log_command(command: &StoreCommand) {
    match serde_json::to_string(command) {
        Ok(json) => info!("Store command: {}", json),
        Err(e) => warn!("Failed to render store command {:?}: {}", command, e),
    }
}

fn log_health(manager: &ConnectionManager) {
    match serde_json::to_string(&manager.health()) {
        Ok(json) => info!("Health: {}", json),
        Err(e) => warn!("Failed to render health report: {}", e),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
