//! Spool client
//!
//! Runs the local SOCKS5 entrance of the tunnel:
//! - Accepts SOCKS5 CONNECT requests from local applications
//! - Keeps a warm pool of TLS pipes to the remote server
//! - Binds each inbound stream to a pooled pipe

use anyhow::{Context, Result};
use clap::Parser;
use spool::client::Client;
use spool::config::{ClientConfig, Config};

/// Spool client - SOCKS5 entrance of the tunnel
#[derive(Parser, Debug)]
#[command(name = "spool-client")]
#[command(about = "Spool client - SOCKS5-fronted tunneling proxy")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Local SOCKS5 listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Remote server address (overrides config)
    #[arg(short, long)]
    remote: Option<String>,

    /// Shared tunnel secret (overrides config)
    #[arg(short, long)]
    secret: Option<String>,

    /// Connection pool size (overrides config)
    #[arg(long)]
    pool_size: Option<usize>,

    /// Idle timeout for pooled pipes, in seconds (overrides config)
    #[arg(short = 't', long)]
    idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    let log_level = args
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_level.as_str())
        .init();

    let mut cfg: ClientConfig = config.client.take().unwrap_or_default();
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if let Some(remote) = args.remote {
        cfg.remote = remote;
    }
    if let Some(secret) = args.secret {
        cfg.secret = secret;
    }
    if let Some(pool_size) = args.pool_size {
        cfg.pool_size = pool_size;
    }
    if let Some(idle_timeout) = args.idle_timeout {
        cfg.idle_timeout = idle_timeout;
    }

    tracing::info!("spool client v{}", spool::VERSION);
    tracing::info!("remote server: {}", cfg.remote);

    let client = Client::new(cfg).context("Failed to build client")?;
    client
        .listen_and_serve()
        .await
        .context("Client terminated")?;
    Ok(())
}
