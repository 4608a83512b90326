//! Spool server
//!
//! Runs the exit side of the tunnel:
//! - Accepts client connections over TLS
//! - Verifies the authenticated handshake on every stream
//! - Dials the requested targets and bridges them onto the pipe

use anyhow::{Context, Result};
use clap::Parser;
use spool::config::{Config, ServerConfig};
use spool::server::Server;

/// Spool server - exit side of the tunnel
#[derive(Parser, Debug)]
#[command(name = "spool-server")]
#[command(about = "Spool server - SOCKS5-fronted tunneling proxy")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Shared tunnel secret (overrides config)
    #[arg(short, long)]
    secret: Option<String>,

    /// TLS certificate path (overrides config)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key path (overrides config)
    #[arg(short, long)]
    key: Option<String>,

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

    let mut cfg: ServerConfig = config.server.take().unwrap_or_default();
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if let Some(secret) = args.secret {
        cfg.secret = secret;
    }
    if let Some(cert) = args.cert {
        cfg.cert = cert;
    }
    if let Some(key) = args.key {
        cfg.key = key;
    }

    tracing::info!("spool server v{}", spool::VERSION);

    let server = Server::new(cfg).context("Failed to build server")?;
    server.start().await.context("Server terminated")?;
    Ok(())
}
