//! # Spool
//!
//! A SOCKS5-fronted tunneling proxy that carries TCP streams from a local
//! client endpoint to a remote exit endpoint over long-lived TLS connections.
//!
//! ## Features
//!
//! - **Reusable pipes**: a command-framed wire layer lets a single TLS
//!   connection serve many successive end-user streams
//! - **Connection pooling**: bounded FIFO of idle pipes with age-based
//!   eviction and low-water-mark refill
//! - **Half-close coordination**: FIN semantics are bridged across the
//!   tunnel so a pipe survives the end of the stream it carried
//!
//! ## Architecture
//!
//! ```text
//! ┌─────┐ SOCKS5 ┌────────────┐  framed TLS   ┌────────────┐  TCP  ┌────────┐
//! │ app ├───────▶│   client   ├──────────────▶│   server   ├──────▶│ target │
//! └─────┘        │ dispatcher │   pipe pool   │  acceptor  │       └────────┘
//!                └────────────┘               └────────────┘
//! ```

pub mod client;
pub mod config;
pub mod pipe;
pub mod proxy;
pub mod server;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pipe error: {0}")]
    Pipe(#[from] pipe::PipeError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
