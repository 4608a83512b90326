//! Server acceptor
//!
//! Accepts TLS connections, wraps each in a pipe and serves handshakes in
//! a loop: wait for an authenticated handshake, dial the requested
//! target, bind the target socket to the pipe, repeat. One TLS connection
//! thus carries many sequential targets; the loop ends when the peer goes
//! away or the pipe transport fails.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::pipe::{Pipe, PipeError};

/// Server-side acceptor for tunnel connections.
pub struct Server {
    cfg: ServerConfig,
    tls: Arc<rustls::ServerConfig>,
}

impl Server {
    /// Build a server, loading the TLS certificate and key from disk.
    pub fn new(cfg: ServerConfig) -> crate::Result<Self> {
        let certs = load_certs(&cfg.cert)?;
        let key = load_private_key(&cfg.key)?;
        let tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self {
            cfg,
            tls: Arc::new(tls),
        })
    }

    /// Listen and serve until the listener fails.
    pub async fn start(&self) -> crate::Result<()> {
        info!("listening on {}", self.cfg.listen);
        let acceptor = TlsAcceptor::from(Arc::clone(&self.tls));
        let listener = TcpListener::bind(&self.cfg.listen).await?;

        loop {
            let (tcp, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept failed: {}", e);
                    continue;
                }
            };
            debug!("connection from {}", peer);

            let acceptor = acceptor.clone();
            let secret = self.cfg.secret.clone();
            tokio::spawn(async move {
                let tls = match acceptor.accept(tcp).await {
                    Ok(tls) => tls,
                    Err(e) => {
                        warn!("TLS accept from {} failed: {}", peer, e);
                        return;
                    }
                };
                serve_connection(tls, secret).await;
            });
        }
    }
}

/// Serve one accepted transport connection: run the handshake, dial and
/// bind loop until the peer goes away or the pipe fails. The pipe runs
/// with no idle deadline; the client side is trusted to interrupt or
/// close.
pub async fn serve_connection<S>(conn: S, secret: String)
where
    S: AsyncRead + AsyncWrite + Send,
{
    let mut pipe = Pipe::new(conn, Duration::ZERO);
    loop {
        let addr = match pipe.wait_for_handshake(&secret).await {
            Ok(addr) => addr,
            Err(PipeError::Eof) => {
                debug!("[{}] closed by peer", pipe);
                break;
            }
            Err(e) => {
                warn!("[{}] handshake failed: {}", pipe, e);
                break;
            }
        };
        info!("[{}] new connection to {}", pipe, addr);

        let target = match TcpStream::connect(addr.to_string()).await {
            Ok(sock) => sock,
            Err(e) => {
                warn!("[{}] dial {} failed: {}", pipe, addr, e);
                break;
            }
        };
        target.set_nodelay(true).ok();

        let result = pipe.bind(target).await;
        info!("[{}] connection to {} closed", pipe, addr);
        if let Err(e) = result {
            debug!("[{}] pipe failed: {}", pipe, e);
            break;
        }
    }
    pipe.close().await;
}

/// Load a TLS certificate chain from a PEM file.
fn load_certs(path: &str) -> crate::Result<Vec<CertificateDer<'static>>> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path).map_err(|e| {
        crate::Error::Config(format!("Failed to open cert file {}: {}", path, e))
    })?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| crate::Error::Config(format!("Failed to parse PEM certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(crate::Error::Config(format!(
            "No certificates found in {}",
            path
        )));
    }
    info!("loaded {} certificate(s) from {}", certs.len(), path);
    Ok(certs)
}

/// Load a TLS private key from a PEM file.
fn load_private_key(path: &str) -> crate::Result<PrivateKeyDer<'static>> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path).map_err(|e| {
        crate::Error::Config(format!("Failed to open key file {}: {}", path, e))
    })?);
    rustls_pemfile::private_key(&mut file)
        .map_err(|e| crate::Error::Config(format!("Failed to parse PEM private key: {}", e)))?
        .ok_or_else(|| crate::Error::Config(format!("No private key found in {}", path)))
}
