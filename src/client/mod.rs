//! Client dispatcher
//!
//! Accepts inbound TCP connections, negotiates SOCKS5, then binds each
//! inbound stream to a pooled pipe:
//!
//! 1. take a pipe from the pool and ping it, discarding pipes whose
//!    remote silently went away
//! 2. send the authenticated handshake naming the target
//! 3. bind the inbound socket to the pipe
//! 4. return the pipe to the pool on clean completion, close it otherwise

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::pipe::{Dialer, Pipe, PipeError, Pool};
use crate::proxy;

/// Certificate verifier that accepts whatever the server presents. The
/// tunnel endpoints authenticate each other with the shared secret, not
/// with the certificate chain.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Pipe factory dialing the remote server over TLS.
pub struct TlsDialer {
    remote: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    timeout: Duration,
}

impl TlsDialer {
    pub fn new(remote: String, timeout: Duration) -> crate::Result<Self> {
        let host = remote
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(remote.as_str())
            .trim_start_matches('[')
            .trim_end_matches(']');
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| crate::Error::Config(format!("invalid remote address {remote}: {e}")))?;

        let tls = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();

        Ok(Self {
            remote,
            server_name,
            connector: TlsConnector::from(Arc::new(tls)),
            timeout,
        })
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    type Stream = tokio_rustls::client::TlsStream<TcpStream>;

    async fn dial(&self) -> Result<Pipe<Self::Stream>, PipeError> {
        let tcp = TcpStream::connect(&self.remote).await?;
        tcp.set_nodelay(true).ok();
        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await?;
        Ok(Pipe::new(tls, self.timeout))
    }
}

/// Client-side dispatcher: SOCKS5 entrance backed by a pool of pipes.
pub struct Client<D: Dialer = TlsDialer> {
    cfg: ClientConfig,
    pool: Arc<Pool<D>>,
    active: AtomicI64,
}

impl Client<TlsDialer> {
    pub fn new(cfg: ClientConfig) -> crate::Result<Arc<Self>> {
        let dialer = TlsDialer::new(cfg.remote.clone(), cfg.idle_timeout())?;
        Ok(Self::with_dialer(cfg, dialer))
    }
}

impl<D: Dialer> Client<D> {
    /// Build a client around a custom pipe factory.
    pub fn with_dialer(cfg: ClientConfig, dialer: D) -> Arc<Self> {
        let pool = Pool::new(cfg.pool_size, cfg.idle_timeout(), dialer);
        Arc::new(Self {
            cfg,
            pool,
            active: AtomicI64::new(0),
        })
    }

    pub fn pool(&self) -> &Pool<D> {
        &self.pool
    }

    /// Bind the configured listen address and serve inbound connections
    /// until the listener fails.
    pub async fn listen_and_serve(self: Arc<Self>) -> crate::Result<()> {
        info!("listening on {}", self.cfg.listen);
        info!(
            "pool size: {}, idle timeout: {}s",
            self.cfg.pool_size, self.cfg.idle_timeout
        );
        let listener = TcpListener::bind(&self.cfg.listen).await?;
        self.serve(listener).await
    }

    /// Serve inbound connections from an existing listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> crate::Result<()> {
        loop {
            let (sock, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept failed: {}", e);
                    continue;
                }
            };
            debug!("inbound connection from {}", peer);

            let client = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = client.handle_conn(sock).await {
                    debug!("inbound connection failed: {}", e);
                }
            });
        }
    }

    async fn handle_conn(&self, mut sock: TcpStream) -> crate::Result<()> {
        let started = Instant::now();
        let addr = proxy::handshake(&mut sock).await?;

        let mut pipe = loop {
            let mut pipe = self.pool.get().await?;
            match pipe.try_ping().await {
                Ok(()) => break pipe,
                Err(e) => {
                    warn!("[{}] ping failed: {}", pipe, e);
                    pipe.close().await;
                }
            }
        };

        if let Err(e) = pipe.handshake(&addr, &self.cfg.secret).await {
            warn!("[{}] handshake failed: {}", pipe, e);
            pipe.close().await;
            return Ok(());
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "[{}] [conn: {:2}] [pool: {:2}] {} opened, handshake took {} ms",
            pipe,
            active,
            self.pool.len(),
            addr,
            started.elapsed().as_millis()
        );

        let label = pipe.to_string();
        let result = pipe.bind(sock).await;
        let active = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        match result {
            Ok(()) => self.pool.put(pipe).await,
            Err(_) => pipe.close().await,
        }
        info!(
            "[{}] [conn: {:2}] [pool: {:2}] {} closed",
            label,
            active,
            self.pool.len(),
            addr
        );
        Ok(())
    }
}
