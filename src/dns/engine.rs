use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::cache::{Classification, DetectionCache, PersistedEntry};
use crate::config::Config;
use crate::detective::Detective;
use crate::dns::packet;
use crate::journal::Journal;
use crate::upstream::{self, PlainResolver, TlsResolver};

/// Core query engine - classifies each hostname and routes the query to the
/// local or the trusted upstream accordingly.
pub struct QueryEngine {
    pub config: Arc<Config>,
    pub cache: Arc<DetectionCache>,
    pub detective: Detective,
    pub local: Arc<PlainResolver>,
    pub secure: Arc<TlsResolver>,
    pub journal: Arc<Journal>,
}

impl QueryEngine {
    pub async fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let cache = Arc::new(DetectionCache::new(config.detection.cache_capacity));

        // Best-effort restore of persisted verdicts
        if config.persist.enabled {
            match load_snapshot(&config.persist.path) {
                Ok(Some(persisted)) => {
                    let loaded = cache.restore(persisted);
                    info!("Restored {} verdicts from {}", loaded, config.persist.path);
                }
                Ok(None) => debug!("No verdict snapshot at {}", config.persist.path),
                Err(e) => warn!(
                    "Ignoring unreadable verdict snapshot {}: {}",
                    config.persist.path, e
                ),
            }
        }

        let exchange_timeout = Duration::from_millis(config.upstreams.exchange_timeout_ms);

        let local_addr: SocketAddr = config.upstreams.local_dns.parse().map_err(|e| {
            anyhow::anyhow!("Invalid local resolver '{}': {}", config.upstreams.local_dns, e)
        })?;
        let honeypot_addr: SocketAddr = config.upstreams.honeypot_dns.parse().map_err(|e| {
            anyhow::anyhow!(
                "Invalid honeypot resolver '{}': {}",
                config.upstreams.honeypot_dns,
                e
            )
        })?;

        let local = Arc::new(PlainResolver::new(local_addr, exchange_timeout));
        let honeypot = PlainResolver::new(honeypot_addr, exchange_timeout);

        let (secure_addr, server_name) =
            upstream::resolve_tls_upstream(&config.upstreams.tls_dns).await;
        let secure = Arc::new(TlsResolver::new(
            secure_addr,
            &server_name,
            Duration::from_secs(config.upstreams.tls_dial_timeout_secs),
            exchange_timeout,
        )?);
        info!("Secure upstream {} (sni: {})", secure_addr, server_name);

        let detective = Detective::new(cache.clone(), honeypot, local.clone(), &config.detection);
        let journal = Arc::new(Journal::new());

        Ok(Self {
            config,
            cache,
            detective,
            local,
            secure,
            journal,
        })
    }

    /// Route one raw DNS query and return the raw reply bytes. An error here
    /// means the forward itself failed; the server loop answers NXDOMAIN.
    pub async fn handle_query(&self, query_data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let start = Instant::now();

        let (qname, qtype) = packet::extract_query_info(query_data)?;
        debug!("Query: {} {}", qname, qtype.name());

        let verdict = self.detective.classify(&qname).await;

        // One forwarding attempt per verdict, keeping per-query latency bounded
        let (result, route) = match verdict {
            Classification::Polluted => (self.secure.exchange(query_data).await, "secure"),
            _ => (self.local.exchange(query_data).await, "local"),
        };

        match result {
            Ok(exchange) => {
                let reply = packet::make_reply(query_data, &exchange.response)?;
                info!(
                    "{} {} is {}, resolver: {} ({:?})",
                    qname,
                    qtype.name(),
                    verdict.name(),
                    route,
                    exchange.latency
                );
                self.journal
                    .record_query(&qname, &qtype, verdict, route, start.elapsed());
                Ok(reply)
            }
            Err(e) => {
                self.journal
                    .record_query(&qname, &qtype, verdict, "failed", start.elapsed());
                Err(anyhow::anyhow!("Forwarding {} via {} failed: {}", qname, route, e))
            }
        }
    }

    /// Handle TCP DNS queries (length-prefixed)
    pub async fn handle_tcp(&self, mut stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
        debug!("TCP connection from {}", addr);

        loop {
            let mut len_buf = [0u8; 2];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let msg_len = u16::from_be_bytes(len_buf) as usize;

            if msg_len == 0 {
                break;
            }

            let mut msg_buf = vec![0u8; msg_len];
            stream.read_exact(&mut msg_buf).await?;

            let response = match self.handle_query(&msg_buf).await {
                Ok(reply) => reply,
                Err(_) => packet::build_nxdomain(&msg_buf)?,
            };

            let resp_len = (response.len() as u16).to_be_bytes();
            stream.write_all(&resp_len).await?;
            stream.write_all(&response).await?;
        }

        Ok(())
    }

    /// One supervisor round: purge expired verdicts, persist the live set.
    pub fn sweep_and_persist(&self) {
        let removed = self.cache.sweep_expired();
        if removed > 0 {
            info!("Swept {} expired verdicts ({} live)", removed, self.cache.len());
        }

        if !self.config.persist.enabled {
            return;
        }

        let snapshot = self.cache.snapshot();
        match serde_json::to_vec(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.config.persist.path, bytes) {
                    warn!(
                        "Failed to persist verdict cache to {}: {}",
                        self.config.persist.path, e
                    );
                } else {
                    debug!(
                        "Persisted {} verdicts to {}",
                        snapshot.len(),
                        self.config.persist.path
                    );
                }
            }
            Err(e) => warn!("Failed to serialize verdict cache: {}", e),
        }
    }

    /// Cache supervisor loop - periodic expiry sweep plus snapshot write,
    /// for the lifetime of the process.
    pub async fn run_cache_supervisor(&self) {
        let interval = Duration::from_secs(self.config.persist.sweep_interval_secs);
        info!("Cache supervisor started (interval: {:?})", interval);

        loop {
            tokio::time::sleep(interval).await;
            self.sweep_and_persist();
        }
    }

    /// Aggregated stats for the Web UI
    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "cache": self.cache.get_stats(),
            "journal": self.journal.get_stats(),
            "upstreams": {
                "local": self.local.addr().to_string(),
                "secure": self.secure.addr().to_string(),
            },
        })
    }
}

fn load_snapshot(path: &str) -> anyhow::Result<Option<HashMap<String, PersistedEntry>>> {
    if !Path::new(path).exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}
