use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::cache::{Classification, DetectionCache};
use crate::config::DetectionConfig;
use crate::dns::packet;
use crate::dns::types::RecordType;
use crate::upstream::PlainResolver;

/// Pollution detective: decides whether a hostname's DNS answers are being
/// forged in transit.
///
/// The decoy ("honeypot") resolver has no legitimate reason to answer for
/// anything - a reply means an interceptor forged it on the wire. A silent
/// decoy hands the question to the local resolver, whose CNAME chain is then
/// validated alias by alias: one poisoned alias makes the whole answer
/// unusable. Detection that cannot settle fails closed to polluted, forcing
/// the query through the trusted upstream.
pub struct Detective {
    cache: Arc<DetectionCache>,
    honeypot: PlainResolver,
    local: Arc<PlainResolver>,
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    retry_limit: u32,
    max_chain_depth: u32,
    verdict_ttl: u64,
}

impl Detective {
    pub fn new(
        cache: Arc<DetectionCache>,
        honeypot: PlainResolver,
        local: Arc<PlainResolver>,
        config: &DetectionConfig,
    ) -> Self {
        Self {
            cache,
            honeypot,
            local,
            inflight: DashMap::new(),
            retry_limit: config.retry_limit,
            max_chain_depth: config.max_chain_depth,
            verdict_ttl: config.verdict_ttl_secs,
        }
    }

    /// Classify a hostname, cache-first. Concurrent callers for the same
    /// name collapse onto one in-flight detection; waiters are served from
    /// the cache once the first caller has committed a verdict.
    pub async fn classify(&self, hostname: &str) -> Classification {
        let hostname = normalize_hostname(hostname);

        if let Some(state) = self.cache.get(&hostname) {
            debug!("Cached verdict: {} = {}", hostname, state.name());
            return state;
        }

        let gate = self
            .inflight
            .entry(hostname.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = gate.lock().await;

        let verdict = match self.cache.get(&hostname) {
            Some(state) => state,
            None => self.classify_at_depth(&hostname, 0).await,
        };

        drop(guard);
        self.inflight.remove(&hostname);
        verdict
    }

    /// Cache-checked classification of one link in a CNAME chain. Boxed for
    /// async recursion; depth bounds the descent.
    fn classify_at_depth<'a>(
        &'a self,
        hostname: &'a str,
        depth: u32,
    ) -> Pin<Box<dyn Future<Output = Classification> + Send + 'a>> {
        Box::pin(async move {
            if depth > self.max_chain_depth {
                warn!("CNAME chain through {} exceeds depth {}, forcing polluted",
                    hostname, self.max_chain_depth);
                self.cache
                    .put(hostname, Classification::Polluted, self.verdict_ttl);
                return Classification::Polluted;
            }

            if depth > 0 {
                if let Some(state) = self.cache.get(hostname) {
                    return state;
                }
            }

            let verdict = self.detect(hostname, depth).await;
            self.cache.put(hostname, verdict, self.verdict_ttl);
            verdict
        })
    }

    /// The probe sequence. One iteration per attempt: honeypot first (a
    /// forged answer is the strongest and cheapest signal, one round trip),
    /// then the local resolver's CNAME chain. Transient transport failures
    /// burn an attempt; exhausting the ceiling fails closed.
    async fn detect(&self, hostname: &str, depth: u32) -> Classification {
        for attempt in 0..=self.retry_limit {
            let probe = packet::build_query(rand::random(), hostname, RecordType::A, true);

            let honeypot_reply = match self.honeypot.exchange(&probe).await {
                Ok(exchange) => match packet::parse_packet(&exchange.response) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!("Honeypot reply for {} unparsable (attempt {}): {}",
                            hostname, attempt, e);
                        continue;
                    }
                },
                Err(e) => {
                    debug!("Honeypot probe for {} failed (attempt {}): {}", hostname, attempt, e);
                    continue;
                }
            };

            if !honeypot_reply.answers.is_empty() {
                info!("{} answered by the decoy resolver, polluted", hostname);
                return Classification::Polluted;
            }

            let local_reply = match self.local.exchange(&probe).await {
                Ok(exchange) => match packet::parse_packet(&exchange.response) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!("Local reply for {} unparsable (attempt {}): {}",
                            hostname, attempt, e);
                        continue;
                    }
                },
                Err(e) => {
                    debug!("Local probe for {} failed (attempt {}): {}", hostname, attempt, e);
                    continue;
                }
            };

            for record in &local_reply.answers {
                if record.rtype != RecordType::CNAME {
                    continue;
                }
                let target = match packet::parse_name_at_offset(&local_reply.raw, record.rdata_offset)
                {
                    Ok(target) => normalize_hostname(&target),
                    Err(e) => {
                        // A garbled alias is skipped, not fatal
                        warn!("Skipping malformed CNAME target in {} answer: {}", hostname, e);
                        continue;
                    }
                };
                if target.is_empty() || target == hostname {
                    continue;
                }

                if self.classify_at_depth(&target, depth + 1).await == Classification::Polluted {
                    info!("{} rides a polluted alias ({}), polluted", hostname, target);
                    return Classification::Polluted;
                }
            }

            // No CNAMEs, or every alias came back clean
            return Classification::Clean;
        }

        info!("{} undetectable after {} attempts, fail-closed to polluted",
            hostname, self.retry_limit + 1);
        Classification::Polluted
    }
}

/// Lowercase, no trailing dot - the cache key form.
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_lowercase()
}
