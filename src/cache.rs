use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Pollution verdict for a hostname.
///
/// Persisted as the same integers the cache file has always used:
/// 1 = polluted, 2 = clean. Anything else restores as Unknown and is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Unknown,
    Polluted,
    Clean,
}

impl Classification {
    pub fn as_u8(&self) -> u8 {
        match self {
            Classification::Unknown => 0,
            Classification::Polluted => 1,
            Classification::Clean => 2,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Classification::Polluted,
            2 => Classification::Clean,
            _ => Classification::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Classification::Unknown => "unknown",
            Classification::Polluted => "polluted",
            Classification::Clean => "clean",
        }
    }
}

/// On-disk form of one verdict: state integer plus absolute unix-seconds expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub state: u8,
    pub expiry: i64,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    state: Classification,
    expires_at: i64,
}

/// Verdict cache: strict LRU bounded by capacity, with per-entry absolute
/// expiry on top. An entry past its expiry is logically absent - it misses on
/// `get` and is dropped on contact; the supervisor sweep purges the rest.
pub struct DetectionCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    // Stats
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl DetectionCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up a verdict. Misses on absent or expired entries; a hit refreshes
    /// LRU recency.
    pub fn get(&self, hostname: &str) -> Option<Classification> {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.peek(hostname) {
            if entry.expires_at <= now {
                entries.pop(hostname);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        match entries.get(hostname) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.state)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Upsert a verdict with a TTL from now. Refreshes recency; inserting a
    /// new key into a full store evicts the LRU tail.
    pub fn put(&self, hostname: &str, state: Classification, ttl_secs: u64) {
        let expires_at = Utc::now().timestamp() + ttl_secs as i64;
        self.put_with_expiry(hostname, state, expires_at);
    }

    fn put_with_expiry(&self, hostname: &str, state: Classification, expires_at: i64) {
        let mut entries = self.entries.lock();
        if entries.len() == entries.cap().get() && !entries.contains(hostname) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.put(hostname.to_string(), CacheEntry { state, expires_at });
    }

    /// All currently live entries, in persistable form.
    pub fn snapshot(&self) -> HashMap<String, PersistedEntry> {
        let now = Utc::now().timestamp();
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(name, e)| {
                (
                    name.clone(),
                    PersistedEntry {
                        state: e.state.as_u8(),
                        expiry: e.expires_at,
                    },
                )
            })
            .collect()
    }

    /// Bulk-load persisted verdicts at startup. Entries already expired or
    /// with an unknown state are skipped.
    pub fn restore(&self, persisted: HashMap<String, PersistedEntry>) -> usize {
        let now = Utc::now().timestamp();
        let mut loaded = 0;
        for (hostname, entry) in persisted {
            let state = Classification::from_u8(entry.state);
            if state == Classification::Unknown || entry.expiry <= now {
                continue;
            }
            self.put_with_expiry(&hostname, state, entry.expiry);
            loaded += 1;
        }
        loaded
    }

    /// Proactively purge expired entries, independent of LRU order.
    /// Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            entries.pop(name);
            debug!("Expired verdict swept: {}", name);
        }
        self.expirations.fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Cache stats for the Web UI
    pub fn get_stats(&self) -> serde_json::Value {
        let (len, cap) = {
            let entries = self.entries.lock();
            (entries.len(), entries.cap().get())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        serde_json::json!({
            "entries": len,
            "capacity": cap,
            "hits": hits,
            "misses": misses,
            "hit_rate_percent": format!("{:.1}", hit_rate),
            "evictions": self.evictions.load(Ordering::Relaxed),
            "expirations": self.expirations.load(Ordering::Relaxed),
        })
    }

    /// List live verdicts (for Web UI)
    pub fn list_entries(&self) -> Vec<serde_json::Value> {
        let now = Utc::now().timestamp();
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(name, e)| {
                serde_json::json!({
                    "hostname": name,
                    "state": e.state.name(),
                    "remaining_ttl": e.expires_at - now,
                })
            })
            .collect()
    }
}
