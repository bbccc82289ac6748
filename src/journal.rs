use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

use crate::cache::Classification;
use crate::dns::types::RecordType;

/// Rolling in-memory log of handled queries: which verdict each hostname
/// got and which resolver the query was routed through.
const MAX_ENTRIES: usize = 4096;

#[derive(Debug, Clone, serde::Serialize)]
pub struct JournalEntry {
    pub timestamp: String,
    pub hostname: String,
    pub qtype: String,
    pub verdict: String,
    pub route: String,
    pub latency_us: u64,
}

pub struct Journal {
    entries: RwLock<Vec<JournalEntry>>,
    total_recorded: AtomicU64,
}

impl Journal {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            total_recorded: AtomicU64::new(0),
        }
    }

    pub fn record_query(
        &self,
        hostname: &str,
        qtype: &RecordType,
        verdict: Classification,
        route: &str,
        latency: Duration,
    ) {
        let entry = JournalEntry {
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            hostname: hostname.to_string(),
            qtype: qtype.name(),
            verdict: verdict.name().to_string(),
            route: route.to_string(),
            latency_us: latency.as_micros() as u64,
        };

        let mut entries = self.entries.write();
        entries.push(entry);
        self.total_recorded.fetch_add(1, Ordering::Relaxed);

        // Rotation: keep within MAX_ENTRIES
        if entries.len() > MAX_ENTRIES {
            let drain_count = entries.len() - MAX_ENTRIES;
            entries.drain(..drain_count);
        }
    }

    /// Search by hostname substring, most recent first
    pub fn search(&self, hostname: Option<&str>, limit: usize) -> Vec<JournalEntry> {
        let entries = self.entries.read();
        entries
            .iter()
            .rev()
            .filter(|e| match hostname {
                Some(needle) => e.hostname.contains(needle),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn recent(&self, count: usize) -> Vec<JournalEntry> {
        let entries = self.entries.read();
        entries.iter().rev().take(count).cloned().collect()
    }

    pub fn get_stats(&self) -> serde_json::Value {
        let entries = self.entries.read();
        serde_json::json!({
            "current_entries": entries.len(),
            "max_entries": MAX_ENTRIES,
            "total_recorded": self.total_recorded.load(Ordering::Relaxed),
        })
    }
}
