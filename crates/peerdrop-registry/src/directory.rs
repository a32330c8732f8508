//! Peer directory for the registry
//!
//! Entries are kept in memory and expire lazily: nothing is evicted until a
//! query runs, at which point every entry older than the TTL is dropped.

use parking_lot::Mutex;
use peerdrop_core::{Error, PeerSummary, Result};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// What the registry remembers about one peer
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub ip: String,
    pub port: u16,
    /// PEM public key, stored but never interpreted
    pub public_key: String,
    pub files: BTreeSet<String>,
    pub last_seen: Instant,
}

/// Liveness-tracked map of peer id to entry
pub struct Registry {
    ttl: Duration,
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl Registry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or fully replace a peer's entry
    pub fn register(
        &self,
        peer_id: &str,
        ip: &str,
        port: u16,
        public_key: &str,
        files: Vec<String>,
    ) {
        self.register_at(peer_id, ip, port, public_key, files, Instant::now())
    }

    pub(crate) fn register_at(
        &self,
        peer_id: &str,
        ip: &str,
        port: u16,
        public_key: &str,
        files: Vec<String>,
        now: Instant,
    ) {
        let entry = RegistryEntry {
            ip: ip.to_string(),
            port,
            public_key: public_key.to_string(),
            files: files.into_iter().collect(),
            last_seen: now,
        };
        tracing::info!(
            "Registered {} at {}:{} ({} files)",
            short(peer_id),
            entry.ip,
            entry.port,
            entry.files.len()
        );
        self.entries.lock().insert(peer_id.to_string(), entry);
    }

    /// Refresh a known peer's liveness
    pub fn heartbeat(&self, peer_id: &str) -> Result<()> {
        self.heartbeat_at(peer_id, Instant::now())
    }

    pub(crate) fn heartbeat_at(&self, peer_id: &str, now: Instant) -> Result<()> {
        match self.entries.lock().get_mut(peer_id) {
            Some(entry) => {
                entry.last_seen = now;
                tracing::debug!("Heartbeat from {}", short(peer_id));
                Ok(())
            }
            None => Err(Error::RegistryMiss(format!("unknown peer {}", peer_id))),
        }
    }

    /// Evict stale entries, then list live peers, optionally only those
    /// sharing `file`. Most recently seen peers come first.
    pub fn query(&self, file: Option<&str>) -> Vec<PeerSummary> {
        self.query_at(file, Instant::now())
    }

    pub(crate) fn query_at(&self, file: Option<&str>, now: Instant) -> Vec<PeerSummary> {
        let mut entries = self.entries.lock();

        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= self.ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::info!("Evicted {} stale peers", evicted);
        }

        let mut live: Vec<(&String, &RegistryEntry)> = entries
            .iter()
            .filter(|(_, entry)| file.map_or(true, |f| entry.files.contains(f)))
            .collect();
        live.sort_by(|a, b| b.1.last_seen.cmp(&a.1.last_seen).then_with(|| a.0.cmp(b.0)));

        live.into_iter()
            .map(|(peer_id, entry)| PeerSummary {
                peer_id: peer_id.clone(),
                ip: entry.ip.clone(),
                port: entry.port,
                files: entry.files.iter().cloned().collect(),
            })
            .collect()
    }

    /// Number of stored entries, stale ones included
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn short(peer_id: &str) -> &str {
    peer_id.get(..8).unwrap_or(peer_id)
}
