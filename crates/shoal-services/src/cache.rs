//! Ephemeral key-value cache — fast-path counters and existence maps.
//!
//! Like the document store this is an external collaborator; the cluster
//! only needs get/set/expire/increment. Entries may vanish at any time,
//! so nothing here is a source of truth.
//!
//! Keys used by the cluster:
//!   exists:{hash}          cached locate result (JSON existence map)
//!   hits:{token}:{peer}    winner-selection counter

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub trait KeyValueCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Store a value. `ttl = None` keeps it until evicted or expired.
    fn set(&self, key: &str, value: String, ttl: Option<Duration>);

    /// Give an existing key a new time to live. `Duration::ZERO` drops it now.
    fn expire(&self, key: &str, ttl: Duration);

    /// Atomically add one to an integer value (missing = 0). Returns the new value.
    fn increment(&self, key: &str) -> i64;
}

pub type SharedCache = Arc<dyn KeyValueCache>;

pub fn existence_key(hash: &str) -> String {
    format!("exists:{hash}")
}

pub fn hits_key(token: &str, peer: &str) -> String {
    format!("hits:{token}:{peer}")
}

/// Read a counter, treating missing or non-numeric values as zero.
pub fn counter(cache: &dyn KeyValueCache, key: &str) -> i64 {
    cache
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

// ── In-memory cache ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Process-local [`KeyValueCache`] with lazy expiry.
#[derive(Clone, Default)]
pub struct MemoryCache {
    slots: Arc<DashMap<String, Slot>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedCache {
        Arc::new(Self::new())
    }

    /// Drop every expired slot. Reads already ignore them; this only frees memory.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        before - self.slots.len()
    }

    /// Sweep on a fixed interval until shutdown.
    pub async fn run_sweeper(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dropped = self.sweep();
                    if dropped > 0 {
                        tracing::debug!(dropped, "expired cache entries swept");
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }
}

impl KeyValueCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let expired = match self.slots.get(key) {
            Some(slot) if !slot.is_expired(now) => return Some(slot.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.slots.remove_if(key, |_, slot| slot.is_expired(now));
        }
        None
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.slots.insert(key.to_string(), Slot { value, expires_at });
    }

    fn expire(&self, key: &str, ttl: Duration) {
        if ttl.is_zero() {
            self.slots.remove(key);
            return;
        }
        if let Some(mut slot) = self.slots.get_mut(key) {
            slot.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn increment(&self, key: &str) -> i64 {
        let now = Instant::now();
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: "0".to_string(),
            expires_at: None,
        });
        if slot.is_expired(now) {
            slot.value = "0".to_string();
            slot.expires_at = None;
        }
        let next = slot.value.parse::<i64>().unwrap_or(0) + 1;
        slot.value = next.to_string();
        next
    }
}
