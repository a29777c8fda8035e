//! Durable cluster records and the keys they are stored under.
//!
//! Records are persisted as JSON documents in the external document store.
//! Key layout:
//!   peer:{name}
//!   vote:{target}:{caster}
//!   inventory:{hash}:{gateway}:{store}

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::wire::ReadyState;

pub const PEER_PREFIX: &str = "peer:";
pub const VOTE_PREFIX: &str = "vote:";
pub const INVENTORY_PREFIX: &str = "inventory:";

/// Wall clock in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Peers ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Store,
    Gateway,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerKind::Store => "store",
            PeerKind::Gateway => "gateway",
        }
    }
}

impl std::str::FromStr for PeerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "store" => Ok(PeerKind::Store),
            "gateway" | "prism" => Ok(PeerKind::Gateway),
            other => Err(format!("unknown peer kind '{other}'")),
        }
    }
}

/// Resource metrics sampled on the announcing node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    pub disk_free: u64,
    pub disk_total: u64,
    /// Percent, summed over cores divided by core count.
    pub cpu_used: f32,
    pub cpu_count: u32,
    pub memory_free: u64,
    pub memory_total: u64,
    /// Link speed in bits per second, 0 when unknown.
    pub net_speed: u64,
    pub net_in_bps: u64,
    pub net_out_bps: u64,
}

impl Capacity {
    /// Free disk as a percentage of total, clamped to 0..=100.
    /// A node that reports no disk has no capacity.
    pub fn available_capacity(&self) -> u8 {
        if self.disk_total == 0 {
            return 0;
        }
        let pct = (self.disk_free as f64 / self.disk_total as f64 * 100.0).round();
        pct.clamp(0.0, 100.0) as u8
    }
}

/// One node of the cluster as seen by the rest of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub name: String,
    pub kind: PeerKind,
    /// For stores: the gateway they route behind.
    pub domain: Option<String>,
    /// Source address of the last accepted announce.
    pub host: String,
    /// Named service ports (`announce`, `ping`, `export`, ...).
    pub ports: BTreeMap<String, u16>,
    pub services: BTreeSet<String>,
    pub capacity: Capacity,
    pub available_capacity: u8,
    pub available: bool,
    pub writable: bool,
    pub active: bool,
    pub ready_state: ReadyState,
    pub peer_count: u32,
    /// Sender clock of the last accepted announce, unix ms. Never decreases.
    pub sent: u64,
    /// `sent - previous sent - announce interval`, clamped at zero.
    pub latency: u64,
    pub import_hits: u64,
}

impl PeerRecord {
    pub fn new(name: impl Into<String>, kind: PeerKind, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            domain: None,
            host: host.into(),
            ports: BTreeMap::new(),
            services: BTreeSet::new(),
            capacity: Capacity::default(),
            available_capacity: 0,
            available: true,
            writable: false,
            active: true,
            ready_state: ReadyState::Booting,
            peer_count: 0,
            sent: 0,
            latency: 0,
            import_hits: 0,
        }
    }

    pub fn key(&self) -> String {
        peer_key(&self.name)
    }

    pub fn port(&self, name: &str) -> Option<u16> {
        self.ports.get(name).copied()
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains(service)
    }

    /// Routing domain used for replica spreading. A gateway is its own domain.
    pub fn routing_domain(&self) -> &str {
        match self.kind {
            PeerKind::Gateway => &self.name,
            PeerKind::Store => self.domain.as_deref().unwrap_or(""),
        }
    }
}

pub fn peer_key(name: &str) -> String {
    format!("{PEER_PREFIX}{name}")
}

// ── Down-votes ────────────────────────────────────────────────────────────────

/// One caster's claim that a target is unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownVote {
    pub target: String,
    pub caster: String,
    /// Unix ms when the vote was cast.
    pub cast_at: u64,
}

impl DownVote {
    pub fn key(&self) -> String {
        vote_key(&self.target, &self.caster)
    }

    /// A vote counts toward quorum until it is older than `lifetime_ms`.
    pub fn is_live(&self, now: u64, lifetime_ms: u64) -> bool {
        now.saturating_sub(self.cast_at) < lifetime_ms
    }
}

pub fn vote_key(target: &str, caster: &str) -> String {
    format!("{VOTE_PREFIX}{target}:{caster}")
}

/// Prefix of every vote cast against `target`.
pub fn votes_against_prefix(target: &str) -> String {
    format!("{VOTE_PREFIX}{target}:")
}

// ── Inventory ─────────────────────────────────────────────────────────────────

/// A copy of one piece of content on one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub hash: String,
    pub gateway: String,
    pub store: String,
    pub mime_type: String,
    pub mime_extension: String,
    /// Path relative to the store's content root.
    pub relative_path: String,
    pub created_at: u64,
}

impl InventoryRecord {
    pub fn key(&self) -> String {
        inventory_key(&self.hash, &self.gateway, &self.store)
    }
}

pub fn inventory_key(hash: &str, gateway: &str, store: &str) -> String {
    format!("{INVENTORY_PREFIX}{hash}:{gateway}:{store}")
}

// ── Content hashes & locations ────────────────────────────────────────────────

/// Content hashes are lowercase hex SHA-1 (40) or SHA-256 (64) digests.
pub fn validate_hash(hash: &str) -> Result<(), ValidationError> {
    let well_formed = matches!(hash.len(), 40 | 64)
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::MalformedHash(hash.to_string()))
    }
}

/// Result of a locate: peer name → whether it holds the content.
/// Peers that never answered are absent.
pub type ExistenceMap = BTreeMap<String, bool>;

/// Where one copy lives: the store and the gateway in front of it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub gateway: String,
    pub store: String,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.gateway, self.store)
    }
}
