//! Configuration system for Shoal.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SHOAL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/shoal/config.toml
//!   3. ~/.config/shoal/config.toml

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::record::PeerKind;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShoalConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub services: ServicesConfig,
    pub gossip: GossipConfig,
    pub detector: DetectorConfig,
    pub locate: LocateConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Cluster-unique node name. Empty = system hostname.
    pub name: String,
    pub kind: PeerKind,
    /// For stores: the gateway this store routes behind.
    pub domain: Option<String>,
    /// Address peers see our datagrams coming from. Used by the
    /// hostname-collision guard. Empty = detect from the route to the multicast group.
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// IPv4 multicast group for gossip and locate traffic.
    pub multicast_addr: Ipv4Addr,
    pub multicast_port: u16,
    /// Multicast TTL. 1 keeps traffic on the local segment.
    pub multicast_ttl: u32,
    /// Local interface to join the group on. Unspecified = OS default.
    pub interface_addr: Ipv4Addr,
    /// TCP port for length-framed stream messages (boot replies).
    pub announce_port: u16,
    /// UDP port for liveness ping/pong.
    pub ping_port: u16,
    /// Localhost status endpoint.
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Advertised services. Empty = derived from identity kind.
    pub advertised: Vec<String>,
    pub import_port: u16,
    pub export_port: u16,
    pub prism_port: u16,
    /// Stores accept new replicas only when writable.
    pub writable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub announce_interval_ms: u64,
    /// Quiet window that ends boot mode.
    pub boot_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Base delay between probe cycles.
    pub probe_frequency_ms: u64,
    /// Upper bound of the random delay added to each cycle.
    pub probe_jitter_ms: u64,
    /// How long a single probe waits for a pong.
    pub probe_timeout_ms: u64,
    /// Consecutive failures tolerated before casting a down-vote.
    pub retry_threshold: u32,
    /// Votes older than this stop counting and are pruned by their caster.
    pub vote_lifetime_secs: u64,
    pub prune_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocateConfig {
    /// A locate resolves once no reply has arrived for this long.
    pub inactivity_ms: u64,
    /// How long a resolved existence map is cached. 0 = never cache.
    pub existence_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Sliding window in which an identical packet from the same sender
    /// is considered a duplicate.
    pub dedup_window_ms: u64,
    /// Upper bound on remembered packet digests.
    pub dedup_capacity: usize,
    /// Largest raw body accepted after a stream envelope.
    pub max_stream_body: usize,
    /// A stream must deliver its whole message, body included, within this.
    pub stream_read_timeout_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: PeerKind::Store,
            domain: None,
            host: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            multicast_addr: Ipv4Addr::new(226, 0, 0, 1),
            multicast_port: 3333,
            multicast_ttl: 1,
            interface_addr: Ipv4Addr::UNSPECIFIED,
            announce_port: 3334,
            ping_port: 3335,
            api_port: 3336,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            advertised: Vec::new(),
            import_port: 0,
            export_port: 0,
            prism_port: 0,
            writable: true,
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            announce_interval_ms: 5_000,
            boot_timeout_ms: 2_000,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            probe_frequency_ms: 10_000,
            probe_jitter_ms: 5_000,
            probe_timeout_ms: 1_000,
            retry_threshold: 3,
            vote_lifetime_secs: 300,
            prune_interval_secs: 60,
        }
    }
}

impl Default for LocateConfig {
    fn default() -> Self {
        Self {
            inactivity_ms: 250,
            existence_ttl_secs: 30,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 2_000,
            dedup_capacity: 4_096,
            max_stream_body: 16 * 1024 * 1024,
            stream_read_timeout_ms: 30_000,
        }
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

impl GossipConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }
}

impl DetectorConfig {
    pub fn probe_frequency(&self) -> Duration {
        Duration::from_millis(self.probe_frequency_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn vote_lifetime_ms(&self) -> u64 {
        self.vote_lifetime_secs * 1_000
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

impl LocateConfig {
    pub fn inactivity(&self) -> Duration {
        Duration::from_millis(self.inactivity_ms)
    }
}

impl TransportConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn stream_read_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_read_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("shoal")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ShoalConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ShoalConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SHOAL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ShoalConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Services this node advertises: explicit list, else derived from kind.
    pub fn advertised_services(&self) -> Vec<String> {
        if !self.services.advertised.is_empty() {
            return self.services.advertised.clone();
        }
        use crate::wire::{SERVICE_EXPORT, SERVICE_GATEWAY, SERVICE_IMPORT, SERVICE_STORE};
        let names: &[&str] = match self.identity.kind {
            PeerKind::Store => &[SERVICE_STORE, SERVICE_EXPORT],
            PeerKind::Gateway => &[SERVICE_GATEWAY, SERVICE_IMPORT],
        };
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Apply SHOAL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SHOAL_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Ok(v) = std::env::var("SHOAL_IDENTITY__KIND") {
            if let Ok(kind) = v.parse() {
                self.identity.kind = kind;
            }
        }
        if let Ok(v) = std::env::var("SHOAL_IDENTITY__DOMAIN") {
            self.identity.domain = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = std::env::var("SHOAL_IDENTITY__HOST") {
            self.identity.host = v;
        }
        if let Ok(v) = std::env::var("SHOAL_NETWORK__MULTICAST_ADDR") {
            if let Ok(addr) = v.parse() {
                self.network.multicast_addr = addr;
            }
        }
        if let Ok(v) = std::env::var("SHOAL_NETWORK__MULTICAST_PORT") {
            if let Ok(p) = v.parse() {
                self.network.multicast_port = p;
            }
        }
        if let Ok(v) = std::env::var("SHOAL_NETWORK__API_PORT") {
            if let Ok(p) = v.parse() {
                self.network.api_port = p;
            }
        }
    }
}
