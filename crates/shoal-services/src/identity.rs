//! Who this node is — fixed for the life of the process.

use shoal_core::config::ShoalConfig;
use shoal_core::record::PeerKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub name: String,
    pub kind: PeerKind,
    pub domain: Option<String>,
    /// Address our datagrams arrive from. Empty disables the collision guard.
    pub host: String,
    pub services: Vec<String>,
    pub writable: bool,
    pub port_import: u16,
    pub port_export: u16,
    pub port_prism: u16,
    pub port_announce: u16,
    pub port_ping: u16,
}

impl NodeIdentity {
    /// Build from config. `fallback_name` is used when no name is configured.
    pub fn from_config(config: &ShoalConfig, fallback_name: &str) -> Self {
        let name = if config.identity.name.is_empty() {
            fallback_name.to_string()
        } else {
            config.identity.name.clone()
        };
        Self {
            name,
            kind: config.identity.kind,
            domain: config.identity.domain.clone(),
            host: config.identity.host.clone(),
            services: config.advertised_services(),
            writable: config.services.writable,
            port_import: config.services.import_port,
            port_export: config.services.export_port,
            port_prism: config.services.prism_port,
            port_announce: config.network.announce_port,
            port_ping: config.network.ping_port,
        }
    }

    /// Minimal identity for tests and simulations.
    pub fn new(name: impl Into<String>, kind: PeerKind) -> Self {
        let services = match kind {
            PeerKind::Store => vec!["store".to_string(), "export".to_string()],
            PeerKind::Gateway => vec!["gateway".to_string(), "import".to_string()],
        };
        Self {
            name: name.into(),
            kind,
            domain: None,
            host: String::new(),
            services,
            writable: true,
            port_import: 0,
            port_export: 0,
            port_prism: 0,
            port_announce: 0,
            port_ping: 0,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}
