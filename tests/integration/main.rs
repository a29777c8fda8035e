//! Shoal integration test harness.
//!
//! Nodes run the real membership, locate, inventory and failure-detector
//! components, wired
//! together by an in-process bus instead of sockets. Each node keeps its
//! own document store, so every registry is built from what that node
//! actually heard. The bus mirrors the daemon's delivery rules:
//!
//!   * broadcasts reach every node, the sender included (multicast loop)
//!   * datagrams reach the node bound to the address
//!   * streams reach the node whose host and announce port match
//!
//! A muted node neither sends nor receives, which stands in for a crashed
//! or partitioned peer.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{broadcast, watch};

use shoal_core::config::{DetectorConfig, GossipConfig, LocateConfig};
use shoal_core::record::{Capacity, PeerKind, PeerRecord};
use shoal_core::wire::Event;
use shoal_services::send_target::{outbox, OutboxReceiver};
use shoal_services::{
    EventHandler, FailureDetector, Inventory, LocateResponder, Locator, MemoryCache,
    MemoryDocumentStore, Membership, NodeIdentity, PeerRegistry, Probe, SendTarget, SharedCache,
};

mod detector;
mod locate;
mod membership;
mod placement;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const DATAGRAM_PORT: u16 = 3333;
pub const STREAM_PORT: u16 = 3334;
pub const EXPORT_PORT: u16 = 9000;

pub fn hash(c: char) -> String {
    c.to_string().repeat(40)
}

/// Probe that fails for every peer on the far side of a partition.
#[derive(Clone, Default)]
pub struct Partition {
    unreachable: Arc<Mutex<HashSet<String>>>,
}

impl Partition {
    pub fn cut(&self, name: &str) {
        self.unreachable.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self) {
        self.unreachable.lock().unwrap().clear();
    }
}

impl Probe for Partition {
    async fn probe(&self, peer: &PeerRecord) -> anyhow::Result<()> {
        if self.unreachable.lock().unwrap().contains(&peer.name) {
            anyhow::bail!("{} unreachable", peer.name);
        }
        Ok(())
    }
}

/// One failure is tolerated, the second earns a vote.
pub fn detector_config() -> DetectorConfig {
    DetectorConfig {
        retry_threshold: 1,
        probe_timeout_ms: 50,
        ..DetectorConfig::default()
    }
}

pub struct Node {
    pub name: String,
    pub addr: SocketAddr,
    pub registry: PeerRegistry,
    pub cache: SharedCache,
    pub membership: Arc<Membership>,
    pub locator: Arc<Locator>,
    pub detector: Arc<FailureDetector<Partition>>,
    pub inventory: Option<Arc<Inventory>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    muted: AtomicBool,
    _capacity: watch::Sender<Capacity>,
}

impl Node {
    pub fn mute(&self) {
        self.muted.store(true, Ordering::Release);
    }

    pub fn unmute(&self) {
        self.muted.store(false, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        self.inventory.as_ref().expect("node is not a store")
    }

    fn deliver(&self, origin: SocketAddr, event: &Event) {
        for handler in &self.handlers {
            if handler.kinds().contains(&event.kind()) {
                if let Err(e) = handler.handle(origin, event) {
                    eprintln!("{}: {} handler failed: {e}", self.name, event.kind());
                }
            }
        }
    }
}

type Nodes = Arc<RwLock<Vec<Arc<Node>>>>;

pub struct Cluster {
    nodes: Nodes,
    gossip: GossipConfig,
    locate: LocateConfig,
    partition: Partition,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    /// Announces are far apart so tests see boot replies and the first
    /// announce of each node, not a stream of refreshes.
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(RwLock::new(Vec::new())),
            gossip: GossipConfig {
                announce_interval_ms: 5_000,
                boot_timeout_ms: 150,
            },
            locate: LocateConfig::default(),
            partition: Partition::default(),
        }
    }

    /// Shared by every node's detector.
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn gossip(&self) -> &GossipConfig {
        &self.gossip
    }

    pub fn locate_config(&self) -> &LocateConfig {
        &self.locate
    }

    pub fn store(&self, name: &str, gateway: &str) -> Arc<Node> {
        self.spawn(NodeIdentity::new(name, PeerKind::Store).with_domain(gateway))
    }

    pub fn gateway(&self, name: &str) -> Arc<Node> {
        self.spawn(NodeIdentity::new(name, PeerKind::Gateway))
    }

    pub fn node(&self, name: &str) -> Arc<Node> {
        self.nodes
            .read()
            .unwrap()
            .iter()
            .find(|n| n.name == name)
            .cloned()
            .unwrap_or_else(|| panic!("no node named {name}"))
    }

    /// Start boot + announce loops on every node added so far.
    pub fn run_gossip(&self, shutdown: &broadcast::Sender<()>) {
        for node in self.nodes.read().unwrap().iter() {
            tokio::spawn(node.membership.clone().run(shutdown.subscribe()));
        }
    }

    fn spawn(&self, identity: NodeIdentity) -> Arc<Node> {
        let octet = self.nodes.read().unwrap().len() as u8 + 1;
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet));
        let mut identity = identity.with_host(ip.to_string());
        identity.port_announce = STREAM_PORT;
        identity.port_export = EXPORT_PORT;

        let docs = MemoryDocumentStore::shared();
        let registry = PeerRegistry::new(docs.clone());
        let cache = MemoryCache::shared();
        let (tx, rx) = outbox();
        let (capacity_tx, capacity_rx) = watch::channel(Capacity::default());

        let membership = Arc::new(Membership::new(
            identity.clone(),
            registry.clone(),
            tx.clone(),
            &self.gossip,
            capacity_rx,
        ));
        let locator = Arc::new(Locator::new(registry.clone(), tx.clone(), cache.clone(), &self.locate));
        let detector = Arc::new(
            FailureDetector::new(&identity.name, registry.clone(), self.partition.clone(), detector_config())
                .with_outbox(tx.clone()),
        );

        let mut handlers: Vec<Arc<dyn EventHandler>> = vec![
            membership.clone() as Arc<dyn EventHandler>,
            locator.clone() as Arc<dyn EventHandler>,
            detector.clone() as Arc<dyn EventHandler>,
        ];
        let inventory = match identity.kind {
            PeerKind::Store => {
                let gateway = identity.domain.clone().unwrap_or_default();
                let inventory = Arc::new(Inventory::new(&identity.name, gateway, docs));
                handlers.push(Arc::new(LocateResponder::new(&identity.name, inventory.clone(), tx)));
                Some(inventory)
            }
            PeerKind::Gateway => None,
        };

        let node = Arc::new(Node {
            name: identity.name.clone(),
            addr: SocketAddr::new(ip, DATAGRAM_PORT),
            registry,
            cache,
            membership,
            locator,
            detector,
            inventory,
            handlers,
            muted: AtomicBool::new(false),
            _capacity: capacity_tx,
        });
        self.nodes.write().unwrap().push(node.clone());
        tokio::spawn(pump(node.clone(), rx, self.nodes.clone()));
        node
    }
}

/// Carry one node's outbox onto the bus.
async fn pump(sender: Arc<Node>, mut rx: OutboxReceiver, nodes: Nodes) {
    while let Some((target, event)) = rx.recv().await {
        if sender.is_muted() {
            continue;
        }
        let recipients: Vec<Arc<Node>> = {
            let nodes = nodes.read().unwrap();
            nodes
                .iter()
                .filter(|n| !n.is_muted())
                .filter(|n| match &target {
                    SendTarget::Broadcast => true,
                    SendTarget::Datagram { addr } => n.addr == *addr,
                    SendTarget::Stream { host, port, .. } => {
                        n.addr.ip().to_string() == *host && *port == STREAM_PORT
                    }
                })
                .cloned()
                .collect()
        };
        let origin = match target {
            SendTarget::Stream { .. } => SocketAddr::new(sender.addr.ip(), 49152),
            _ => sender.addr,
        };
        for node in recipients {
            node.deliver(origin, &event);
        }
    }
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {within:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bus_routes_streams_by_host_and_port() {
    let cluster = Cluster::new();
    let a = cluster.store("a", "gw1");
    let b = cluster.store("b", "gw1");

    // b answers a's boot request over a stream to a's announce port.
    a.membership.handle_boot(
        &shoal_core::wire::BootRequest {
            hostname: "c".to_string(),
            port_announce: STREAM_PORT,
        },
        b.addr.ip(),
    );

    eventually(Duration::from_secs(1), || {
        b.registry.get("a").ok().flatten().is_some()
    })
    .await
    .unwrap();
    assert!(a.registry.get("a").unwrap().is_none(), "stream must not loop back");
}
