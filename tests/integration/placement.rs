use crate::*;

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::SeedableRng;

use shoal_core::record::PeerRecord;
use shoal_services::{Delta, Placement, ReplicationIntent, TransferApi};

// ══════════════════════════════════════════════════════════════════════════════
//  Replication Driven By Locate
// ══════════════════════════════════════════════════════════════════════════════

/// Moves inventory entries between simulated stores the way a real
/// store-to-store push or delete would.
struct Shipping {
    stores: HashMap<String, Arc<Inventory>>,
}

impl Shipping {
    fn inventory(&self, name: &str) -> anyhow::Result<&Arc<Inventory>> {
        self.stores
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("{name} is not a store"))
    }
}

impl TransferApi for Shipping {
    async fn send(&self, source: &PeerRecord, destination: &PeerRecord, hash: &str) -> anyhow::Result<()> {
        if !self.inventory(&source.name)?.contains(hash) {
            anyhow::bail!("{} does not hold {hash}", source.name);
        }
        self.inventory(&destination.name)?.add(hash, "", "", "")?;
        Ok(())
    }

    async fn remove(&self, store: &PeerRecord, hash: &str) -> anyhow::Result<()> {
        self.inventory(&store.name)?.remove(hash)?;
        Ok(())
    }

    async fn verify(&self, store: &PeerRecord, hash: &str) -> anyhow::Result<bool> {
        Ok(self.inventory(&store.name)?.contains(hash))
    }

    async fn exists(&self, store: &PeerRecord, hash: &str) -> anyhow::Result<bool> {
        Ok(self.inventory(&store.name)?.contains(hash))
    }
}

/// Gateway `gw1` over stores in two routing domains.
async fn cluster() -> (Cluster, broadcast::Sender<()>, Placement<Shipping>) {
    let cluster = Cluster::new();
    let gw = cluster.gateway("gw1");
    let stores = [
        cluster.store("s1", "east"),
        cluster.store("s2", "east"),
        cluster.store("s3", "west"),
    ];
    let (shutdown, _) = broadcast::channel(1);
    cluster.run_gossip(&shutdown);

    eventually(Duration::from_secs(2), || gw.registry.members_of("store").len() == 3)
        .await
        .unwrap();

    let shipping = Shipping {
        stores: stores
            .iter()
            .map(|s| (s.name.clone(), s.inventory().clone()))
            .collect(),
    };
    let placement = Placement::new(gw.registry.clone(), gw.cache.clone(), shipping)
        .with_rng(StdRng::seed_from_u64(7));
    (cluster, shutdown, placement)
}

async fn holders(node: &Node, hash: &str) -> Vec<String> {
    node.locator
        .locate_cached(hash)
        .await
        .unwrap()
        .into_iter()
        .filter(|(_, held)| *held)
        .map(|(name, _)| name)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_replication_prefers_another_routing_domain() {
    let (cluster, _shutdown, placement) = cluster().await;
    let gw = cluster.node("gw1");
    cluster.node("s1").inventory().add(&hash('a'), "", "", "").unwrap();

    let existence = gw.locator.locate_cached(&hash('a')).await.unwrap();
    let locations = placement.locations(&existence).unwrap();
    let intent = ReplicationIntent::compute(hash('a'), locations, 2);
    assert_eq!(intent.delta, Delta::Add(1));

    let report = placement.apply(&intent, &HashSet::new()).await.unwrap();
    assert_eq!(report.added.len(), 1);
    assert_eq!(report.added[0].store, "s3", "s2 shares the source's domain");
    assert_eq!(report.added[0].gateway, "west");

    // The cached existence map was dropped by the transfer.
    assert_eq!(holders(&gw, &hash('a')).await, vec!["s1", "s3"]);

    let settled = ReplicationIntent::compute(
        hash('a'),
        placement
            .locations(&gw.locator.locate_cached(&hash('a')).await.unwrap())
            .unwrap(),
        2,
    );
    assert_eq!(settled.delta, Delta::None);
}

#[tokio::test(start_paused = true)]
async fn test_pruning_spares_protected_holders() {
    let (cluster, _shutdown, placement) = cluster().await;
    let gw = cluster.node("gw1");
    for store in ["s1", "s2", "s3"] {
        cluster.node(store).inventory().add(&hash('b'), "", "", "").unwrap();
    }

    let existence = gw.locator.locate_cached(&hash('b')).await.unwrap();
    let intent = ReplicationIntent::compute(hash('b'), placement.locations(&existence).unwrap(), 1);
    assert_eq!(intent.delta, Delta::Remove(2));

    let protected = HashSet::from(["s2".to_string()]);
    let report = placement.apply(&intent, &protected).await.unwrap();
    assert_eq!(report.removed.len(), 2);
    assert!(report.removed.iter().all(|l| l.store != "s2"));

    assert_eq!(holders(&gw, &hash('b')).await, vec!["s2"]);
}

#[tokio::test(start_paused = true)]
async fn test_reads_avoid_unavailable_holders() {
    let (cluster, _shutdown, placement) = cluster().await;
    let gw = cluster.node("gw1");
    for store in ["s1", "s3"] {
        cluster.node(store).inventory().add(&hash('c'), "", "", "").unwrap();
    }
    let existence = gw.locator.locate(&hash('c')).await.unwrap();

    gw.registry.set_available("s1", false).unwrap();
    for _ in 0..4 {
        let target = placement.read_target(&hash('c'), &existence).unwrap().unwrap();
        assert_eq!(target.name, "s3");
    }

    gw.registry.set_available("s3", false).unwrap();
    assert!(placement.read_target(&hash('c'), &existence).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_write_targets_spread_over_stores() {
    let (_cluster, _shutdown, placement) = cluster().await;

    let mut picked = Vec::new();
    for _ in 0..3 {
        picked.push(placement.write_target(&HashSet::new()).unwrap().unwrap().name);
    }
    picked.sort();
    assert_eq!(picked, vec!["s1", "s2", "s3"]);

    let skip = HashSet::from(["s1".to_string(), "s2".to_string()]);
    assert_eq!(placement.write_target(&skip).unwrap().unwrap().name, "s3");
}
