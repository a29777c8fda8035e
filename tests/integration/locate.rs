use crate::*;

use shoal_core::error::ClusterError;
use shoal_core::record::ExistenceMap;
use tokio::time::Instant;

// ══════════════════════════════════════════════════════════════════════════════
//  Scatter-Gather Locate
// ══════════════════════════════════════════════════════════════════════════════

/// Gateway plus three stores, gossiping until every node knows every other.
async fn cluster_with_stores() -> (Cluster, broadcast::Sender<()>) {
    let cluster = Cluster::new();
    let nodes = vec![
        cluster.gateway("gw1"),
        cluster.store("s1", "gw1"),
        cluster.store("s2", "gw1"),
        cluster.store("s3", "gw1"),
    ];
    let (shutdown, _) = broadcast::channel(1);
    cluster.run_gossip(&shutdown);

    eventually(Duration::from_secs(2), || {
        nodes.iter().all(|n| n.registry.members_of("store").len() == 3)
    })
    .await
    .unwrap();
    (cluster, shutdown)
}

#[tokio::test(start_paused = true)]
async fn test_locate_collects_every_store_answer() {
    let (cluster, _shutdown) = cluster_with_stores().await;
    cluster.node("s1").inventory().add(&hash('a'), "image/png", "png", "aa/aa").unwrap();
    cluster.node("s3").inventory().add(&hash('a'), "image/png", "png", "aa/aa").unwrap();

    let gw = cluster.node("gw1");
    let started = Instant::now();
    let found = gw.locator.locate(&hash('a')).await.unwrap();

    assert_eq!(
        found,
        ExistenceMap::from([
            ("s1".to_string(), true),
            ("s2".to_string(), false),
            ("s3".to_string(), true),
        ])
    );
    // Everyone answered, so the inactivity timer never had to fire.
    assert!(started.elapsed() < cluster.locate_config().inactivity());
    assert_eq!(gw.locator.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_locate_gives_up_on_silent_store() {
    let (cluster, _shutdown) = cluster_with_stores().await;
    cluster.node("s1").inventory().add(&hash('b'), "", "", "").unwrap();
    cluster.node("s2").mute();

    let gw = cluster.node("gw1");
    let started = Instant::now();
    let found = gw.locator.locate(&hash('b')).await.unwrap();
    let took = started.elapsed();

    assert_eq!(found.get("s1"), Some(&true));
    assert_eq!(found.get("s3"), Some(&false));
    assert!(!found.contains_key("s2"), "silent stores are absent, not false");
    assert!(took >= cluster.locate_config().inactivity());
    assert!(took < cluster.locate_config().inactivity() + Duration::from_millis(50));
}

/// Two nodes locating at once only ever see answers to their own token.
#[tokio::test(start_paused = true)]
async fn test_concurrent_locates_do_not_mix() {
    let (cluster, _shutdown) = cluster_with_stores().await;
    cluster.node("s2").inventory().add(&hash('c'), "", "", "").unwrap();
    cluster.node("s3").inventory().add(&hash('d'), "", "", "").unwrap();

    let gw = cluster.node("gw1");
    let store = cluster.node("s1");
    let (wanted_by_gw, wanted_by_store) = (hash('c'), hash('d'));
    let (from_gw, from_store) = tokio::join!(
        gw.locator.locate(&wanted_by_gw),
        store.locator.locate(&wanted_by_store),
    );

    let from_gw = from_gw.unwrap();
    let from_store = from_store.unwrap();
    assert_eq!(from_gw.iter().filter(|(_, held)| **held).count(), 1);
    assert_eq!(from_gw.get("s2"), Some(&true));
    assert_eq!(from_store.iter().filter(|(_, held)| **held).count(), 1);
    assert_eq!(from_store.get("s3"), Some(&true));
}

#[tokio::test(start_paused = true)]
async fn test_cached_locate_needs_invalidation_to_see_new_copies() {
    let (cluster, _shutdown) = cluster_with_stores().await;
    let gw = cluster.node("gw1");
    cluster.node("s1").inventory().add(&hash('e'), "", "", "").unwrap();

    let first = gw.locator.locate_cached(&hash('e')).await.unwrap();
    assert_eq!(first.get("s2"), Some(&false));

    cluster.node("s2").inventory().add(&hash('e'), "", "", "").unwrap();
    let stale = gw.locator.locate_cached(&hash('e')).await.unwrap();
    assert_eq!(stale.get("s2"), Some(&false));

    gw.locator.invalidate(&hash('e'));
    let fresh = gw.locator.locate_cached(&hash('e')).await.unwrap();
    assert_eq!(fresh.get("s2"), Some(&true));
}

#[tokio::test]
async fn test_locate_without_stores_is_not_found() {
    let cluster = Cluster::new();
    let gw = cluster.gateway("gw1");
    assert!(matches!(
        gw.locator.locate(&hash('f')).await,
        Err(ClusterError::NotFound(_))
    ));
    assert!(matches!(
        gw.locator.locate("not-a-hash").await,
        Err(ClusterError::Validation(_))
    ));
}
