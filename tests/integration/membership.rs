use crate::*;

use shoal_core::wire::ReadyState;

// ══════════════════════════════════════════════════════════════════════════════
//  Gossip & Boot Handshake
// ══════════════════════════════════════════════════════════════════════════════

/// Three nodes booting together end up knowing each other, themselves included.
#[tokio::test(start_paused = true)]
async fn test_announces_converge_registries() {
    let cluster = Cluster::new();
    let nodes = [
        cluster.gateway("gw1"),
        cluster.store("s1", "gw1"),
        cluster.store("s2", "gw1"),
    ];
    let (shutdown, _) = broadcast::channel(1);
    cluster.run_gossip(&shutdown);

    eventually(Duration::from_secs(2), || {
        nodes.iter().all(|n| n.registry.count().unwrap_or(0) == 3)
    })
    .await
    .unwrap();

    for node in &nodes {
        assert_eq!(node.membership.ready_state(), ReadyState::Ready);
        let s1 = node.registry.get("s1").unwrap().unwrap();
        assert_eq!(s1.host, "10.0.0.2");
        assert_eq!(s1.routing_domain(), "gw1");
        assert_eq!(s1.port("export"), Some(EXPORT_PORT));
        assert!(node.registry.members_of("store").contains("s2"));
        assert!(node.registry.members_of("gateway").contains("gw1"));
    }
}

/// A late joiner learns the existing cluster from boot replies alone,
/// then finishes boot after a quiet window.
#[tokio::test(start_paused = true)]
async fn test_boot_handshake_learns_existing_peers() {
    let cluster = Cluster::new();
    let a = cluster.store("a", "gw1");
    let b = cluster.store("b", "gw1");
    let (shutdown, _) = broadcast::channel(1);
    cluster.run_gossip(&shutdown);

    eventually(Duration::from_secs(2), || {
        a.registry.count().unwrap_or(0) == 2 && b.registry.count().unwrap_or(0) == 2
    })
    .await
    .unwrap();

    let c = cluster.store("c", "gw2");
    assert_eq!(c.registry.count().unwrap(), 0);

    let took = c.membership.boot().await;

    assert!(took >= Duration::from_millis(cluster.gossip().boot_timeout_ms));
    assert!(c.registry.get("a").unwrap().is_some());
    assert!(c.registry.get("b").unwrap().is_some());
    assert_eq!(c.membership.ready_state(), ReadyState::Ready);
    assert!(!c.membership.is_booting());

    // Boot requests are not announces; the old members have not seen c yet.
    assert!(a.registry.get("c").unwrap().is_none());
}

/// A node shutting down tells the cluster it is draining.
#[tokio::test(start_paused = true)]
async fn test_shutdown_announces_draining() {
    let cluster = Cluster::new();
    let a = cluster.store("a", "gw1");
    let b = cluster.store("b", "gw1");

    let (a_stop, _) = broadcast::channel(1);
    let (b_stop, _) = broadcast::channel(1);
    let a_loop = tokio::spawn(a.membership.clone().run(a_stop.subscribe()));
    tokio::spawn(b.membership.clone().run(b_stop.subscribe()));

    eventually(Duration::from_secs(2), || {
        a.membership.ready_state() == ReadyState::Ready
            && b.registry.get("a").ok().flatten().is_some_and(|r| r.active)
    })
    .await
    .unwrap();

    // Announce timestamps are wall clock; let it move past the last one.
    std::thread::sleep(Duration::from_millis(5));
    a_stop.send(()).unwrap();
    a_loop.await.unwrap();

    eventually(Duration::from_secs(1), || {
        b.registry
            .get("a")
            .ok()
            .flatten()
            .is_some_and(|r| r.ready_state == ReadyState::Draining && !r.active)
    })
    .await
    .unwrap();
}

/// Someone else announcing under our name from a different address is
/// rejected instead of overwriting our record.
#[tokio::test]
async fn test_hostname_collision_is_rejected() {
    let cluster = Cluster::new();
    let a = cluster.store("a", "gw1");

    let mut forged = a.membership.compose();
    forged.sent += 1;
    let impostor: SocketAddr = "10.9.9.9:3333".parse().unwrap();
    let result = a
        .membership
        .handle(impostor, &Event::Announce(forged));

    assert!(result.is_err());
    assert!(a.registry.get("a").unwrap().is_none());
}
