use crate::*;

use shoal_core::record::PeerRecord;
use shoal_services::{FailureDetector, VoteOutcome};

// ══════════════════════════════════════════════════════════════════════════════
//  Failure Detection Across Nodes
// ══════════════════════════════════════════════════════════════════════════════

/// Four nodes sharing one cluster database, each with its own detector.
fn detectors(partition: &Partition) -> (PeerRegistry, Vec<FailureDetector<Partition>>) {
    let registry = PeerRegistry::new(MemoryDocumentStore::shared());
    let names = ["a", "b", "c", "d"];
    for (i, name) in names.iter().enumerate() {
        let record = PeerRecord::new(*name, PeerKind::Store, format!("10.0.0.{}", i + 1));
        registry.register(record).unwrap();
    }
    let detectors = names
        .iter()
        .map(|name| FailureDetector::new(*name, registry.clone(), partition.clone(), detector_config()))
        .collect();
    (registry, detectors)
}

#[tokio::test]
async fn test_quorum_of_detectors_marks_peer_down() {
    let partition = Partition::default();
    let (registry, detectors) = detectors(&partition);
    partition.cut("d");

    // One failure per detector is tolerated.
    for detector in &detectors[..3] {
        assert!(detector.probe_all().await.unwrap().is_empty());
    }

    let first = detectors[0].probe_all().await.unwrap();
    assert_eq!(first.get("d"), Some(&VoteOutcome::Pending { votes: 1, needed: 2 }));
    assert!(registry.get("d").unwrap().unwrap().available);

    let second = detectors[1].probe_all().await.unwrap();
    assert_eq!(second.get("d"), Some(&VoteOutcome::MarkedDown { votes: 2 }));
    assert!(!registry.get("d").unwrap().unwrap().available);

    let third = detectors[2].probe_all().await.unwrap();
    assert_eq!(third.get("d"), Some(&VoteOutcome::AlreadyDown));
    assert_eq!(detectors[0].live_votes("d").unwrap(), 3);

    // Healthy peers never collected a vote.
    for name in ["a", "b", "c"] {
        assert!(registry.get(name).unwrap().unwrap().available);
        assert_eq!(detectors[0].live_votes(name).unwrap(), 0);
    }
}

#[tokio::test]
async fn test_recovered_peer_marks_itself_up() {
    let partition = Partition::default();
    let (registry, detectors) = detectors(&partition);
    partition.cut("d");

    for _ in 0..2 {
        for detector in &detectors[..2] {
            detector.probe_all().await.unwrap();
        }
    }
    assert!(!registry.get("d").unwrap().unwrap().available);

    partition.heal();
    let purged = detectors[3].mark_up().unwrap();
    assert_eq!(purged, 2);
    assert!(registry.get("d").unwrap().unwrap().available);
    assert_eq!(detectors[0].live_votes("d").unwrap(), 0);

    // A successful probe resets the failure count.
    detectors[0].probe_all().await.unwrap();
    assert_eq!(detectors[0].failures("d"), 0);
}

/// A single voter never reaches quorum in a cluster of four.
#[tokio::test]
async fn test_lone_voter_cannot_take_peer_down() {
    let partition = Partition::default();
    let (registry, detectors) = detectors(&partition);
    partition.cut("b");

    for _ in 0..5 {
        detectors[0].probe_all().await.unwrap();
    }
    assert_eq!(detectors[0].live_votes("b").unwrap(), 1);
    assert!(registry.get("b").unwrap().unwrap().available);
    assert!(matches!(
        detectors[0].cast_vote("b").unwrap(),
        VoteOutcome::AlreadyCast { votes: 1 }
    ));
}

/// Gossiping nodes, each with its own vote log, learn each other's votes
/// from the wire and reach the same mark-down independently.
#[tokio::test(start_paused = true)]
async fn test_votes_gossip_between_separate_logs() {
    let cluster = Cluster::new();
    let nodes = [
        cluster.store("a", "gw1"),
        cluster.store("b", "gw1"),
        cluster.store("c", "gw1"),
        cluster.store("d", "gw1"),
    ];
    let (shutdown, _) = broadcast::channel(1);
    cluster.run_gossip(&shutdown);
    eventually(Duration::from_secs(2), || {
        nodes.iter().all(|n| n.registry.count().unwrap_or(0) == 4)
    })
    .await
    .unwrap();

    let d = cluster.node("d");
    d.mute();
    cluster.partition().cut("d");

    for voter in ["a", "b"] {
        let detector = &cluster.node(voter).detector;
        detector.probe_all().await.unwrap();
        detector.probe_all().await.unwrap();
    }

    let survivors = ["a", "b", "c"].map(|name| cluster.node(name));
    eventually(Duration::from_secs(1), || {
        survivors.iter().all(|n| {
            n.registry.get("d").ok().flatten().is_some_and(|r| !r.available)
                && n.detector.live_votes("d").unwrap_or(0) == 2
        })
    })
    .await
    .unwrap();

    // d comes back and vouches for itself.
    cluster.partition().heal();
    d.unmute();
    d.detector.mark_up().unwrap();

    eventually(Duration::from_secs(1), || {
        survivors.iter().all(|n| {
            n.registry.get("d").ok().flatten().is_some_and(|r| r.available)
                && n.detector.live_votes("d").unwrap_or(1) == 0
        })
    })
    .await
    .unwrap();
}
