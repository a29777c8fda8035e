//! Membership gossip — periodic self-announce, passive learning of peers,
//! and the boot handshake.
//!
//! Every node broadcasts an [`Announce`] on a fixed interval. Receivers
//! fold it into the peer registry. A starting node first broadcasts a
//! `boot` request; peers answer with their announce over a stream, and
//! boot ends once no announce has arrived for a full `boot_timeout`.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;

use shoal_core::config::GossipConfig;
use shoal_core::error::{Result, ValidationError};
use shoal_core::record::{now_ms, Capacity, PeerKind, PeerRecord};
use shoal_core::wire::{
    Announce, BootRequest, Event, ReadyState, EVENT_ANNOUNCE, EVENT_BOOT, SERVICE_GATEWAY,
};

use crate::identity::NodeIdentity;
use crate::peer::PeerRegistry;
use crate::send_target::{enqueue, Outbox, SendTarget};
use crate::service::EventHandler;

/// What an inbound announce did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// First announce from this peer.
    Joined,
    Updated,
    /// `sent` did not advance; nothing was written.
    Stale,
}

pub struct Membership {
    identity: NodeIdentity,
    registry: PeerRegistry,
    outbox: Outbox,
    interval: Duration,
    boot_timeout: Duration,
    booting: AtomicBool,
    boot_reset: Notify,
    state: watch::Sender<ReadyState>,
    capacity: watch::Receiver<Capacity>,
    import_hits: AtomicU64,
}

impl Membership {
    pub fn new(
        identity: NodeIdentity,
        registry: PeerRegistry,
        outbox: Outbox,
        config: &GossipConfig,
        capacity: watch::Receiver<Capacity>,
    ) -> Self {
        let (state, _) = watch::channel(ReadyState::Booting);
        Self {
            identity,
            registry,
            outbox,
            interval: config.announce_interval(),
            boot_timeout: config.boot_timeout(),
            booting: AtomicBool::new(false),
            boot_reset: Notify::new(),
            state,
            capacity,
            import_hits: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    pub fn is_booting(&self) -> bool {
        self.booting.load(Ordering::Acquire)
    }

    /// Count one import served by this node; reported in the next announce.
    pub fn record_import(&self) {
        self.import_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of this node as an announce payload.
    pub fn compose(&self) -> Announce {
        let capacity = self.capacity.borrow().clone();
        let peer_count = self.registry.count().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "peer count unavailable for announce");
            0
        });
        let id = &self.identity;
        Announce {
            sent: now_ms(),
            hostname: id.name.clone(),
            ready_state: self.ready_state(),
            peer_count: peer_count as u32,
            disk_free: capacity.disk_free,
            disk_total: capacity.disk_total,
            cpu_used: capacity.cpu_used,
            cpu_count: capacity.cpu_count,
            memory_free: capacity.memory_free,
            memory_total: capacity.memory_total,
            available_capacity: capacity.available_capacity(),
            services: id.services.clone(),
            domain: id.domain.clone(),
            writable: id.writable,
            port_import: id.port_import,
            port_export: id.port_export,
            port_prism: id.port_prism,
            port_announce: id.port_announce,
            port_ping: id.port_ping,
            net_speed: capacity.net_speed,
            net_in_bps: capacity.net_in_bps,
            net_out_bps: capacity.net_out_bps,
            import_hits: self.import_hits.load(Ordering::Relaxed),
        }
    }

    /// Broadcast one announce.
    pub fn announce(&self) {
        enqueue(
            &self.outbox,
            SendTarget::Broadcast,
            Event::Announce(self.compose()),
        );
    }

    /// Fold an inbound announce into the registry.
    pub fn handle_announce(&self, announce: &Announce, origin: IpAddr) -> Result<AnnounceOutcome> {
        let own_host = &self.identity.host;
        if announce.hostname == self.identity.name
            && !own_host.is_empty()
            && own_host.parse::<IpAddr>().ok() != Some(origin)
        {
            return Err(ValidationError::HostnameCollision {
                hostname: announce.hostname.clone(),
                addr: origin.to_string(),
            }
            .into());
        }

        let interval_ms = self.interval.as_millis() as u64;
        let mut outcome = AnnounceOutcome::Stale;
        self.registry.upsert(&announce.hostname, |current| {
            let (mut record, previous_sent) = match current {
                Some(record) if announce.sent <= record.sent => {
                    outcome = AnnounceOutcome::Stale;
                    return None;
                }
                Some(record) => {
                    outcome = AnnounceOutcome::Updated;
                    let sent = record.sent;
                    (record, Some(sent))
                }
                None => {
                    outcome = AnnounceOutcome::Joined;
                    let kind = announced_kind(announce);
                    (PeerRecord::new(&announce.hostname, kind, ""), None)
                }
            };
            apply_announce(&mut record, announce, origin, previous_sent, interval_ms);
            Some(record)
        })?;

        match outcome {
            AnnounceOutcome::Joined => {
                tracing::info!(peer = %announce.hostname, addr = %origin, "peer joined")
            }
            AnnounceOutcome::Updated => {
                tracing::trace!(peer = %announce.hostname, "announce applied")
            }
            AnnounceOutcome::Stale => {
                tracing::trace!(peer = %announce.hostname, sent = announce.sent, "stale announce ignored")
            }
        }

        if outcome != AnnounceOutcome::Stale && self.is_booting() {
            self.boot_reset.notify_one();
        }
        Ok(outcome)
    }

    /// Answer a booting peer with our announce over a stream.
    pub fn handle_boot(&self, request: &BootRequest, origin: IpAddr) {
        if request.hostname == self.identity.name {
            return;
        }
        tracing::debug!(peer = %request.hostname, addr = %origin, "answering boot request");
        enqueue(
            &self.outbox,
            SendTarget::Stream {
                host: origin.to_string(),
                port: request.port_announce,
                body: None,
            },
            Event::Announce(self.compose()),
        );
    }

    /// Run the boot handshake. Returns how long it took.
    ///
    /// Every accepted announce restarts the timeout, so this ends only after
    /// a full quiet window.
    pub async fn boot(&self) -> Duration {
        let started = Instant::now();
        self.state.send_replace(ReadyState::Booting);
        self.booting.store(true, Ordering::Release);

        enqueue(
            &self.outbox,
            SendTarget::Broadcast,
            Event::Boot(BootRequest {
                hostname: self.identity.name.clone(),
                port_announce: self.identity.port_announce,
            }),
        );
        tracing::info!(timeout_ms = self.boot_timeout.as_millis() as u64, "boot started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.boot_timeout) => break,
                _ = self.boot_reset.notified() => continue,
            }
        }

        self.booting.store(false, Ordering::Release);
        self.state.send_replace(ReadyState::Ready);
        let elapsed = started.elapsed();
        tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "boot complete");
        elapsed
    }

    /// Boot, then announce every interval until shutdown. A final draining
    /// announce goes out on the way down.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tokio::select! {
            _ = self.boot() => {}
            _ = shutdown.recv() => return,
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_ms = self.interval.as_millis() as u64, "announce loop starting");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.announce(),
                _ = shutdown.recv() => {
                    self.state.send_replace(ReadyState::Draining);
                    self.announce();
                    tracing::info!("announce loop stopped");
                    break;
                }
            }
        }
    }
}

fn announced_kind(announce: &Announce) -> PeerKind {
    if announce.services.iter().any(|s| s == SERVICE_GATEWAY) {
        PeerKind::Gateway
    } else {
        PeerKind::Store
    }
}

fn apply_announce(
    record: &mut PeerRecord,
    announce: &Announce,
    origin: IpAddr,
    previous_sent: Option<u64>,
    interval_ms: u64,
) {
    record.latency = match previous_sent {
        Some(prev) => announce
            .sent
            .saturating_sub(prev)
            .saturating_sub(interval_ms),
        None => 0,
    };
    record.sent = announce.sent;
    record.host = origin.to_string();
    record.domain = announce.domain.clone();
    record.ready_state = announce.ready_state;
    record.active = announce.ready_state != ReadyState::Draining;
    record.peer_count = announce.peer_count;
    record.capacity = announce.capacity();
    record.available_capacity = announce.available_capacity.min(100);
    record.writable = announce.writable;
    record.import_hits = announce.import_hits;
    record.services = announce.services.iter().cloned().collect();
    record.ports = announce
        .ports()
        .into_iter()
        .map(|(name, port)| (name.to_string(), port))
        .collect();
}

impl EventHandler for Membership {
    fn kinds(&self) -> &'static [&'static str] {
        &[EVENT_ANNOUNCE, EVENT_BOOT]
    }

    fn handle(&self, origin: SocketAddr, event: &Event) -> Result<()> {
        match event {
            Event::Announce(announce) => self.handle_announce(announce, origin.ip()).map(|_| ()),
            Event::Boot(request) => {
                self.handle_boot(request, origin.ip());
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::send_target::outbox;
    use crate::store::MemoryDocumentStore;
    use std::net::Ipv4Addr;

    const ORIGIN: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

    pub(crate) fn announce_from(name: &str, sent: u64) -> Announce {
        Announce {
            sent,
            hostname: name.to_string(),
            ready_state: ReadyState::Ready,
            peer_count: 1,
            disk_free: 30,
            disk_total: 100,
            cpu_used: 5.0,
            cpu_count: 4,
            memory_free: 1 << 20,
            memory_total: 1 << 30,
            available_capacity: 30,
            services: vec!["store".to_string(), "export".to_string()],
            domain: Some("gw1".to_string()),
            writable: true,
            port_import: 0,
            port_export: 9001,
            port_prism: 0,
            port_announce: 3334,
            port_ping: 3335,
            net_speed: 0,
            net_in_bps: 0,
            net_out_bps: 0,
            import_hits: 0,
        }
    }

    fn membership(name: &str, boot_timeout_ms: u64) -> (Membership, crate::send_target::OutboxReceiver) {
        let (tx, rx) = outbox();
        let (_cap_tx, cap_rx) = watch::channel(Capacity::default());
        let config = GossipConfig {
            announce_interval_ms: 1_000,
            boot_timeout_ms,
        };
        let registry = PeerRegistry::new(MemoryDocumentStore::shared());
        let identity = NodeIdentity::new(name, PeerKind::Store).with_host("10.0.0.1");
        (Membership::new(identity, registry, tx, &config, cap_rx), rx)
    }

    #[test]
    fn replaying_an_announce_changes_nothing() {
        let (m, _rx) = membership("self", 2_000);
        let a = announce_from("s2", 10_000);

        assert_eq!(m.handle_announce(&a, ORIGIN).unwrap(), AnnounceOutcome::Joined);
        let first = m.registry.get("s2").unwrap().unwrap();
        let (_, rev) = crate::store::load::<PeerRecord>(m.registry.store().as_ref(), "peer:s2")
            .unwrap()
            .unwrap();

        assert_eq!(m.handle_announce(&a, ORIGIN).unwrap(), AnnounceOutcome::Stale);
        let (again, rev2) =
            crate::store::load::<PeerRecord>(m.registry.store().as_ref(), "peer:s2")
                .unwrap()
                .unwrap();
        assert_eq!(first, again);
        assert_eq!(rev, rev2);
    }

    #[test]
    fn latency_is_clamped_skew() {
        let (m, _rx) = membership("self", 2_000);
        m.handle_announce(&announce_from("s2", 10_000), ORIGIN).unwrap();

        // Arrived early relative to the interval: clamped to zero.
        m.handle_announce(&announce_from("s2", 10_400), ORIGIN).unwrap();
        assert_eq!(m.registry.get("s2").unwrap().unwrap().latency, 0);

        m.handle_announce(&announce_from("s2", 11_650), ORIGIN).unwrap();
        assert_eq!(m.registry.get("s2").unwrap().unwrap().latency, 250);
    }

    #[test]
    fn announce_populates_record_and_indexes() {
        let (m, _rx) = membership("self", 2_000);
        m.handle_announce(&announce_from("s2", 1), ORIGIN).unwrap();

        let record = m.registry.get("s2").unwrap().unwrap();
        assert_eq!(record.kind, PeerKind::Store);
        assert_eq!(record.host, "10.0.0.7");
        assert_eq!(record.port("export"), Some(9001));
        assert_eq!(record.port("import"), None);
        assert_eq!(record.available_capacity, 30);
        assert!(record.available);
        assert!(m.registry.members_of("store").contains("s2"));
        assert_eq!(m.registry.ranked_by_capacity(), vec!["s2"]);
    }

    #[test]
    fn own_name_from_foreign_address_is_rejected() {
        let (m, _rx) = membership("self", 2_000);
        let err = m
            .handle_announce(&announce_from("self", 1), ORIGIN)
            .unwrap_err();
        assert!(matches!(
            err,
            shoal_core::ClusterError::Validation(ValidationError::HostnameCollision { .. })
        ));
        assert!(m.registry.get("self").unwrap().is_none());

        // Our own looped-back announce is fine.
        let own: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(m.handle_announce(&announce_from("self", 1), own).is_ok());
    }

    #[test]
    fn boot_request_is_answered_over_stream() {
        let (m, mut rx) = membership("self", 2_000);
        m.handle_boot(
            &BootRequest {
                hostname: "gw9".to_string(),
                port_announce: 4444,
            },
            ORIGIN,
        );
        match rx.try_recv().unwrap() {
            (SendTarget::Stream { host, port, body }, Event::Announce(a)) => {
                assert_eq!(host, "10.0.0.7");
                assert_eq!(port, 4444);
                assert!(body.is_none());
                assert_eq!(a.hostname, "self");
            }
            other => panic!("unexpected {other:?}"),
        }

        // Our own boot request echoed back by multicast is ignored.
        m.handle_boot(
            &BootRequest {
                hostname: "self".to_string(),
                port_announce: 4444,
            },
            ORIGIN,
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn boot_waits_for_a_full_quiet_window() {
        let (m, mut rx) = membership("self", 250);
        let m = Arc::new(m);
        let started = Instant::now();

        let booter = tokio::spawn({
            let m = m.clone();
            async move { m.boot().await }
        });
        tokio::task::yield_now().await;

        for (i, at) in [0u64, 100, 200].into_iter().enumerate() {
            tokio::time::sleep_until(started + Duration::from_millis(at)).await;
            m.handle_announce(&announce_from(&format!("s{i}"), 1_000 + at), ORIGIN)
                .unwrap();
        }

        let elapsed = booter.await.unwrap();
        assert!(elapsed >= Duration::from_millis(450), "ended after {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "ended after {elapsed:?}");
        assert_eq!(m.ready_state(), ReadyState::Ready);
        assert!(!m.is_booting());

        assert!(matches!(rx.try_recv().unwrap(), (SendTarget::Broadcast, Event::Boot(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_boot_ends_after_one_timeout() {
        let (m, _rx) = membership("self", 250);
        let elapsed = m.boot().await;
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(300));
    }
}
