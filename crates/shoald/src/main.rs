//! shoald — Shoal storage-cluster coordination daemon.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;

use shoal_core::config::ShoalConfig;
use shoal_core::record::PeerKind;
use shoal_services::send_target::outbox;
use shoal_services::{
    EventHandler, FailureDetector, HttpTransfer, Inventory, LocateResponder, Locator,
    MemoryCache, MemoryDocumentStore, Membership, NodeIdentity, PeerRegistry, Placement,
    SharedCache,
};

mod capacity;
mod dispatch;
mod probe;
mod send_worker;
mod status;
mod transport;

use transport::{multicast, stream, PacketFilter};

const CAPACITY_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ShoalConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ShoalConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ShoalConfig::default()
    });

    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "shoal".to_string());
    let mut identity = NodeIdentity::from_config(&config, &hostname);
    if identity.host.is_empty() {
        let group = multicast::group_addr(&config.network);
        identity.host = local_addr_towards(group)
            .context("failed to determine local address")?
            .to_string();
    }
    tracing::info!(
        name = %identity.name,
        kind = identity.kind.as_str(),
        host = %identity.host,
        "shoald starting"
    );

    // Shared state
    let documents = MemoryDocumentStore::shared();
    let memory_cache = MemoryCache::new();
    let cache: SharedCache = Arc::new(memory_cache.clone());
    let registry = PeerRegistry::new(documents.clone());
    let known = registry.rebuild_index()?;
    tracing::info!(known, "peer registry ready");

    let (outbox_tx, outbox_rx) = outbox();

    let mut sampler = capacity::CapacitySampler::new();
    let (capacity_tx, capacity_rx) = watch::channel(sampler.sample());

    let membership = Arc::new(Membership::new(
        identity.clone(),
        registry.clone(),
        outbox_tx.clone(),
        &config.gossip,
        capacity_rx,
    ));
    let locator = Arc::new(Locator::new(
        registry.clone(),
        outbox_tx.clone(),
        cache.clone(),
        &config.locate,
    ));
    let placement = Arc::new(Placement::new(
        registry.clone(),
        cache.clone(),
        HttpTransfer::new(TRANSFER_TIMEOUT)?,
    ));

    // Sockets. Bind failures are fatal.
    let group = multicast::group_addr(&config.network);
    let multicast_rx = multicast::listener_socket(&config.network)?;
    let multicast_tx = Arc::new(multicast::sender_socket(&config.network)?);
    let stream_listener = TcpListener::bind(("0.0.0.0", config.network.announce_port))
        .await
        .with_context(|| format!("failed to bind stream port {}", config.network.announce_port))?;
    let prober = probe::UdpProber::bind(identity.name.clone(), config.network.ping_port).await?;

    let detector = Arc::new(
        FailureDetector::new(
            identity.name.clone(),
            registry.clone(),
            prober.clone(),
            config.detector.clone(),
        )
        .with_outbox(outbox_tx.clone()),
    );
    if let Err(e) = detector.mark_up() {
        tracing::warn!(error = %e, "failed to mark self up");
    }

    let inventory = match identity.kind {
        PeerKind::Store => {
            let gateway = identity.domain.clone().unwrap_or_default();
            let inventory = Arc::new(Inventory::new(&identity.name, gateway, documents.clone()));
            inventory.load()?;
            Some(inventory)
        }
        PeerKind::Gateway => None,
    };

    // Event dispatcher
    let dispatcher = {
        use dispatch::EventDispatcher;
        let mut d = EventDispatcher::new();
        d.register(membership.clone() as Arc<dyn EventHandler>);
        d.register(locator.clone() as Arc<dyn EventHandler>);
        d.register(detector.clone() as Arc<dyn EventHandler>);
        if let Some(inventory) = &inventory {
            let responder = LocateResponder::new(&identity.name, inventory.clone(), outbox_tx.clone());
            d.register(Arc::new(responder) as Arc<dyn EventHandler>);
        }
        tracing::info!(kinds = ?d.kinds(), "event handlers registered");
        Arc::new(d)
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let send_worker_task = tokio::spawn(
        send_worker::SendWorker::new(multicast_tx, group, outbox_rx, shutdown_tx.subscribe()).run(),
    );

    let multicast_task = tokio::spawn(multicast::listen_loop(
        multicast_rx,
        PacketFilter::new(
            config.transport.dedup_window(),
            config.transport.dedup_capacity,
        ),
        dispatcher.clone(),
        shutdown_tx.subscribe(),
    ));

    let stream_task = tokio::spawn(stream::stream_loop(
        stream_listener,
        dispatcher.clone(),
        config.transport.max_stream_body,
        config.transport.stream_read_timeout(),
        shutdown_tx.subscribe(),
    ));

    let ping_task = tokio::spawn(prober.run(shutdown_tx.subscribe()));

    let capacity_task = tokio::spawn(capacity::sample_loop(
        sampler,
        capacity_tx,
        CAPACITY_SAMPLE_INTERVAL,
        shutdown_tx.subscribe(),
    ));

    let sweeper_task = tokio::spawn(memory_cache.run_sweeper(CACHE_SWEEP_INTERVAL, shutdown_tx.subscribe()));

    let gossip_task = tokio::spawn(membership.clone().run(shutdown_tx.subscribe()));
    let detector_task = tokio::spawn(detector.clone().run(shutdown_tx.subscribe()));
    let pruner_task = tokio::spawn(detector.run_pruner(shutdown_tx.subscribe()));

    // Status HTTP endpoint
    let status_port = config.network.api_port;
    let _status_server = {
        let state = status::StatusState {
            membership: membership.clone(),
            registry: registry.clone(),
            locator: locator.clone(),
            placement,
            inventory,
        };
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = status::serve(state, status_port, shutdown).await {
                tracing::error!(error = %e, "status server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = multicast_task      => tracing::error!("multicast listener exited: {:?}", r),
        r = stream_task         => tracing::error!("stream listener exited: {:?}", r),
        r = ping_task           => tracing::error!("ping responder exited: {:?}", r),
        r = capacity_task       => tracing::error!("capacity sampler exited: {:?}", r),
        r = sweeper_task        => tracing::error!("cache sweeper exited: {:?}", r),
        r = detector_task       => tracing::error!("failure detector exited: {:?}", r),
        r = pruner_task         => tracing::error!("vote pruner exited: {:?}", r),
    }

    // Let the final draining announce reach the wire.
    let _ = gossip_task.await;
    let _ = send_worker_task.await;
    Ok(())
}

/// Source address the OS would use to reach `dest`. No packet is sent.
fn local_addr_towards(dest: SocketAddr) -> Result<IpAddr> {
    let probe = StdUdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    probe.connect(dest)?;
    Ok(probe.local_addr()?.ip())
}
