//! UDP ping prober — answers pings and measures our own.
//!
//! The ping socket both answers inbound `ping`s with a `pong` and carries
//! the detector's outbound probes. A probe succeeds when a pong with the
//! latest token for that peer comes back.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};

use shoal_core::record::PeerRecord;
use shoal_core::wire::{decode_datagram, encode_datagram, Event, Pong, MAX_DATAGRAM};
use shoal_services::{PingTracker, Probe};

struct Inner {
    name: String,
    socket: UdpSocket,
    tracker: PingTracker,
    waiters: DashMap<String, (String, oneshot::Sender<Duration>)>,
    rtt: DashMap<String, Duration>,
}

#[derive(Clone)]
pub struct UdpProber {
    inner: Arc<Inner>,
}

/// Removes a waiter if the probe is abandoned (timeout or shutdown).
struct WaiterGuard<'a> {
    waiters: &'a DashMap<String, (String, oneshot::Sender<Duration>)>,
    token: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.remove(&self.token);
    }
}

impl UdpProber {
    pub async fn bind(name: impl Into<String>, port: u16) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind ping port {port}"))?;
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                socket,
                tracker: PingTracker::new(),
                waiters: DashMap::new(),
                rtt: DashMap::new(),
            }),
        })
    }

    /// Last measured round trip to `peer`.
    pub fn rtt(&self, peer: &str) -> Option<Duration> {
        self.inner.rtt.get(peer).map(|d| *d)
    }

    /// Answer pings and resolve pongs until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tracing::info!(addr = ?self.inner.socket.local_addr().ok(), "ping responder starting");
        loop {
            let (len, from) = tokio::select! {
                received = self.inner.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "ping recv failed");
                        continue;
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("ping responder stopped");
                    return;
                }
            };

            match decode_datagram(&buf[..len]) {
                Ok(Event::Ping(ping)) => self.answer(from, ping.token).await,
                Ok(Event::Pong(pong)) => self.resolve(pong),
                Ok(other) => tracing::trace!(%from, kind = other.kind(), "unexpected event on ping socket"),
                Err(e) => tracing::debug!(%from, error = %e, "undecodable ping datagram"),
            }
        }
    }

    async fn answer(&self, to: SocketAddr, token: String) {
        let pong = Event::Pong(Pong {
            token,
            peer: self.inner.name.clone(),
        });
        match encode_datagram(&pong) {
            Ok(bytes) => {
                if let Err(e) = self.inner.socket.send_to(&bytes, to).await {
                    tracing::debug!(%to, error = %e, "pong send failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode pong"),
        }
    }

    fn resolve(&self, pong: Pong) {
        let Some((_, (peer, waiter))) = self.inner.waiters.remove(&pong.token) else {
            tracing::trace!(token = %pong.token, "pong for unknown ping");
            return;
        };
        if let Some(rtt) = self.inner.tracker.complete(&peer, &pong.token) {
            self.inner.rtt.insert(peer, rtt);
            let _ = waiter.send(rtt);
        }
    }
}

impl Probe for UdpProber {
    async fn probe(&self, peer: &PeerRecord) -> anyhow::Result<()> {
        let port = peer
            .port("ping")
            .with_context(|| format!("{} advertises no ping port", peer.name))?;
        let ip: IpAddr = peer
            .host
            .parse()
            .with_context(|| format!("{} has no usable address '{}'", peer.name, peer.host))?;

        let ping = self.inner.tracker.begin(&peer.name);
        let (tx, rx) = oneshot::channel();
        self.inner
            .waiters
            .insert(ping.token.clone(), (peer.name.clone(), tx));
        let _guard = WaiterGuard {
            waiters: &self.inner.waiters,
            token: ping.token.clone(),
        };

        let bytes = encode_datagram(&Event::Ping(ping))?;
        self.inner
            .socket
            .send_to(&bytes, SocketAddr::new(ip, port))
            .await
            .context("ping send failed")?;

        let rtt = rx.await.context("ping abandoned")?;
        tracing::trace!(peer = %peer.name, rtt_ms = rtt.as_millis() as u64, "pong");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::record::PeerKind;

    #[tokio::test]
    async fn probe_round_trips_between_two_probers() {
        let a = UdpProber::bind("a", 0).await.unwrap();
        let b = UdpProber::bind("b", 0).await.unwrap();
        let b_port = b.inner.socket.local_addr().unwrap().port();

        let (_tx, rx_a) = broadcast::channel(1);
        let rx_b = _tx.subscribe();
        tokio::spawn(a.clone().run(rx_a));
        tokio::spawn(b.clone().run(rx_b));

        let mut peer = PeerRecord::new("b", PeerKind::Store, "127.0.0.1");
        peer.ports.insert("ping".to_string(), b_port);

        tokio::time::timeout(Duration::from_secs(2), a.probe(&peer))
            .await
            .unwrap()
            .unwrap();
        assert!(a.rtt("b").is_some());
        assert!(a.inner.waiters.is_empty());
    }

    #[tokio::test]
    async fn probe_without_ping_port_fails() {
        let a = UdpProber::bind("a", 0).await.unwrap();
        let peer = PeerRecord::new("b", PeerKind::Store, "127.0.0.1");
        assert!(a.probe(&peer).await.is_err());
    }
}
