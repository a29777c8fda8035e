//! Send worker — drains the outbox and puts events on the wire.
//!
//! Broadcasts and point-to-point datagrams go out on the shared sender
//! socket in queue order. Streams each get their own task so a slow
//! connect never holds up gossip.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use shoal_core::wire::{encode_datagram, Event};
use shoal_services::{OutboxReceiver, SendTarget};

use crate::transport::stream::unicast_stream;

pub struct SendWorker {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    outbox: OutboxReceiver,
    shutdown: broadcast::Receiver<()>,
    sequence: u64,
}

impl SendWorker {
    pub fn new(
        socket: Arc<UdpSocket>,
        group: SocketAddr,
        outbox: OutboxReceiver,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            socket,
            group,
            outbox,
            shutdown,
            sequence: 0,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    // Flush what is already queued, e.g. a final draining announce.
                    while let Ok((target, event)) = self.outbox.try_recv() {
                        self.send(target, event).await;
                    }
                    tracing::info!("send worker shutting down");
                    return Ok(());
                }

                msg = self.outbox.recv() => {
                    let Some((target, event)) = msg else {
                        tracing::info!("outbox closed, send worker exiting");
                        return Ok(());
                    };
                    self.send(target, event).await;
                }
            }
        }
    }

    async fn send(&mut self, target: SendTarget, event: Event) {
        match target {
            SendTarget::Broadcast => self.send_datagram(self.group, &event).await,
            SendTarget::Datagram { addr } => self.send_datagram(addr, &event).await,
            SendTarget::Stream { host, port, body } => {
                self.sequence += 1;
                let sequence = self.sequence;
                tokio::spawn(async move {
                    if let Err(e) = unicast_stream(&event, sequence, &host, port, body).await {
                        tracing::warn!(%host, port, event = event.kind(), error = %e, "stream send failed");
                    }
                });
            }
        }
    }

    async fn send_datagram(&self, addr: SocketAddr, event: &Event) {
        let bytes = match encode_datagram(event) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(event = event.kind(), error = %e, "failed to encode datagram");
                return;
            }
        };
        match self.socket.send_to(&bytes, addr).await {
            Ok(n) => tracing::trace!(%addr, bytes = n, event = event.kind(), "datagram sent"),
            Err(e) => tracing::warn!(%addr, error = %e, "datagram send failed"),
        }
    }
}
