//! Outbound targeting — where a component wants an event delivered.
//!
//! Components never touch sockets. They push `(SendTarget, Event)` pairs
//! into an [`Outbox`]; the daemon's send worker drains it onto the wire.
//! Tests read the receiving end directly.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

use shoal_core::wire::Event;

/// Target for an outbound event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SendTarget {
    /// Multicast to the whole cluster.
    #[default]
    Broadcast,

    /// Single datagram to one address.
    Datagram { addr: SocketAddr },

    /// Length-framed stream message, optionally followed by a raw body.
    Stream {
        host: String,
        port: u16,
        body: Option<Bytes>,
    },
}

pub type Outbox = mpsc::UnboundedSender<(SendTarget, Event)>;
pub type OutboxReceiver = mpsc::UnboundedReceiver<(SendTarget, Event)>;

pub fn outbox() -> (Outbox, OutboxReceiver) {
    mpsc::unbounded_channel()
}

/// Queue an event; a closed outbox means the daemon is shutting down.
pub fn enqueue(outbox: &Outbox, target: SendTarget, event: Event) {
    if outbox.send((target, event)).is_err() {
        tracing::debug!("outbox closed, dropping outbound event");
    }
}
