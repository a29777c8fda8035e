//! Handler trait for inbound cluster events.
//!
//! Every component that reacts to traffic implements this. The daemon's
//! dispatcher routes decoded events by kind, so handlers can be exercised
//! without a socket.

use std::net::SocketAddr;

use shoal_core::error::Result;
use shoal_core::wire::Event;

pub trait EventHandler: Send + Sync {
    /// Event kinds ([`Event::kind`]) this handler consumes.
    fn kinds(&self) -> &'static [&'static str];

    /// Handle one event from `origin`. Errors are logged by the dispatcher
    /// and never stop the listener.
    fn handle(&self, origin: SocketAddr, event: &Event) -> Result<()>;
}
