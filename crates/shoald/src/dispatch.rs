//! Routes decoded events to the handlers registered for their kind.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use shoal_core::wire::Event;
use shoal_services::EventHandler;

/// Maps event kinds to handlers. Several handlers may share a kind.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<&'static str, Vec<Arc<dyn EventHandler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under every kind it declares.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        for kind in handler.kinds() {
            self.handlers.entry(*kind).or_default().push(handler.clone());
        }
    }

    /// Dispatch one event. Returns false if nobody handles its kind.
    /// Handler errors are logged and never propagate to the listener.
    pub fn dispatch(&self, origin: SocketAddr, event: &Event) -> bool {
        let Some(handlers) = self.handlers.get(event.kind()) else {
            tracing::trace!(kind = event.kind(), %origin, "no handler for event");
            return false;
        };
        for handler in handlers {
            if let Err(e) = handler.handle(origin, event) {
                tracing::warn!(kind = event.kind(), %origin, error = %e, "event handler failed");
            }
        }
        true
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}
