//! Scatter-gather locate: "which stores hold content X?"
//!
//! The initiator broadcasts `{token, hash}` and collects `found:{token}`
//! replies. Each reply from a pending store removes it from the pending set
//! and pushes the inactivity deadline out. Replies from anyone else leave the
//! deadline alone. The query resolves when every pending store has answered
//! or the deadline passes, whichever comes first. Stores that never answered
//! are absent from the result.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use shoal_core::config::LocateConfig;
use shoal_core::error::{ClusterError, Result};
use shoal_core::record::{validate_hash, ExistenceMap};
use shoal_core::wire::{new_token, Event, LocateReply, LocateRequest, LOCATE_REPLY_PREFIX, SERVICE_STORE};

use crate::cache::{existence_key, SharedCache};
use crate::peer::PeerRegistry;
use crate::send_target::{enqueue, Outbox, SendTarget};
use crate::service::EventHandler;

type ReplySender = mpsc::UnboundedSender<(String, bool)>;

pub struct Locator {
    registry: PeerRegistry,
    outbox: Outbox,
    cache: SharedCache,
    inactivity: Duration,
    existence_ttl: Duration,
    queries: DashMap<String, ReplySender>,
}

/// Unregisters a query token however the query ends.
struct QueryGuard<'a> {
    queries: &'a DashMap<String, ReplySender>,
    token: String,
}

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        self.queries.remove(&self.token);
    }
}

impl Locator {
    pub fn new(registry: PeerRegistry, outbox: Outbox, cache: SharedCache, config: &LocateConfig) -> Self {
        Self {
            registry,
            outbox,
            cache,
            inactivity: config.inactivity(),
            existence_ttl: Duration::from_secs(config.existence_ttl_secs),
            queries: DashMap::new(),
        }
    }

    /// Queries still waiting for replies.
    pub fn in_flight(&self) -> usize {
        self.queries.len()
    }

    /// Ask every available store whether it holds `hash`.
    pub async fn locate(&self, hash: &str) -> Result<ExistenceMap> {
        validate_hash(hash)?;

        let mut pending: BTreeSet<String> = self
            .registry
            .all()?
            .into_iter()
            .filter(|p| p.available && p.has_service(SERVICE_STORE))
            .map(|p| p.name)
            .collect();
        if pending.is_empty() {
            return Err(ClusterError::NotFound(format!("no available stores to locate {hash}")));
        }

        let token = new_token();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.queries.insert(token.clone(), tx);
        let _guard = QueryGuard {
            queries: &self.queries,
            token: token.clone(),
        };

        let asked = pending.len();
        enqueue(
            &self.outbox,
            SendTarget::Broadcast,
            Event::Locate(LocateRequest {
                token: token.clone(),
                hash: hash.to_string(),
            }),
        );

        let mut found = ExistenceMap::new();
        let mut deadline = Instant::now() + self.inactivity;
        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((peer, exists))) => {
                    if pending.remove(&peer) {
                        found.insert(peer, exists);
                        deadline = Instant::now() + self.inactivity;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(hash, %token, silent = pending.len(), "locate went quiet");
                    break;
                }
            }
        }

        tracing::debug!(hash, asked, answered = found.len(), "locate resolved");
        Ok(found)
    }

    /// [`Locator::locate`] through the existence cache.
    pub async fn locate_cached(&self, hash: &str) -> Result<ExistenceMap> {
        let key = existence_key(hash);
        if let Some(cached) = self.cache.get(&key) {
            match serde_json::from_str::<ExistenceMap>(&cached) {
                Ok(map) => return Ok(map),
                Err(e) => tracing::debug!(hash, error = %e, "discarding unreadable cached locate"),
            }
        }

        let found = self.locate(hash).await?;
        match serde_json::to_string(&found) {
            Ok(json) => self.cache.set(&key, json, Some(self.existence_ttl)),
            Err(e) => tracing::warn!(hash, error = %e, "failed to cache locate result"),
        }
        Ok(found)
    }

    /// Drop the cached existence map for `hash`.
    pub fn invalidate(&self, hash: &str) {
        self.cache.expire(&existence_key(hash), Duration::ZERO);
    }

    /// Route a reply to its query. Returns false for tokens we don't own.
    pub fn on_reply(&self, reply: &LocateReply) -> bool {
        match self.queries.get(&reply.token) {
            Some(tx) => tx.send((reply.peer.clone(), reply.exists)).is_ok(),
            None => {
                tracing::trace!(token = %reply.token, "reply for foreign query");
                false
            }
        }
    }
}

impl EventHandler for Locator {
    fn kinds(&self) -> &'static [&'static str] {
        &[LOCATE_REPLY_PREFIX]
    }

    fn handle(&self, _origin: SocketAddr, event: &Event) -> Result<()> {
        if let Event::LocateReply(reply) = event {
            self.on_reply(reply);
        }
        Ok(())
    }
}
