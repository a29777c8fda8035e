//! Peer registry — this node's view of the cluster.
//!
//! Peer records live in the shared document store; the registry adds two
//! local indexes on top, both fed by accepted announces:
//!   * a capacity rank (peer → availableCapacity) consulted by placement
//!   * service membership sets ("store", "gateway", ...) that only ever grow
//!     when a peer advertises the service

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;

use shoal_core::error::Result;
use shoal_core::record::{peer_key, PeerKind, PeerRecord, PEER_PREFIX};

use crate::store::{self, SharedStore};

/// The peer registry — shared between gossip, detector, locator and placement.
#[derive(Clone)]
pub struct PeerRegistry {
    store: SharedStore,
    capacity: Arc<DashMap<String, u8>>,
    members: Arc<DashMap<String, BTreeSet<String>>>,
}

impl PeerRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            capacity: Arc::new(DashMap::new()),
            members: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn get(&self, name: &str) -> Result<Option<PeerRecord>> {
        Ok(store::load::<PeerRecord>(self.store.as_ref(), &peer_key(name))?.map(|(r, _)| r))
    }

    pub fn all(&self) -> Result<Vec<PeerRecord>> {
        store::scan(self.store.as_ref(), PEER_PREFIX)
    }

    pub fn of_kind(&self, kind: PeerKind) -> Result<Vec<PeerRecord>> {
        Ok(self.all()?.into_iter().filter(|p| p.kind == kind).collect())
    }

    /// Total number of known peers of any kind, available or not.
    pub fn count(&self) -> Result<usize> {
        Ok(self.store.scan_prefix(PEER_PREFIX)?.len())
    }

    /// Explicit registration outside gossip (static seeds, tests).
    pub fn register(&self, record: PeerRecord) -> Result<()> {
        store::put(self.store.as_ref(), &record.key(), &record)?;
        self.index(&record);
        tracing::debug!(peer = %record.name, kind = record.kind.as_str(), "peer registered");
        Ok(())
    }

    /// Read-modify-write one peer record with conflict retry, then refresh
    /// the local indexes from whatever was written.
    pub fn upsert<F>(&self, name: &str, apply: F) -> Result<Option<PeerRecord>>
    where
        F: FnMut(Option<PeerRecord>) -> Option<PeerRecord>,
    {
        let written = store::update(self.store.as_ref(), &peer_key(name), apply)?;
        if let Some(record) = &written {
            self.index(record);
        }
        Ok(written)
    }

    /// Flip the `available` flag. Returns true if this call changed it.
    pub fn set_available(&self, name: &str, available: bool) -> Result<bool> {
        let written = self.upsert(name, |current| {
            let mut record = current?;
            if record.available == available {
                return None;
            }
            record.available = available;
            Some(record)
        })?;
        Ok(written.is_some())
    }

    /// Update the capacity rank and service sets for one record.
    pub fn index(&self, record: &PeerRecord) {
        self.capacity
            .insert(record.name.clone(), record.available_capacity);
        for service in &record.services {
            self.members
                .entry(service.clone())
                .or_default()
                .insert(record.name.clone());
        }
    }

    /// Rebuild the local indexes from the store. Called once at startup.
    pub fn rebuild_index(&self) -> Result<usize> {
        let peers = self.all()?;
        for peer in &peers {
            self.index(peer);
        }
        Ok(peers.len())
    }

    /// Peer names, highest available capacity first. Ties break by name.
    pub fn ranked_by_capacity(&self) -> Vec<String> {
        let mut ranked: Vec<(String, u8)> = self
            .capacity
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.into_iter().map(|(name, _)| name).collect()
    }

    /// Every peer ever seen advertising `service`.
    pub fn members_of(&self, service: &str) -> BTreeSet<String> {
        self.members
            .get(service)
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}
