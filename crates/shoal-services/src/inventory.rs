//! Content inventory of one store, and the responder that answers locate
//! queries from it.
//!
//! Inventory records are durable (`inventory:{hash}:{gateway}:{store}`);
//! the in-memory hash set is rebuilt from them at startup so locate
//! replies never touch the document store.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashSet;

use shoal_core::error::Result;
use shoal_core::record::{
    inventory_key, now_ms, validate_hash, InventoryRecord, Location, INVENTORY_PREFIX,
};
use shoal_core::wire::{Event, LocateReply, EVENT_LOCATE};

use crate::send_target::{enqueue, Outbox, SendTarget};
use crate::service::EventHandler;
use crate::store::{self, SharedStore};

pub struct Inventory {
    store_name: String,
    gateway: String,
    docs: SharedStore,
    hashes: DashSet<String>,
}

impl Inventory {
    pub fn new(store_name: impl Into<String>, gateway: impl Into<String>, docs: SharedStore) -> Self {
        Self {
            store_name: store_name.into(),
            gateway: gateway.into(),
            docs,
            hashes: DashSet::new(),
        }
    }

    /// Rebuild the local hash set from this store's durable records.
    pub fn load(&self) -> Result<usize> {
        let records: Vec<InventoryRecord> = store::scan(self.docs.as_ref(), INVENTORY_PREFIX)?;
        for record in records.into_iter().filter(|r| r.store == self.store_name) {
            self.hashes.insert(record.hash);
        }
        tracing::info!(store = %self.store_name, entries = self.hashes.len(), "inventory loaded");
        Ok(self.hashes.len())
    }

    /// Record that this store now holds `hash`.
    pub fn add(
        &self,
        hash: &str,
        mime_type: &str,
        mime_extension: &str,
        relative_path: &str,
    ) -> Result<InventoryRecord> {
        validate_hash(hash)?;
        let record = InventoryRecord {
            hash: hash.to_string(),
            gateway: self.gateway.clone(),
            store: self.store_name.clone(),
            mime_type: mime_type.to_string(),
            mime_extension: mime_extension.to_string(),
            relative_path: relative_path.to_string(),
            created_at: now_ms(),
        };
        store::put(self.docs.as_ref(), &record.key(), &record)?;
        self.hashes.insert(record.hash.clone());
        tracing::debug!(hash, store = %self.store_name, "inventory added");
        Ok(record)
    }

    /// Forget `hash`. Returns false if it was not held.
    pub fn remove(&self, hash: &str) -> Result<bool> {
        validate_hash(hash)?;
        let removed = self
            .docs
            .remove(&inventory_key(hash, &self.gateway, &self.store_name))?;
        let held = self.hashes.remove(hash).is_some();
        Ok(removed || held)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Every durable record for `hash`, cluster-wide.
    pub fn records_for(&self, hash: &str) -> Result<Vec<InventoryRecord>> {
        validate_hash(hash)?;
        store::scan(self.docs.as_ref(), &format!("{INVENTORY_PREFIX}{hash}:"))
    }

    /// Locations of `hash` according to the durable records.
    pub fn locations(&self, hash: &str) -> Result<Vec<Location>> {
        Ok(self
            .records_for(hash)?
            .into_iter()
            .map(|r| Location {
                gateway: r.gateway,
                store: r.store,
            })
            .collect())
    }
}

/// Answers `locate` broadcasts from the local inventory.
pub struct LocateResponder {
    name: String,
    inventory: Arc<Inventory>,
    outbox: Outbox,
}

impl LocateResponder {
    pub fn new(name: impl Into<String>, inventory: Arc<Inventory>, outbox: Outbox) -> Self {
        Self {
            name: name.into(),
            inventory,
            outbox,
        }
    }
}

impl EventHandler for LocateResponder {
    fn kinds(&self) -> &'static [&'static str] {
        &[EVENT_LOCATE]
    }

    fn handle(&self, origin: SocketAddr, event: &Event) -> Result<()> {
        let Event::Locate(request) = event else {
            return Ok(());
        };
        validate_hash(&request.hash)?;

        let exists = self.inventory.contains(&request.hash);
        tracing::trace!(hash = %request.hash, exists, from = %origin, "answering locate");
        enqueue(
            &self.outbox,
            SendTarget::Broadcast,
            Event::LocateReply(LocateReply {
                token: request.token.clone(),
                peer: self.name.clone(),
                exists,
            }),
        );
        Ok(())
    }
}
