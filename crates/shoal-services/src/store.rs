//! Durable document store — the shared source of truth for peers, votes
//! and inventory.
//!
//! The store itself is an external collaborator. Components talk to it
//! through [`DocumentStore`]; [`MemoryDocumentStore`] backs tests and
//! single-node runs. Every document carries a revision so read-modify-write
//! cycles can detect concurrent writers and retry.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use shoal_core::error::{ClusterError, Result};

/// How many times a read-modify-write is retried on conflict before giving up.
pub const MAX_CONFLICT_RETRIES: usize = 8;

/// A stored document: opaque JSON body plus its current revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub key: String,
    pub revision: u64,
    pub body: Vec<u8>,
}

pub trait DocumentStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Document>>;

    /// Write `body` under `key`.
    ///
    /// `expected` is the revision the caller read: `None` means the key must
    /// not exist yet. A mismatch returns [`ClusterError::Conflict`].
    /// Returns the new revision.
    fn save(&self, key: &str, body: Vec<u8>, expected: Option<u64>) -> Result<u64>;

    /// Remove a key. Returns false if it was already gone.
    fn remove(&self, key: &str) -> Result<bool>;

    /// All documents whose key starts with `prefix`, ordered by key.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<Document>>;
}

pub type SharedStore = Arc<dyn DocumentStore>;

// ── In-memory store ───────────────────────────────────────────────────────────

/// Process-local [`DocumentStore`]. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    docs: Arc<DashMap<String, Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn get(&self, key: &str) -> Result<Option<Document>> {
        Ok(self.docs.get(key).map(|d| d.clone()))
    }

    fn save(&self, key: &str, body: Vec<u8>, expected: Option<u64>) -> Result<u64> {
        let conflict = || ClusterError::Conflict {
            key: key.to_string(),
        };
        match self.docs.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().revision;
                if expected != Some(current) {
                    return Err(conflict());
                }
                let revision = current + 1;
                occupied.insert(Document {
                    key: key.to_string(),
                    revision,
                    body,
                });
                Ok(revision)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Err(conflict());
                }
                vacant.insert(Document {
                    key: key.to_string(),
                    revision: 1,
                    body,
                });
                Ok(1)
            }
        }
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.docs.remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .docs
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.value().clone())
            .collect();
        docs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(docs)
    }
}

// ── Typed access ──────────────────────────────────────────────────────────────

fn decode<T: DeserializeOwned>(doc: &Document) -> Result<T> {
    serde_json::from_slice(&doc.body).map_err(|e| ClusterError::Corrupt {
        key: doc.key.clone(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ClusterError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Read and decode one record together with its revision.
pub fn load<T: DeserializeOwned>(store: &dyn DocumentStore, key: &str) -> Result<Option<(T, u64)>> {
    match store.get(key)? {
        Some(doc) => Ok(Some((decode(&doc)?, doc.revision))),
        None => Ok(None),
    }
}

/// Decode every record under a prefix. Unreadable documents are skipped.
pub fn scan<T: DeserializeOwned>(store: &dyn DocumentStore, prefix: &str) -> Result<Vec<T>> {
    let docs = store.scan_prefix(prefix)?;
    let mut out = Vec::with_capacity(docs.len());
    for doc in &docs {
        match decode(doc) {
            Ok(record) => out.push(record),
            Err(e) => tracing::warn!(key = %doc.key, error = %e, "skipping unreadable record"),
        }
    }
    Ok(out)
}

/// Unconditionally write a record, retrying until the write lands.
pub fn put<T: Serialize + DeserializeOwned + Clone>(
    store: &dyn DocumentStore,
    key: &str,
    value: &T,
) -> Result<()> {
    update(store, key, |_: Option<T>| Some(value.clone())).map(|_| ())
}

/// Read-modify-write with conflict retry.
///
/// `apply` sees the current record (or `None`) and returns the record to
/// write, or `None` to leave the store untouched. It may run several times
/// when another writer races us. Returns what was written.
pub fn update<T, F>(store: &dyn DocumentStore, key: &str, mut apply: F) -> Result<Option<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> Option<T>,
{
    for attempt in 0..MAX_CONFLICT_RETRIES {
        let (current, revision) = match load::<T>(store, key)? {
            Some((value, rev)) => (Some(value), Some(rev)),
            None => (None, None),
        };
        let Some(next) = apply(current) else {
            return Ok(None);
        };
        let body = encode(key, &next)?;
        match store.save(key, body, revision) {
            Ok(_) => return Ok(Some(next)),
            Err(e) if e.is_conflict() => {
                tracing::debug!(key, attempt, "write conflict, re-reading");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(ClusterError::Conflict {
        key: key.to_string(),
    })
}
