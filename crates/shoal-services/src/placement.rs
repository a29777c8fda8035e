//! Placement — read source and write target selection, replica add/remove.
//!
//! Selection among equals is load-balanced by hit counters in the ephemeral
//! cache (`hits:{token}:{peer}`): the candidate with the fewest hits wins and
//! its counter is bumped. Counters left alone for [`HIT_COUNTER_TTL`] expire.
//! Replica destinations are picked at random, from a different routing
//! domain than the source when one is available. A source must pass
//! `verify` before it is copied, and a replica only counts once the
//! destination reports that it `exists`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use shoal_core::error::Result;
use shoal_core::record::{validate_hash, ExistenceMap, Location, PeerRecord};
use shoal_core::wire::SERVICE_STORE;

use crate::cache::{counter, existence_key, hits_key, SharedCache};
use crate::peer::PeerRegistry;
use crate::transfer::TransferApi;

/// Hit-counter namespace used when choosing where new content is written.
pub const WRITE_TOKEN: &str = "write";

/// Idle lifetime of a hit counter. Every hit restarts it.
pub const HIT_COUNTER_TTL: Duration = Duration::from_secs(3600);

/// How far the current replica count is from the desired one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    Add(usize),
    Remove(usize),
    None,
}

/// What to do about one piece of content. Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationIntent {
    pub hash: String,
    pub locations: Vec<Location>,
    pub delta: Delta,
}

impl ReplicationIntent {
    pub fn compute(hash: impl Into<String>, locations: Vec<Location>, desired: usize) -> Self {
        let current = locations
            .iter()
            .map(|l| l.store.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let delta = match current.cmp(&desired) {
            std::cmp::Ordering::Less => Delta::Add(desired - current),
            std::cmp::Ordering::Greater => Delta::Remove(current - desired),
            std::cmp::Ordering::Equal => Delta::None,
        };
        Self {
            hash: hash.into(),
            locations,
            delta,
        }
    }
}

/// Outcome of a batch of add/remove attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationReport {
    pub added: Vec<Location>,
    pub removed: Vec<Location>,
    /// Attempts with no eligible source or destination.
    pub skipped: usize,
    /// Attempts where the store call failed.
    pub failed: usize,
}

pub struct Placement<T> {
    registry: PeerRegistry,
    cache: SharedCache,
    transfer: T,
    rng: Mutex<StdRng>,
}

impl<T: TransferApi> Placement<T> {
    pub fn new(registry: PeerRegistry, cache: SharedCache, transfer: T) -> Self {
        Self {
            registry,
            cache,
            transfer,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replace the randomness source, for deterministic picks.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    fn pick<'a, X>(&self, items: &'a [X]) -> Option<&'a X> {
        if items.is_empty() {
            return None;
        }
        let index = self
            .rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .gen_range(0..items.len());
        items.get(index)
    }

    /// Least-hit eligible candidate under `token`. Its counter is bumped.
    ///
    /// Eligible means not in `skip`, available, and writable unless
    /// `allow_full`. Ties go to the candidate listed first.
    pub fn winner(
        &self,
        token: &str,
        candidates: &[PeerRecord],
        skip: &HashSet<String>,
        allow_full: bool,
    ) -> Option<PeerRecord> {
        let mut best: Option<(&PeerRecord, i64)> = None;
        for peer in candidates {
            if skip.contains(&peer.name) || !peer.available || !(peer.writable || allow_full) {
                continue;
            }
            let hits = counter(self.cache.as_ref(), &hits_key(token, &peer.name));
            if best.map_or(true, |(_, lowest)| hits < lowest) {
                best = Some((peer, hits));
            }
        }
        let (peer, _) = best?;
        let key = hits_key(token, &peer.name);
        self.cache.increment(&key);
        self.cache.expire(&key, HIT_COUNTER_TTL);
        Some(peer.clone())
    }

    /// Turn a locate result into locations, dropping peers that said no or
    /// that we have never heard of.
    pub fn locations(&self, existence: &ExistenceMap) -> Result<Vec<Location>> {
        let mut out = Vec::new();
        for name in existence.iter().filter(|(_, held)| **held).map(|(n, _)| n) {
            match self.registry.get(name)? {
                Some(peer) => out.push(Location {
                    gateway: peer.routing_domain().to_string(),
                    store: peer.name,
                }),
                None => tracing::debug!(peer = %name, "holder unknown to registry"),
            }
        }
        Ok(out)
    }

    /// Which holder should serve a read of `hash`.
    pub fn read_target(&self, hash: &str, existence: &ExistenceMap) -> Result<Option<PeerRecord>> {
        validate_hash(hash)?;
        let mut holders = Vec::new();
        for name in existence.iter().filter(|(_, held)| **held).map(|(n, _)| n) {
            if let Some(peer) = self.registry.get(name)? {
                holders.push(peer);
            }
        }
        Ok(self.winner(hash, &holders, &HashSet::new(), true))
    }

    /// Which store should take new content. Candidates are considered in
    /// capacity order, so ties favour the emptiest store.
    pub fn write_target(&self, skip: &HashSet<String>) -> Result<Option<PeerRecord>> {
        let mut stores = Vec::new();
        for name in self.registry.ranked_by_capacity() {
            if let Some(peer) = self.registry.get(&name)? {
                if peer.has_service(SERVICE_STORE) {
                    stores.push(peer);
                }
            }
        }
        Ok(self.winner(WRITE_TOKEN, &stores, skip, false))
    }

    /// Drop the cached locate result for `hash`.
    pub fn invalidate(&self, hash: &str) {
        self.cache.expire(&existence_key(hash), Duration::ZERO);
    }

    /// Create up to `count` new replicas of `hash`.
    pub async fn replicate(
        &self,
        hash: &str,
        locations: &[Location],
        count: usize,
    ) -> Result<ReplicationReport> {
        validate_hash(hash)?;
        let peers: BTreeMap<String, PeerRecord> = self
            .registry
            .all()?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        let holders: HashSet<&str> = locations.iter().map(|l| l.store.as_str()).collect();
        let mut added: HashSet<String> = HashSet::new();
        let mut verified: HashSet<String> = HashSet::new();
        let mut report = ReplicationReport::default();

        for attempt in 0..count {
            let sources: Vec<&Location> = locations
                .iter()
                .filter(|l| peers.get(&l.store).is_some_and(|p| p.available))
                .collect();
            let Some(&source_at) = self.pick(&sources) else {
                tracing::warn!(hash, attempt, "no available source, skipping replica");
                report.skipped += 1;
                continue;
            };
            let Some(source) = peers.get(&source_at.store) else {
                report.skipped += 1;
                continue;
            };

            let eligible: Vec<&PeerRecord> = peers
                .values()
                .filter(|p| {
                    p.has_service(SERVICE_STORE)
                        && p.available
                        && p.writable
                        && !holders.contains(p.name.as_str())
                        && !added.contains(&p.name)
                })
                .collect();
            let elsewhere: Vec<&PeerRecord> = eligible
                .iter()
                .copied()
                .filter(|p| p.routing_domain() != source_at.gateway)
                .collect();
            let pool = if elsewhere.is_empty() { &eligible } else { &elsewhere };
            let Some(&destination) = self.pick(pool) else {
                tracing::warn!(hash, attempt, "no eligible destination, skipping replica");
                report.skipped += 1;
                continue;
            };

            if !verified.contains(&source.name) {
                match self.transfer.verify(source, hash).await {
                    Ok(true) => {
                        verified.insert(source.name.clone());
                    }
                    Ok(false) => {
                        tracing::warn!(hash, source = %source.name, "source copy failed verification, not copying it");
                        report.failed += 1;
                        self.invalidate(hash);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(hash, source = %source.name, error = %e, "source verification failed");
                        report.failed += 1;
                        self.invalidate(hash);
                        continue;
                    }
                }
            }

            let landed = match self.transfer.send(source, destination, hash).await {
                Ok(()) => self.transfer.exists(destination, hash).await,
                Err(e) => Err(e),
            };
            match landed {
                Ok(true) => {
                    tracing::info!(hash, from = %source.name, to = %destination.name, "replica added");
                    added.insert(destination.name.clone());
                    report.added.push(Location {
                        gateway: destination.routing_domain().to_string(),
                        store: destination.name.clone(),
                    });
                }
                Ok(false) => {
                    tracing::warn!(hash, from = %source.name, to = %destination.name, "push accepted but replica is missing");
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::warn!(hash, from = %source.name, to = %destination.name, error = %e, "replica push failed");
                    report.failed += 1;
                }
            }
            self.invalidate(hash);
        }
        Ok(report)
    }

    /// Remove up to `count` replicas of `hash`, never touching `protected` stores.
    pub async fn prune(
        &self,
        hash: &str,
        locations: &[Location],
        count: usize,
        protected: &HashSet<String>,
    ) -> Result<ReplicationReport> {
        validate_hash(hash)?;
        let mut removable: Vec<Location> = locations
            .iter()
            .filter(|l| !protected.contains(&l.store))
            .cloned()
            .collect();
        let mut report = ReplicationReport::default();

        for attempt in 0..count {
            let Some(victim) = self.pick(&removable).cloned() else {
                tracing::warn!(hash, attempt, "no removable replica, skipping");
                report.skipped += 1;
                continue;
            };
            removable.retain(|l| l != &victim);

            let Some(store) = self.registry.get(&victim.store)? else {
                tracing::warn!(hash, store = %victim.store, "holder unknown to registry, skipping");
                report.skipped += 1;
                continue;
            };
            match self.transfer.remove(&store, hash).await {
                Ok(()) => {
                    tracing::info!(hash, store = %store.name, "replica removed");
                    report.removed.push(victim);
                }
                Err(e) => {
                    tracing::warn!(hash, store = %store.name, error = %e, "replica removal failed");
                    report.failed += 1;
                }
            }
            self.invalidate(hash);
        }
        Ok(report)
    }

    /// Carry out an intent.
    pub async fn apply(
        &self,
        intent: &ReplicationIntent,
        protected: &HashSet<String>,
    ) -> Result<ReplicationReport> {
        match intent.delta {
            Delta::Add(n) => self.replicate(&intent.hash, &intent.locations, n).await,
            Delta::Remove(n) => self.prune(&intent.hash, &intent.locations, n, protected).await,
            Delta::None => Ok(ReplicationReport::default()),
        }
    }
}
