//! Failure detector — liveness probing with quorum down-votes.
//!
//! Each node probes every other known peer. A peer that fails more than
//! `retry_threshold` consecutive probes earns a down-vote from this node,
//! persisted as `vote:{target}:{caster}`. Once live votes against a peer
//! reach `ceil(peers / 2)` the voter that tipped it flips the peer's
//! `available` flag. Only the peer itself ever flips it back, by marking
//! itself up at startup and purging the votes against it.
//!
//! Each node keeps its own vote log, so votes and mark-ups are broadcast
//! as they happen. Receivers copy remote votes into their log and run the
//! same quorum check, which lets every node reach the mark-down on its own.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio::time::Instant;

use shoal_core::config::DetectorConfig;
use shoal_core::error::{Result, ValidationError};
use shoal_core::record::{now_ms, votes_against_prefix, vote_key, DownVote, PeerRecord, VOTE_PREFIX};
use shoal_core::wire::{Event, MarkUp, EVENT_MARK_UP, EVENT_VOTE};

use crate::peer::PeerRegistry;
use crate::send_target::{enqueue, Outbox, SendTarget};
use crate::service::EventHandler;
use crate::store;

/// A single liveness check against one peer. `Ok` means the peer answered.
pub trait Probe: Send + Sync {
    fn probe(&self, peer: &PeerRecord) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Result of casting a down-vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// This caster already holds a live vote against the target.
    AlreadyCast { votes: usize },
    /// Recorded, but quorum is not reached yet.
    Pending { votes: usize, needed: usize },
    /// This vote reached quorum and flipped the peer unavailable.
    MarkedDown { votes: usize },
    /// Quorum reached but someone else already flipped it.
    AlreadyDown,
}

/// Votes needed to mark a peer down out of `total` known peers.
pub fn quorum(total: usize) -> usize {
    total.div_ceil(2).max(1)
}

pub struct FailureDetector<P> {
    name: String,
    registry: PeerRegistry,
    probe: P,
    config: DetectorConfig,
    failures: DashMap<String, u32>,
    rng: Mutex<StdRng>,
    outbox: Option<Outbox>,
}

impl<P: Probe> FailureDetector<P> {
    pub fn new(name: impl Into<String>, registry: PeerRegistry, probe: P, config: DetectorConfig) -> Self {
        Self {
            name: name.into(),
            registry,
            probe,
            config,
            failures: DashMap::new(),
            rng: Mutex::new(StdRng::from_entropy()),
            outbox: None,
        }
    }

    /// Broadcast votes and mark-ups so peers with their own vote log see them.
    pub fn with_outbox(mut self, outbox: Outbox) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Replace the jitter source, for deterministic scheduling.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consecutive failures recorded for a peer.
    pub fn failures(&self, peer: &str) -> u32 {
        self.failures.get(peer).map(|f| *f).unwrap_or(0)
    }

    /// Probe one peer and vote if it has failed too often.
    pub async fn probe_peer(&self, peer: &PeerRecord) -> Result<Option<VoteOutcome>> {
        let alive = match tokio::time::timeout(self.config.probe_timeout(), self.probe.probe(peer)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer.name, error = %e, "probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(peer = %peer.name, "probe timed out");
                false
            }
        };

        if alive {
            self.failures.remove(&peer.name);
            return Ok(None);
        }

        let count = {
            let mut entry = self.failures.entry(peer.name.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count <= self.config.retry_threshold {
            return Ok(None);
        }
        self.cast_vote(&peer.name).map(Some)
    }

    /// Probe every known peer except ourselves. Returns outcomes of any votes cast.
    pub async fn probe_all(&self) -> Result<HashMap<String, VoteOutcome>> {
        let peers: Vec<PeerRecord> = self
            .registry
            .all()?
            .into_iter()
            .filter(|p| p.name != self.name)
            .collect();

        let results = futures::future::join_all(peers.iter().map(|p| self.probe_peer(p))).await;

        let mut votes = HashMap::new();
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(Some(outcome)) => {
                    votes.insert(peer.name.clone(), outcome);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(peer = %peer.name, error = %e, "down-vote failed"),
            }
        }
        Ok(votes)
    }

    /// Cast (or refresh) this node's vote against `target`, then check quorum.
    pub fn cast_vote(&self, target: &str) -> Result<VoteOutcome> {
        let now = now_ms();
        let lifetime = self.config.vote_lifetime_ms();
        let mut standing = None;

        store::update(
            self.registry.store().as_ref(),
            &vote_key(target, &self.name),
            |current: Option<DownVote>| match current {
                Some(vote) if vote.is_live(now, lifetime) => {
                    standing = Some(vote);
                    None
                }
                _ => {
                    standing = None;
                    Some(DownVote {
                        target: target.to_string(),
                        caster: self.name.clone(),
                        cast_at: now,
                    })
                }
            },
        )?;

        let already = standing.is_some();
        // Re-sent while it stands: datagrams get lost.
        self.publish(Event::Vote(standing.unwrap_or_else(|| DownVote {
            target: target.to_string(),
            caster: self.name.clone(),
            cast_at: now,
        })));
        self.tally(target, already)
    }

    /// Fold a vote cast by another node into our log, then check quorum.
    /// Votes we cast ourselves and expired votes are ignored.
    pub fn accept_vote(&self, vote: &DownVote, origin: IpAddr) -> Result<Option<VoteOutcome>> {
        if vote.caster == self.name || !vote.is_live(now_ms(), self.config.vote_lifetime_ms()) {
            return Ok(None);
        }
        self.check_sender(&vote.caster, origin)?;

        store::update(
            self.registry.store().as_ref(),
            &vote.key(),
            |current: Option<DownVote>| match current {
                Some(held) if held.cast_at >= vote.cast_at => None,
                _ => Some(vote.clone()),
            },
        )?;
        self.tally(&vote.target, false).map(Some)
    }

    /// Apply another node's self mark-up: restore it and purge the votes
    /// against it. Returns how many votes were purged.
    pub fn accept_mark_up(&self, mark_up: &MarkUp, origin: IpAddr) -> Result<usize> {
        if mark_up.hostname == self.name {
            return Ok(0);
        }
        self.check_sender(&mark_up.hostname, origin)?;

        self.registry.upsert(&mark_up.hostname, |current| {
            let mut record = current?;
            if record.available {
                return None;
            }
            record.available = true;
            Some(record)
        })?;
        let purged = self.purge_votes_against(&mark_up.hostname)?;
        tracing::info!(peer = %mark_up.hostname, purged, "peer marked itself up");
        Ok(purged)
    }

    fn tally(&self, target: &str, already: bool) -> Result<VoteOutcome> {
        let votes = self.live_votes(target)?;
        let needed = quorum(self.registry.count()?);
        if votes < needed {
            let outcome = if already {
                VoteOutcome::AlreadyCast { votes }
            } else {
                VoteOutcome::Pending { votes, needed }
            };
            tracing::debug!(peer = %target, votes, needed, "down-vote recorded");
            return Ok(outcome);
        }

        if self.registry.set_available(target, false)? {
            tracing::warn!(peer = %target, votes, "peer marked unavailable");
            Ok(VoteOutcome::MarkedDown { votes })
        } else {
            Ok(VoteOutcome::AlreadyDown)
        }
    }

    /// A peer may only speak for itself from the host it announced.
    fn check_sender(&self, peer: &str, origin: IpAddr) -> Result<()> {
        let Some(record) = self.registry.get(peer)? else {
            return Ok(());
        };
        if record.host.is_empty() || record.host.parse::<IpAddr>().ok() == Some(origin) {
            return Ok(());
        }
        Err(ValidationError::ImpersonatedPeer {
            peer: peer.to_string(),
            addr: origin.to_string(),
        }
        .into())
    }

    fn publish(&self, event: Event) {
        if let Some(outbox) = &self.outbox {
            enqueue(outbox, SendTarget::Broadcast, event);
        }
    }

    /// Distinct unexpired votes against `target`.
    pub fn live_votes(&self, target: &str) -> Result<usize> {
        let now = now_ms();
        let lifetime = self.config.vote_lifetime_ms();
        let votes: Vec<DownVote> =
            store::scan(self.registry.store().as_ref(), &votes_against_prefix(target))?;
        Ok(votes
            .iter()
            .filter(|v| v.target == target && v.is_live(now, lifetime))
            .count())
    }

    /// Delete this node's own votes that have outlived the vote lifetime.
    pub fn prune_votes(&self) -> Result<usize> {
        let now = now_ms();
        let lifetime = self.config.vote_lifetime_ms();
        let store = self.registry.store();
        let votes: Vec<DownVote> = store::scan(store.as_ref(), VOTE_PREFIX)?;

        let mut pruned = 0;
        for vote in votes
            .iter()
            .filter(|v| v.caster == self.name && !v.is_live(now, lifetime))
        {
            if store.remove(&vote.key())? {
                pruned += 1;
            }
        }
        if pruned > 0 {
            tracing::debug!(pruned, "expired down-votes pruned");
        }
        Ok(pruned)
    }

    /// Mark ourselves available and purge every vote against us.
    /// Returns how many votes were purged.
    pub fn mark_up(&self) -> Result<usize> {
        self.registry.upsert(&self.name, |current| {
            let mut record = current?;
            if record.available && record.active {
                return None;
            }
            record.available = true;
            record.active = true;
            Some(record)
        })?;

        let purged = self.purge_votes_against(&self.name)?;
        self.publish(Event::MarkUp(MarkUp {
            hostname: self.name.clone(),
        }));
        tracing::info!(purged, "marked self up");
        Ok(purged)
    }

    /// Delete every vote whose target is exactly `target`. The key prefix
    /// alone would also match targets that extend it with a colon.
    fn purge_votes_against(&self, target: &str) -> Result<usize> {
        let store = self.registry.store();
        let votes: Vec<DownVote> = store::scan(store.as_ref(), &votes_against_prefix(target))?;
        let mut purged = 0;
        for vote in votes.iter().filter(|v| v.target == target) {
            if store.remove(&vote.key())? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Delay before the next probe cycle: `elapsed + jitter + base`.
    pub fn next_delay(&self, elapsed: Duration) -> Duration {
        let jitter_ms = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen_range(0..=self.config.probe_jitter_ms)
        };
        elapsed + Duration::from_millis(jitter_ms) + self.config.probe_frequency()
    }

    /// Probe loop. Runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            base_ms = self.config.probe_frequency_ms,
            jitter_ms = self.config.probe_jitter_ms,
            "failure detector starting"
        );
        loop {
            let started = Instant::now();
            if let Err(e) = self.probe_all().await {
                tracing::warn!(error = %e, "probe cycle failed");
            }
            let delay = self.next_delay(started.elapsed());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => {
                    tracing::info!("failure detector stopped");
                    return;
                }
            }
        }
    }

    /// Periodically prune our own expired votes. Runs until shutdown.
    pub async fn run_pruner(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.prune_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.prune_votes() {
                        tracing::warn!(error = %e, "vote pruning failed");
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }
}

impl<P: Probe> EventHandler for FailureDetector<P> {
    fn kinds(&self) -> &'static [&'static str] {
        &[EVENT_VOTE, EVENT_MARK_UP]
    }

    fn handle(&self, origin: SocketAddr, event: &Event) -> Result<()> {
        match event {
            Event::Vote(vote) => self.accept_vote(vote, origin.ip()).map(|_| ()),
            Event::MarkUp(mark_up) => self.accept_mark_up(mark_up, origin.ip()).map(|_| ()),
            _ => Ok(()),
        }
    }
}
