//! Ping bookkeeping. Only the most recent ping to each peer is tracked, so a
//! late pong for an older token never yields a round-trip time.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use shoal_core::record::now_ms;
use shoal_core::wire::{new_token, Ping};

#[derive(Default)]
pub struct PingTracker {
    outstanding: DashMap<String, (String, Instant)>,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a ping to `peer`, superseding any earlier one.
    pub fn begin(&self, peer: &str) -> Ping {
        let token = new_token();
        self.outstanding
            .insert(peer.to_string(), (token.clone(), Instant::now()));
        Ping {
            token,
            sent_at: now_ms(),
        }
    }

    /// Match a pong. Returns the elapsed time only if `token` is the latest
    /// ping sent to `peer`.
    pub fn complete(&self, peer: &str, token: &str) -> Option<Duration> {
        let (_, (_, started)) = self
            .outstanding
            .remove_if(peer, |_, (latest, _)| latest == token)?;
        Some(started.elapsed())
    }

    pub fn pending(&self) -> usize {
        self.outstanding.len()
    }
}
