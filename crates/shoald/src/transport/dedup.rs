//! Duplicate-datagram suppression.
//!
//! Multicast delivers the same packet more than once when a host sits on
//! several interfaces or a switch floods. Each datagram is digested together
//! with its sender address; a digest seen within the window is dropped
//! before any handler runs. Memory is bounded by `capacity`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

type Digest = [u8; 32];

pub struct PacketFilter {
    window: Duration,
    capacity: usize,
    seen: HashMap<Digest, Instant>,
    order: VecDeque<(Digest, Instant)>,
}

impl PacketFilter {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn digest(from: SocketAddr, bytes: &[u8]) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(from.to_string().as_bytes());
        hasher.update(bytes);
        *hasher.finalize().as_bytes()
    }

    /// True if the packet is new and should be dispatched.
    pub fn admit(&mut self, from: SocketAddr, bytes: &[u8]) -> bool {
        let now = Instant::now();
        self.expire(now);

        let digest = Self::digest(from, bytes);
        if self.seen.contains_key(&digest) {
            return false;
        }
        self.seen.insert(digest, now);
        self.order.push_back((digest, now));

        while self.order.len() > self.capacity {
            self.pop_oldest();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, at)) = self.order.front() {
            if now.duration_since(*at) < self.window {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((digest, at)) = self.order.pop_front() {
            if self.seen.get(&digest) == Some(&at) {
                self.seen.remove(&digest);
            }
        }
    }
}
