//! shoal-services — socket-free cluster logic.
//!
//! Everything here talks to the outside world through three seams: an
//! [`send_target::Outbox`] for outbound events, the [`store::DocumentStore`]
//! and [`cache::KeyValueCache`] collaborators, and the
//! [`transfer::TransferApi`] for store-to-store byte movement. The daemon
//! plugs sockets into those; tests plug in memory.

pub mod cache;
pub mod detector;
pub mod gossip;
pub mod identity;
pub mod inventory;
pub mod locate;
pub mod peer;
pub mod ping;
pub mod placement;
pub mod send_target;
pub mod service;
pub mod store;
pub mod transfer;

pub use cache::{KeyValueCache, MemoryCache, SharedCache};
pub use detector::{FailureDetector, Probe, VoteOutcome};
pub use gossip::{AnnounceOutcome, Membership};
pub use identity::NodeIdentity;
pub use inventory::{Inventory, LocateResponder};
pub use locate::Locator;
pub use peer::PeerRegistry;
pub use ping::PingTracker;
pub use placement::{Delta, Placement, ReplicationIntent, ReplicationReport};
pub use send_target::{Outbox, OutboxReceiver, SendTarget};
pub use service::EventHandler;
pub use store::{DocumentStore, MemoryDocumentStore, SharedStore};
pub use transfer::{HttpTransfer, TransferApi};
