//! shoal-core — wire format, durable records, configuration and errors.
//! All other Shoal crates depend on this one.

pub mod config;
pub mod error;
pub mod record;
pub mod wire;

pub use error::{ClusterError, ValidationError};
pub use record::{
    Capacity, DownVote, ExistenceMap, InventoryRecord, Location, PeerKind, PeerRecord,
};
pub use wire::{Event, ReadyState};
