//! Socket-level transport: multicast datagrams, framed streams, and the
//! duplicate filter in front of them.

pub mod dedup;
pub mod multicast;
pub mod stream;

pub use dedup::PacketFilter;
