//! Error taxonomy shared by every cluster component.
//!
//! Reaching quorum is not modelled here: a vote that leaves its target below
//! threshold is an ordinary outcome (`VoteOutcome::Pending`).

use crate::wire::WireError;

/// Rejected input. Nothing has been mutated when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed content hash '{0}'")]
    MalformedHash(String),

    #[error("request is missing its token")]
    MissingToken,

    #[error("announce for our own hostname '{hostname}' arrived from foreign address {addr}")]
    HostnameCollision { hostname: String, addr: String },

    #[error("message on behalf of '{peer}' arrived from {addr}, not its announced host")]
    ImpersonatedPeer { peer: String, addr: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Socket bind/send/receive failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// Concurrent write to a durable record. Callers re-read and retry.
    #[error("write conflict on {key}")]
    Conflict { key: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("record {key} is unreadable: {reason}")]
    Corrupt { key: String, reason: String },

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl ClusterError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }
}

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;
