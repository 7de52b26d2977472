//! Error types for the coordination core

use thiserror::Error;

/// Core error type
///
/// Protocol-level negatives (a NO vote, a missed heartbeat, a checkpoint
/// NACK) are ordinary values, not errors. `Error` covers the cases where a
/// call could not be carried out at all.
#[derive(Debug, Error)]
pub enum Error {
    /// Peer could not be reached (dial failure, connection refused, closed)
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// Call did not complete within its deadline
    #[error("call to {0} timed out")]
    Timeout(String),

    /// Peer answered with a reply of the wrong shape
    #[error("unexpected reply from {peer} to {method}")]
    UnexpectedReply {
        /// Peer that answered
        peer: String,
        /// Method that was called
        method: &'static str,
    },

    /// No coordinator is currently known
    #[error("coordinator unavailable")]
    CoordinatorUnavailable,

    /// Node id does not follow the `Node<number>` convention
    #[error("invalid node id {0:?}: expected `Node<number>`")]
    InvalidNodeId(String),

    /// Checkpoint file I/O failure
    #[error("checkpoint I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint or wire encoding failure
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
