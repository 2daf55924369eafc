//! Error types for the data grid.

use crate::types::{NodeAddress, SegmentId, TopologyId};
use std::io;
use thiserror::Error;

/// Result type alias for data grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the data grid.
#[derive(Error, Debug)]
pub enum Error {
    /// Wire protocol errors.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Routing errors (retryable).
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// State transfer errors.
    #[error("rehash error: {0}")]
    Rehash(#[from] RehashError),

    /// Topology management errors.
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Node-to-node transport errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Persistence collaborator errors.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The named cache is not defined.
    #[error("cache not found: {0}")]
    CacheNotFound(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a client may retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Routing(_) | Error::Timeout | Error::Network(NetworkError::NodeUnreachable(_))
        )
    }
}

/// Wire protocol errors.
///
/// Reported to the offending connection only. The connection stays open
/// unless [`ProtocolError::is_fatal`] returns true.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The frame does not follow the protocol grammar.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The opcode or command name is not recognized.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// A field is longer than the configured maximum.
    #[error("field '{field}' of {len} bytes exceeds the limit of {max}")]
    OversizedField {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// Binary frame did not start with the request magic byte.
    #[error("invalid magic byte 0x{0:02x}")]
    InvalidMagic(u8),

    /// A variable-length integer or a length prefix could not be decoded.
    #[error("invalid length encoding: {0}")]
    InvalidLength(String),

    /// Unsupported binary protocol version.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// I/O error on the connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the decoder lost frame synchronization.
    ///
    /// A desynchronized decoder cannot find the next frame boundary, so the
    /// connection must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidMagic(_) | ProtocolError::InvalidLength(_) | ProtocolError::Io(_)
        )
    }
}

/// Routing errors, surfaced to clients as retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The client routed with an older topology than the one in force.
    #[error("stale topology: client has {client}, current is {current}")]
    StaleTopology {
        client: TopologyId,
        current: TopologyId,
    },

    /// A segment has momentarily no live owner.
    #[error("segment {0} has no live owner")]
    NoOwners(SegmentId),
}

/// State transfer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RehashError {
    /// A target kept failing after every retry.
    #[error("target {target} unreachable for segment {segment} after {attempts} attempts")]
    TargetUnreachable {
        target: NodeAddress,
        segment: SegmentId,
        attempts: u32,
    },

    /// No old owner could provide the segment's entries.
    #[error("no source available for segment {segment}")]
    SourceUnavailable {
        segment: SegmentId,
        tried: Vec<NodeAddress>,
    },

    /// The rehash was superseded.
    #[error("rehash for topology {0} cancelled")]
    Cancelled(TopologyId),

    /// One or more segments failed.
    #[error("rehash for topology {topology_id} failed, unreachable: {unreachable:?}")]
    Failed {
        topology_id: TopologyId,
        unreachable: Vec<NodeAddress>,
    },
}

/// Topology management errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Membership has no member able to own segments.
    #[error("no owners available")]
    NoOwnersAvailable,

    /// Overlapping rebalances could not be reconciled.
    #[error("topology conflict: {0}")]
    Conflict(String),

    /// The manager task has stopped.
    #[error("topology manager for cache '{0}' stopped")]
    ManagerStopped(String),
}

/// Node-to-node transport errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The node is not reachable.
    #[error("node unreachable: {0}")]
    NodeUnreachable(NodeAddress),

    /// The node does not run the cache.
    #[error("cache '{cache}' not running on {node}")]
    CacheNotRunning { node: NodeAddress, cache: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Address parse error.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Persistence collaborator errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store rejected or failed the operation.
    #[error("store operation failed: {0}")]
    Failed(String),

    /// The store is not available.
    #[error("store unavailable")]
    Unavailable,
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<bincode::Error> for NetworkError {
    fn from(e: bincode::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_protocol_errors() {
        assert!(ProtocolError::InvalidMagic(0x42).is_fatal());
        assert!(ProtocolError::InvalidLength("varint overflow".into()).is_fatal());
        assert!(!ProtocolError::UnknownOperation("0x99".into()).is_fatal());
        assert!(!ProtocolError::OversizedField {
            field: "key",
            len: 300,
            max: 250
        }
        .is_fatal());
    }

    #[test]
    fn test_retryable() {
        let err: Error = RoutingError::NoOwners(3).into();
        assert!(err.is_retryable());

        let err: Error = TopologyError::NoOwnersAvailable.into();
        assert!(!err.is_retryable());
    }
}
