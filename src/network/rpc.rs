//! Node-to-node message types.

use crate::error::NetworkError;
use crate::rebalancing::{TransferBatch, TransferEntry};
use crate::types::{CacheEntry, CacheStats, SegmentId, WriteCommand, WriteOutcome};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Request sent to a cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeRequest {
    /// Execute a write command on the node's container.
    Execute { cache: String, command: WriteCommand },

    /// Read an entry.
    Read { cache: String, key: Bytes },

    /// Snapshot the live entries of a segment.
    FetchSegment { cache: String, segment: SegmentId },

    /// Install a batch of transferred entries.
    PushBatch { cache: String, batch: TransferBatch },

    /// Open inbound tracking for a segment.
    BeginInbound { cache: String, segment: SegmentId },

    /// Close inbound tracking for a segment.
    EndInbound { cache: String, segment: SegmentId },

    /// Drop a segment the node no longer owns.
    PurgeSegment { cache: String, segment: SegmentId },

    /// Drop every entry of a cache.
    Clear { cache: String },

    /// Local statistics of a cache.
    Stats { cache: String },

    /// Liveness check.
    Ping,
}

impl NodeRequest {
    /// Short operation name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            NodeRequest::Execute { .. } => "execute",
            NodeRequest::Read { .. } => "read",
            NodeRequest::FetchSegment { .. } => "fetch_segment",
            NodeRequest::PushBatch { .. } => "push_batch",
            NodeRequest::BeginInbound { .. } => "begin_inbound",
            NodeRequest::EndInbound { .. } => "end_inbound",
            NodeRequest::PurgeSegment { .. } => "purge_segment",
            NodeRequest::Clear { .. } => "clear",
            NodeRequest::Stats { .. } => "stats",
            NodeRequest::Ping => "ping",
        }
    }

    /// Cache the request is about, if any.
    pub fn cache(&self) -> Option<&str> {
        match self {
            NodeRequest::Execute { cache, .. }
            | NodeRequest::Read { cache, .. }
            | NodeRequest::FetchSegment { cache, .. }
            | NodeRequest::PushBatch { cache, .. }
            | NodeRequest::BeginInbound { cache, .. }
            | NodeRequest::EndInbound { cache, .. }
            | NodeRequest::PurgeSegment { cache, .. }
            | NodeRequest::Clear { cache }
            | NodeRequest::Stats { cache } => Some(cache),
            NodeRequest::Ping => None,
        }
    }

    /// Segment the request is about, if any.
    pub fn segment(&self) -> Option<SegmentId> {
        match self {
            NodeRequest::FetchSegment { segment, .. }
            | NodeRequest::BeginInbound { segment, .. }
            | NodeRequest::EndInbound { segment, .. }
            | NodeRequest::PurgeSegment { segment, .. } => Some(*segment),
            NodeRequest::PushBatch { batch, .. } => Some(batch.segment),
            _ => None,
        }
    }
}

/// Response from a cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeResponse {
    /// Outcome of an executed write.
    Outcome(WriteOutcome),

    /// Result of a read.
    Entry(Option<CacheEntry>),

    /// Entries of a segment.
    Entries(Vec<TransferEntry>),

    /// Number of entries affected.
    Count(u64),

    /// Cache statistics.
    Stats {
        entry_count: u64,
        hits: u64,
        misses: u64,
        writes: u64,
        removals: u64,
    },

    /// Request done.
    Ack,

    /// Answer to a ping.
    Pong,

    /// The node does not run the cache.
    CacheNotRunning(String),
}

impl NodeResponse {
    /// Build a stats response.
    pub fn stats(stats: &CacheStats) -> Self {
        NodeResponse::Stats {
            entry_count: stats.entry_count,
            hits: stats.hits,
            misses: stats.misses,
            writes: stats.writes,
            removals: stats.removals,
        }
    }
}

/// Handler for requests addressed to one node.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a request and produce its response.
    fn handle(&self, request: NodeRequest) -> NodeResponse;
}

/// Encode a message for the wire.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, NetworkError> {
    bincode::serialize(msg).map_err(|e| NetworkError::Serialization(e.to_string()))
}

/// Decode a message from the wire.
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, NetworkError> {
    bincode::deserialize(data).map_err(|e| NetworkError::Serialization(e.to_string()))
}
