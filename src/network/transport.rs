//! Node-to-node transport.
//!
//! [`ClusterTransport`] carries [`NodeRequest`]s to cluster members. The
//! typed helpers on the trait are what the cache and the rehash coordinator
//! call. [`LocalTransport`] connects nodes living in the same process and
//! still round-trips every message through the wire encoding.

use crate::error::NetworkError;
use crate::network::rpc::{decode_message, encode_message, MessageHandler, NodeRequest, NodeResponse};
use crate::rebalancing::{TransferBatch, TransferEntry};
use crate::types::{CacheEntry, CacheStats, NodeAddress, SegmentId, WriteCommand, WriteOutcome};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

fn unexpected(target: &NodeAddress, response: NodeResponse) -> NetworkError {
    match response {
        NodeResponse::CacheNotRunning(cache) => NetworkError::CacheNotRunning {
            node: target.clone(),
            cache,
        },
        other => NetworkError::Serialization(format!("unexpected response {:?}", other)),
    }
}

/// Transport between cluster members.
#[async_trait]
pub trait ClusterTransport: Send + Sync + 'static {
    /// Deliver a request to `target` and wait for its response.
    async fn send(
        &self,
        target: &NodeAddress,
        request: NodeRequest,
    ) -> Result<NodeResponse, NetworkError>;

    /// Execute a write command on `target`.
    async fn execute(
        &self,
        target: &NodeAddress,
        cache: &str,
        command: WriteCommand,
    ) -> Result<WriteOutcome, NetworkError> {
        let request = NodeRequest::Execute {
            cache: cache.to_string(),
            command,
        };
        match self.send(target, request).await? {
            NodeResponse::Outcome(outcome) => Ok(outcome),
            other => Err(unexpected(target, other)),
        }
    }

    /// Read a key on `target`.
    async fn read(
        &self,
        target: &NodeAddress,
        cache: &str,
        key: Bytes,
    ) -> Result<Option<CacheEntry>, NetworkError> {
        let request = NodeRequest::Read {
            cache: cache.to_string(),
            key,
        };
        match self.send(target, request).await? {
            NodeResponse::Entry(entry) => Ok(entry),
            other => Err(unexpected(target, other)),
        }
    }

    /// Snapshot a segment on `target`.
    async fn fetch_segment(
        &self,
        target: &NodeAddress,
        cache: &str,
        segment: SegmentId,
    ) -> Result<Vec<TransferEntry>, NetworkError> {
        let request = NodeRequest::FetchSegment {
            cache: cache.to_string(),
            segment,
        };
        match self.send(target, request).await? {
            NodeResponse::Entries(entries) => Ok(entries),
            other => Err(unexpected(target, other)),
        }
    }

    /// Push a batch to `target`. Returns the number of entries installed.
    async fn push_batch(
        &self,
        target: &NodeAddress,
        cache: &str,
        batch: TransferBatch,
    ) -> Result<u64, NetworkError> {
        let request = NodeRequest::PushBatch {
            cache: cache.to_string(),
            batch,
        };
        match self.send(target, request).await? {
            NodeResponse::Count(n) => Ok(n),
            other => Err(unexpected(target, other)),
        }
    }

    /// Open inbound tracking for a segment on `target`.
    async fn begin_inbound(
        &self,
        target: &NodeAddress,
        cache: &str,
        segment: SegmentId,
    ) -> Result<(), NetworkError> {
        let request = NodeRequest::BeginInbound {
            cache: cache.to_string(),
            segment,
        };
        match self.send(target, request).await? {
            NodeResponse::Ack => Ok(()),
            other => Err(unexpected(target, other)),
        }
    }

    /// Close inbound tracking for a segment on `target`.
    async fn end_inbound(
        &self,
        target: &NodeAddress,
        cache: &str,
        segment: SegmentId,
    ) -> Result<(), NetworkError> {
        let request = NodeRequest::EndInbound {
            cache: cache.to_string(),
            segment,
        };
        match self.send(target, request).await? {
            NodeResponse::Ack => Ok(()),
            other => Err(unexpected(target, other)),
        }
    }

    /// Drop a segment on `target`. Returns the number of entries removed.
    async fn purge_segment(
        &self,
        target: &NodeAddress,
        cache: &str,
        segment: SegmentId,
    ) -> Result<u64, NetworkError> {
        let request = NodeRequest::PurgeSegment {
            cache: cache.to_string(),
            segment,
        };
        match self.send(target, request).await? {
            NodeResponse::Count(n) => Ok(n),
            other => Err(unexpected(target, other)),
        }
    }

    /// Drop every entry of a cache on `target`.
    async fn clear(&self, target: &NodeAddress, cache: &str) -> Result<u64, NetworkError> {
        let request = NodeRequest::Clear {
            cache: cache.to_string(),
        };
        match self.send(target, request).await? {
            NodeResponse::Count(n) => Ok(n),
            other => Err(unexpected(target, other)),
        }
    }

    /// Local statistics of a cache on `target`.
    async fn stats(&self, target: &NodeAddress, cache: &str) -> Result<CacheStats, NetworkError> {
        let request = NodeRequest::Stats {
            cache: cache.to_string(),
        };
        match self.send(target, request).await? {
            NodeResponse::Stats {
                entry_count,
                hits,
                misses,
                writes,
                removals,
            } => Ok(CacheStats {
                entry_count,
                hits,
                misses,
                writes,
                removals,
            }),
            other => Err(unexpected(target, other)),
        }
    }
}

/// Hook consulted before a request is delivered.
///
/// Returning an error fails the request as if the network had.
#[async_trait]
pub trait TransportInterceptor: Send + Sync + 'static {
    /// Called before `request` is delivered to `target`.
    async fn before_send(
        &self,
        target: &NodeAddress,
        request: &NodeRequest,
    ) -> Result<(), NetworkError>;
}

/// Transport between nodes of the same process.
#[derive(Default)]
pub struct LocalTransport {
    handlers: DashMap<NodeAddress, Arc<dyn MessageHandler>>,
    interceptor: RwLock<Option<Arc<dyn TransportInterceptor>>>,
}

impl LocalTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node.
    pub fn register(&self, node: NodeAddress, handler: Arc<dyn MessageHandler>) {
        tracing::debug!(node = %node, "Registered node with local transport");
        self.handlers.insert(node, handler);
    }

    /// Detach a node. Later requests to it fail as unreachable.
    pub fn unregister(&self, node: &NodeAddress) {
        if self.handlers.remove(node).is_some() {
            tracing::debug!(node = %node, "Unregistered node from local transport");
        }
    }

    /// Whether a node is attached.
    pub fn is_registered(&self, node: &NodeAddress) -> bool {
        self.handlers.contains_key(node)
    }

    /// Install an interceptor, replacing any previous one.
    pub fn set_interceptor(&self, interceptor: Arc<dyn TransportInterceptor>) {
        *self.interceptor.write() = Some(interceptor);
    }

    /// Remove the interceptor.
    pub fn clear_interceptor(&self) {
        *self.interceptor.write() = None;
    }
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    async fn send(
        &self,
        target: &NodeAddress,
        request: NodeRequest,
    ) -> Result<NodeResponse, NetworkError> {
        let interceptor = self.interceptor.read().clone();
        if let Some(interceptor) = interceptor {
            interceptor.before_send(target, &request).await?;
        }

        let handler = self
            .handlers
            .get(target)
            .map(|h| h.value().clone())
            .ok_or_else(|| NetworkError::NodeUnreachable(target.clone()))?;

        let request: NodeRequest = decode_message(&encode_message(&request)?)?;
        let response = handler.handle(request);
        decode_message(&encode_message(&response)?)
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("nodes", &self.handlers.len())
            .field("intercepted", &self.interceptor.read().is_some())
            .finish()
    }
}
