//! Cache instances.
//!
//! Every node runs a [`DataContainer`] per cache, reachable by other nodes
//! through [`NodeContainers`]. A [`GridCache`] is one node's entry point to a
//! cache: it routes each operation to the owners of the key's segment using
//! the topology manager's routing view.
//!
//! Conditional commands run on the first write owner, which decides the
//! result; the state it produced is then installed on the remaining owners.
//! While a segment is being transferred the write owners include both the old
//! holders and the new owners.

pub mod container;
pub mod store;

pub use container::DataContainer;
pub use store::{CacheStore, ConfiguredStore, InMemoryStore, StoreResult};

use crate::cluster::ClusterTopologyManager;
use crate::config::RehashConfig;
use crate::error::{Error, NetworkError, Result, RoutingError};
use crate::network::{ClusterTransport, MessageHandler, NodeRequest, NodeResponse};
use crate::partitioning::key_hash;
use crate::types::{
    CacheEntry, CacheStats, EntryMetadata, NodeAddress, SegmentId, WriteCommand, WriteResult,
};
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Default number of key lock stripes.
pub const DEFAULT_LOCK_STRIPES: usize = 256;

/// Data containers of the caches running on one node.
///
/// Serves the node's side of [`NodeRequest`]s.
pub struct NodeContainers {
    local: NodeAddress,
    containers: DashMap<String, Arc<DataContainer>>,
}

impl NodeContainers {
    /// Create an empty registry for `local`.
    pub fn new(local: NodeAddress) -> Self {
        Self {
            local,
            containers: DashMap::new(),
        }
    }

    /// Address of the node.
    pub fn local_node(&self) -> &NodeAddress {
        &self.local
    }

    /// Start a cache, or return its container if it already runs.
    pub fn start_cache(&self, name: &str, num_segments: u32) -> Arc<DataContainer> {
        self.containers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(node = %self.local, cache = name, "Starting cache container");
                Arc::new(DataContainer::new(num_segments))
            })
            .clone()
    }

    /// Stop a cache, dropping its data. Returns whether it was running.
    pub fn stop_cache(&self, name: &str) -> bool {
        self.containers.remove(name).is_some()
    }

    /// Container of a running cache.
    pub fn container(&self, name: &str) -> Option<Arc<DataContainer>> {
        self.containers.get(name).map(|c| c.clone())
    }

    /// Names of the running caches.
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn with_container(
        &self,
        cache: String,
        f: impl FnOnce(&DataContainer) -> NodeResponse,
    ) -> NodeResponse {
        match self.container(&cache) {
            Some(container) => f(&container),
            None => NodeResponse::CacheNotRunning(cache),
        }
    }
}

impl MessageHandler for NodeContainers {
    fn handle(&self, request: NodeRequest) -> NodeResponse {
        match request {
            NodeRequest::Ping => NodeResponse::Pong,
            NodeRequest::Execute { cache, command } => {
                self.with_container(cache, |c| NodeResponse::Outcome(c.execute(command)))
            }
            NodeRequest::Read { cache, key } => {
                self.with_container(cache, |c| NodeResponse::Entry(c.get(&key)))
            }
            NodeRequest::FetchSegment { cache, segment } => self.with_container(cache, |c| {
                NodeResponse::Entries(c.segment_entries(segment))
            }),
            NodeRequest::PushBatch { cache, batch } => self.with_container(cache, |c| {
                NodeResponse::Count(c.apply_transfer(&batch) as u64)
            }),
            NodeRequest::BeginInbound { cache, segment } => self.with_container(cache, |c| {
                c.begin_inbound(segment);
                NodeResponse::Ack
            }),
            NodeRequest::EndInbound { cache, segment } => self.with_container(cache, |c| {
                c.end_inbound(segment);
                NodeResponse::Ack
            }),
            NodeRequest::PurgeSegment { cache, segment } => self.with_container(cache, |c| {
                NodeResponse::Count(c.purge_segment(segment) as u64)
            }),
            NodeRequest::Clear { cache } => {
                self.with_container(cache, |c| NodeResponse::Count(c.clear() as u64))
            }
            NodeRequest::Stats { cache } => {
                self.with_container(cache, |c| NodeResponse::stats(&c.stats()))
            }
        }
    }
}

impl std::fmt::Debug for NodeContainers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContainers")
            .field("local", &self.local)
            .field("caches", &self.cache_names())
            .finish()
    }
}

/// Striped per-key locks serializing writes to the same key.
///
/// One instance is shared by every node's handle on a cache.
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    /// Create `stripes` lock stripes.
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Lock the stripe of `key`.
    pub async fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        let index = (key_hash(key) % self.stripes.len() as u64) as usize;
        self.stripes[index].lock().await
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_STRIPES)
    }
}

impl std::fmt::Debug for KeyLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLocks")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}

/// One node's handle on a clustered cache.
#[derive(Clone)]
pub struct GridCache {
    name: Arc<str>,
    local: NodeAddress,
    manager: Arc<ClusterTopologyManager>,
    transport: Arc<dyn ClusterTransport>,
    locks: Arc<KeyLocks>,
    store: Option<ConfiguredStore>,
    default_lifespan: Option<Duration>,
    retry: RehashConfig,
}

impl GridCache {
    /// Create a handle for `local` on the cache managed by `manager`.
    pub fn new(
        local: NodeAddress,
        manager: Arc<ClusterTopologyManager>,
        transport: Arc<dyn ClusterTransport>,
        locks: Arc<KeyLocks>,
    ) -> Self {
        Self {
            name: Arc::from(manager.cache_name()),
            local,
            manager,
            transport,
            locks,
            store: None,
            default_lifespan: None,
            retry: RehashConfig::default(),
        }
    }

    /// Back the cache with a store.
    pub fn with_store(mut self, store: ConfiguredStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Apply a lifespan to writes that carry none.
    pub fn with_default_lifespan(mut self, lifespan: Option<Duration>) -> Self {
        self.default_lifespan = lifespan;
        self
    }

    /// Retry replication to the other owners with the given policy.
    pub fn with_retry_policy(mut self, retry: RehashConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node this handle runs on.
    pub fn local_node(&self) -> &NodeAddress {
        &self.local
    }

    /// Topology manager of the cache.
    pub fn manager(&self) -> &Arc<ClusterTopologyManager> {
        &self.manager
    }

    // ==================== Reads ====================

    /// Read an entry from the owner serving reads for its segment, falling
    /// back to the store on a miss.
    pub async fn get(&self, key: &[u8]) -> Result<Option<CacheEntry>> {
        let key = Bytes::copy_from_slice(key);
        let segment = self.manager.routing_view().segment_of(&key);

        let entry = {
            let gates = self.manager.routing_view().gates.clone();
            let _gate = gates.read(segment).await;
            let route = self.manager.routing_view().route(segment);
            let owner = route.read_owner.ok_or(RoutingError::NoOwners(segment))?;
            self.transport.read(&owner, &self.name, key.clone()).await?
        };

        if entry.is_some() || self.store.is_none() {
            return Ok(entry);
        }
        self.read_through(key, segment).await
    }

    /// Whether a key is present.
    pub async fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn read_through(&self, key: Bytes, segment: SegmentId) -> Result<Option<CacheEntry>> {
        let _key_lock = self.locks.lock(&key).await;
        let gates = self.manager.routing_view().gates.clone();
        let _gate = gates.read(segment).await;
        let route = self.manager.routing_view().route(segment);

        self.load_into(&key, &route.write_owners).await?;
        let owner = route.read_owner.ok_or(RoutingError::NoOwners(segment))?;
        Ok(self.transport.read(&owner, &self.name, key).await?)
    }

    /// Install the stored entry of `key` on `owners` unless the first one
    /// already has it.
    async fn load_into(&self, key: &Bytes, owners: &[NodeAddress]) -> Result<()> {
        let (Some(store), Some(first)) = (&self.store, owners.first()) else {
            return Ok(());
        };
        if self
            .transport
            .read(first, &self.name, key.clone())
            .await?
            .is_some()
        {
            return Ok(());
        }
        let Some(entry) = store.load(key).await? else {
            return Ok(());
        };

        debug!(cache = %self.name, "Loaded entry from store");
        let apply = WriteCommand::Apply {
            key: key.clone(),
            entry: Some(entry),
        };
        for owner in owners {
            self.transport
                .execute(owner, &self.name, apply.clone())
                .await?;
        }
        Ok(())
    }

    // ==================== Writes ====================

    /// Execute a write command on the owners of its key.
    pub async fn write(&self, command: WriteCommand) -> Result<WriteResult> {
        let command = self.with_lifespan(command);
        let key = command.key().clone();
        let segment = self.manager.routing_view().segment_of(&key);

        let _key_lock = self.locks.lock(&key).await;
        let gates = self.manager.routing_view().gates.clone();
        let _gate = gates.read(segment).await;
        let route = self.manager.routing_view().route(segment);
        let (first, rest) = route
            .write_owners
            .split_first()
            .ok_or(RoutingError::NoOwners(segment))?;

        if needs_existing(&command) {
            self.load_into(&key, &route.write_owners).await?;
        }

        let outcome = self.transport.execute(first, &self.name, command).await?;
        let Some(apply) = outcome.change.into_apply(key) else {
            return Ok(outcome.result);
        };

        for owner in rest {
            if let Err(e) = self.replicate(owner, &apply).await {
                warn!(
                    cache = %self.name,
                    owner = %owner,
                    segment,
                    error = %e,
                    "Failed to replicate write"
                );
                return Err(e);
            }
        }

        if let (Some(store), WriteCommand::Apply { key, entry }) = (&self.store, apply) {
            store.write(key, entry).await?;
        }
        Ok(outcome.result)
    }

    /// Install the state produced by the first owner on another owner,
    /// retrying with the cache's backoff policy.
    async fn replicate(&self, owner: &NodeAddress, apply: &WriteCommand) -> Result<()> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last = Error::Network(NetworkError::NodeUnreachable(owner.clone()));
        for attempt in 1..=max_attempts {
            let call = self.transport.execute(owner, &self.name, apply.clone());
            match tokio::time::timeout(self.retry.transfer_timeout, call).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => {
                    debug!(cache = %self.name, %owner, attempt, error = %e, "Replication attempt failed");
                    last = e.into();
                }
                Err(_) => {
                    debug!(cache = %self.name, %owner, attempt, "Replication attempt timed out");
                    last = Error::Timeout;
                }
            }

            if attempt < max_attempts {
                let backoff = self.retry.backoff_for(attempt);
                let jitter = {
                    let max = (backoff.as_millis() as u64 / 10).max(1);
                    Duration::from_millis(rand::rng().random_range(0..=max))
                };
                tokio::time::sleep(backoff + jitter).await;
            }
        }
        Err(last)
    }

    /// Store a value.
    pub async fn put(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        metadata: EntryMetadata,
    ) -> Result<WriteResult> {
        self.write(WriteCommand::Put {
            key: key.into(),
            value: value.into(),
            metadata,
        })
        .await
    }

    /// Store a value only if the key is absent.
    pub async fn put_if_absent(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        metadata: EntryMetadata,
    ) -> Result<WriteResult> {
        self.write(WriteCommand::PutIfAbsent {
            key: key.into(),
            value: value.into(),
            metadata,
        })
        .await
    }

    /// Store a value only if the key is present.
    pub async fn replace(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        metadata: EntryMetadata,
    ) -> Result<WriteResult> {
        self.write(WriteCommand::Replace {
            key: key.into(),
            value: value.into(),
            metadata,
        })
        .await
    }

    /// Append to an existing value.
    pub async fn append(&self, key: impl Into<Bytes>, data: impl Into<Bytes>) -> Result<WriteResult> {
        self.write(WriteCommand::Append {
            key: key.into(),
            data: data.into(),
        })
        .await
    }

    /// Prepend to an existing value.
    pub async fn prepend(
        &self,
        key: impl Into<Bytes>,
        data: impl Into<Bytes>,
    ) -> Result<WriteResult> {
        self.write(WriteCommand::Prepend {
            key: key.into(),
            data: data.into(),
        })
        .await
    }

    /// Remove a key.
    pub async fn remove(&self, key: impl Into<Bytes>) -> Result<WriteResult> {
        self.write(WriteCommand::Remove { key: key.into() }).await
    }

    /// Add to a decimal counter.
    pub async fn increment(&self, key: impl Into<Bytes>, delta: u64) -> Result<WriteResult> {
        self.write(WriteCommand::Increment {
            key: key.into(),
            delta,
        })
        .await
    }

    /// Subtract from a decimal counter, saturating at zero.
    pub async fn decrement(&self, key: impl Into<Bytes>, delta: u64) -> Result<WriteResult> {
        self.write(WriteCommand::Decrement {
            key: key.into(),
            delta,
        })
        .await
    }

    /// Remove every entry on every member, and from the store.
    pub async fn clear(&self) -> Result<u64> {
        let members = self.manager.routing_view().members_with_data();

        let mut removed = 0;
        for member in &members {
            removed += self.transport.clear(member, &self.name).await?;
        }
        if let Some(store) = &self.store {
            store.clear().await?;
        }
        info!(cache = %self.name, removed, "Cache cleared");
        Ok(removed)
    }

    /// Statistics of the local container.
    pub async fn stats(&self) -> Result<CacheStats> {
        Ok(self.transport.stats(&self.local, &self.name).await?)
    }

    fn with_lifespan(&self, command: WriteCommand) -> WriteCommand {
        let Some(lifespan) = self.default_lifespan else {
            return command;
        };
        let fill = |metadata: EntryMetadata| {
            if metadata.lifespan_ms.is_some() {
                metadata
            } else {
                metadata.lifespan(lifespan)
            }
        };
        match command {
            WriteCommand::Put {
                key,
                value,
                metadata,
            } => WriteCommand::Put {
                key,
                value,
                metadata: fill(metadata),
            },
            WriteCommand::PutIfAbsent {
                key,
                value,
                metadata,
            } => WriteCommand::PutIfAbsent {
                key,
                value,
                metadata: fill(metadata),
            },
            WriteCommand::Replace {
                key,
                value,
                metadata,
            } => WriteCommand::Replace {
                key,
                value,
                metadata: fill(metadata),
            },
            other => other,
        }
    }
}

/// Whether a command's result depends on the current value.
fn needs_existing(command: &WriteCommand) -> bool {
    !matches!(
        command,
        WriteCommand::Put { .. } | WriteCommand::Apply { .. }
    )
}

impl std::fmt::Debug for GridCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridCache")
            .field("name", &self.name)
            .field("local", &self.local)
            .field("topology_id", &self.manager.current_topology().topology_id)
            .field("store", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ViewChange, ViewChangeKind};
    use crate::config::{HashConfig, RehashConfig, StoreConfig};
    use crate::network::LocalTransport;
    use crate::rebalancing::RehashCoordinator;

    const CACHE: &str = "default";

    struct Fixture {
        transport: Arc<LocalTransport>,
        containers: Vec<Arc<NodeContainers>>,
        caches: Vec<GridCache>,
    }

    async fn fixture(names: &[&str], num_owners: u32) -> Fixture {
        let transport = Arc::new(LocalTransport::new());
        let members: Vec<NodeAddress> = names.iter().map(|n| NodeAddress::new(n)).collect();
        let mut containers = Vec::new();
        for member in &members {
            let node = Arc::new(NodeContainers::new(member.clone()));
            node.start_cache(CACHE, 8);
            transport.register(member.clone(), node.clone());
            containers.push(node);
        }

        let coordinator =
            RehashCoordinator::new(CACHE, transport.clone(), RehashConfig::default());
        let manager = Arc::new(
            ClusterTopologyManager::start(
                CACHE,
                HashConfig::new(8, num_owners),
                coordinator,
                ViewChange::new(1, members.clone(), ViewChangeKind::Join),
            )
            .unwrap(),
        );
        let locks = Arc::new(KeyLocks::default());
        let caches = members
            .iter()
            .map(|m| GridCache::new(m.clone(), manager.clone(), transport.clone(), locks.clone()))
            .collect();
        Fixture {
            transport,
            containers,
            caches,
        }
    }

    #[tokio::test]
    async fn test_put_get_across_nodes() {
        let f = fixture(&["a", "b", "c"], 2).await;

        let result = f.caches[0]
            .put("key", "value", EntryMetadata::with_flags(5))
            .await
            .unwrap();
        assert_eq!(result, WriteResult::Stored);

        let entry = f.caches[2].get(b"key").await.unwrap().unwrap();
        assert_eq!(entry.value, "value");
        assert_eq!(entry.metadata.flags, 5);

        let holders = f
            .containers
            .iter()
            .filter(|c| c.container(CACHE).unwrap().peek(b"key").is_some())
            .count();
        assert_eq!(holders, 2);
    }

    #[tokio::test]
    async fn test_conditional_writes_replicate_state() {
        let f = fixture(&["a", "b"], 2).await;
        let cache = &f.caches[1];

        assert_eq!(
            cache.put_if_absent("n", "10", EntryMetadata::default()).await.unwrap(),
            WriteResult::Stored
        );
        assert_eq!(
            cache.put_if_absent("n", "11", EntryMetadata::default()).await.unwrap(),
            WriteResult::NotStored
        );
        assert_eq!(cache.increment("n", 5).await.unwrap(), WriteResult::Counter(15));
        assert_eq!(cache.decrement("n", 20).await.unwrap(), WriteResult::Counter(0));

        for node in &f.containers {
            let entry = node.container(CACHE).unwrap().peek(b"n").unwrap();
            assert_eq!(entry.value, "0");
        }

        assert_eq!(cache.remove("n").await.unwrap(), WriteResult::Removed);
        assert_eq!(cache.remove("n").await.unwrap(), WriteResult::NotFound);
        assert!(!f.caches[0].contains_key(b"n").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_replication_fails_the_write() {
        let f = fixture(&["a", "b"], 2).await;
        let cache = f.caches[0]
            .clone()
            .with_retry_policy(RehashConfig::default().with_retry(3, Duration::from_millis(1)));
        let a = NodeAddress::new("a");
        let b = NodeAddress::new("b");
        let key = (0..100)
            .map(|i| format!("k{}", i))
            .find(|k| cache.manager().current_topology().hash.locate_owners(k.as_bytes())[0] == a)
            .unwrap();

        f.transport.unregister(&b);
        let err = cache.put(key.clone(), "v", EntryMetadata::default()).await.unwrap_err();
        assert!(err.is_retryable(), "{:?}", err);

        f.transport.register(b.clone(), f.containers[1].clone());
        assert_eq!(
            cache.put(key.clone(), "v", EntryMetadata::default()).await.unwrap(),
            WriteResult::Stored
        );
        let backup = f.containers[1].container(CACHE).unwrap();
        assert_eq!(backup.peek(key.as_bytes()).unwrap().value, "v");
    }

    #[tokio::test]
    async fn test_append_and_replace() {
        let f = fixture(&["a"], 1).await;
        let cache = &f.caches[0];

        assert_eq!(
            cache.replace("k", "v", EntryMetadata::default()).await.unwrap(),
            WriteResult::NotStored
        );
        cache.put("k", "mid", EntryMetadata::default()).await.unwrap();
        cache.append("k", "-end").await.unwrap();
        cache.prepend("k", "start-").await.unwrap();

        let entry = cache.get(b"k").await.unwrap().unwrap();
        assert_eq!(entry.value, "start-mid-end");
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let f = fixture(&["a", "b"], 1).await;
        for i in 0..10 {
            f.caches[0]
                .put(format!("k{}", i), "v", EntryMetadata::default())
                .await
                .unwrap();
        }

        let local = f.caches[0].stats().await.unwrap().entry_count
            + f.caches[1].stats().await.unwrap().entry_count;
        assert_eq!(local, 10);

        assert_eq!(f.caches[1].clear().await.unwrap(), 10);
        assert_eq!(f.caches[0].stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_store_write_and_read_through() {
        let f = fixture(&["a", "b"], 1).await;
        let store = Arc::new(InMemoryStore::new());
        let configured = ConfiguredStore::open(store.clone(), StoreConfig::default())
            .await
            .unwrap();
        let cache = f.caches[0].clone().with_store(configured);

        cache.put("k", "v", EntryMetadata::default()).await.unwrap();
        assert_eq!(store.load(b"k").await.unwrap().unwrap().value, "v");

        // Drop the in-memory copy; the next read loads it back.
        for node in &f.containers {
            node.container(CACHE).unwrap().clear();
        }
        assert_eq!(cache.get(b"k").await.unwrap().unwrap().value, "v");

        cache.remove("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_default_lifespan() {
        let f = fixture(&["a"], 1).await;
        let cache = f.caches[0]
            .clone()
            .with_default_lifespan(Some(Duration::from_secs(60)));

        cache.put("k", "v", EntryMetadata::default()).await.unwrap();
        let entry = cache.get(b"k").await.unwrap().unwrap();
        assert_eq!(entry.metadata.lifespan_ms, Some(60_000));
    }

    #[test]
    fn test_node_containers_unknown_cache() {
        let node = NodeContainers::new(NodeAddress::new("a"));
        let response = node.handle(NodeRequest::Stats {
            cache: "missing".to_string(),
        });
        assert_eq!(response, NodeResponse::CacheNotRunning("missing".to_string()));
        assert_eq!(node.handle(NodeRequest::Ping), NodeResponse::Pong);
    }
}
