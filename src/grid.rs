//! In-process data grid.
//!
//! A [`DataGrid`] hosts every member of a cluster in one process, connected
//! by a [`LocalTransport`]. Each cache has one [`ClusterTopologyManager`]
//! shared by all members; each member has its own containers, metrics and
//! request dispatcher and may expose a client endpoint.
//!
//! Members joined with a capacity factor of zero own no segments. Members
//! without a client endpoint are storage-only from a client's point of view.

use crate::cache::{
    CacheStore, ConfiguredStore, GridCache, InMemoryStore, KeyLocks, NodeContainers,
};
use crate::cluster::{ClusterTopologyManager, LoggingTopologyListener, ViewChange, ViewChangeKind};
use crate::config::{CacheConfig, GridConfig};
use crate::error::{Error, Result, TopologyError};
use crate::metrics::GridMetrics;
use crate::network::{ClusterTransport, LocalTransport};
use crate::rebalancing::RehashCoordinator;
use crate::server::{ClientIntelligenceNegotiator, GridServer, RequestDispatcher};
use crate::types::NodeAddress;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Cluster-wide state of one cache.
struct CacheRuntime {
    name: String,
    config: CacheConfig,
    manager: Arc<ClusterTopologyManager>,
    locks: Arc<KeyLocks>,
    store: Option<ConfiguredStore>,
}

impl CacheRuntime {
    fn handle(&self, node: &NodeAddress, transport: Arc<dyn ClusterTransport>) -> GridCache {
        let mut cache = GridCache::new(
            node.clone(),
            self.manager.clone(),
            transport,
            self.locks.clone(),
        )
        .with_default_lifespan(self.config.default_lifespan)
        .with_retry_policy(self.config.rehash.clone());
        if let Some(store) = &self.store {
            cache = cache.with_store(store.clone());
        }
        cache
    }
}

/// One member of the grid.
pub struct GridNode {
    address: NodeAddress,
    containers: Arc<NodeContainers>,
    dispatcher: Arc<RequestDispatcher>,
    metrics: Arc<GridMetrics>,
    server: Mutex<Option<Arc<GridServer>>>,
}

impl GridNode {
    /// Address of the member.
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    /// This member's handle on a cache.
    pub fn cache(&self, name: &str) -> Option<GridCache> {
        self.dispatcher.cache(name)
    }

    /// Data containers of the member.
    pub fn containers(&self) -> &Arc<NodeContainers> {
        &self.containers
    }

    /// Request dispatcher of the member.
    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    /// Metrics of the member.
    pub fn metrics(&self) -> &Arc<GridMetrics> {
        &self.metrics
    }

    /// Client endpoint, if the member serves clients.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|s| s.local_addr())
    }

    async fn stop_server(&self) {
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.shutdown().await;
        }
    }
}

impl std::fmt::Debug for GridNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridNode")
            .field("address", &self.address)
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

/// A cluster of grid members living in one process.
pub struct DataGrid {
    config: GridConfig,
    transport: Arc<LocalTransport>,
    negotiator: Arc<ClientIntelligenceNegotiator>,
    caches: BTreeMap<String, CacheRuntime>,
    nodes: RwLock<BTreeMap<NodeAddress, Arc<GridNode>>>,
    view: Mutex<ViewChange>,
    membership: tokio::sync::Mutex<()>,
}

impl DataGrid {
    /// Start a grid with the given initial members. Caches configured with
    /// a store get an in-memory one.
    pub async fn start(config: GridConfig, members: Vec<NodeAddress>) -> Result<Self> {
        let initial = ViewChange::new(1, members, ViewChangeKind::Join);
        Self::start_with_stores(config, initial, HashMap::new()).await
    }

    /// Start a grid from an initial view, backing caches with the given
    /// stores.
    pub async fn start_with_stores(
        config: GridConfig,
        initial: ViewChange,
        mut stores: HashMap<String, Arc<dyn CacheStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(LocalTransport::new());
        let dyn_transport: Arc<dyn ClusterTransport> = transport.clone();
        let negotiator = Arc::new(ClientIntelligenceNegotiator::new());

        // Containers first: the initial topology may be read right away.
        let mut containers = Vec::new();
        for member in &initial.members {
            let node_containers = Arc::new(NodeContainers::new(member.clone()));
            for (name, cache) in &config.caches {
                node_containers.start_cache(name, cache.hash.num_segments);
            }
            transport.register(member.clone(), node_containers.clone());
            containers.push(node_containers);
        }

        let mut caches = BTreeMap::new();
        for (name, cache_config) in &config.caches {
            let coordinator = RehashCoordinator::new(
                name.as_str(),
                dyn_transport.clone(),
                cache_config.rehash.clone(),
            );
            let manager = Arc::new(ClusterTopologyManager::start(
                name.as_str(),
                cache_config.hash,
                coordinator,
                initial.clone(),
            )?);
            negotiator.register_cache(
                name,
                &manager.current_topology(),
                cache_config.hash.virtual_nodes,
            );
            manager.add_listener(negotiator.clone());
            manager.add_listener(Arc::new(LoggingTopologyListener));

            let store = match &cache_config.store {
                Some(store_config) => {
                    let store: Arc<dyn CacheStore> = match stores.remove(name) {
                        Some(store) => store,
                        None => Arc::new(InMemoryStore::new()),
                    };
                    Some(ConfiguredStore::open(store, store_config.clone()).await?)
                }
                None => None,
            };
            caches.insert(
                name.clone(),
                CacheRuntime {
                    name: name.clone(),
                    config: cache_config.clone(),
                    manager,
                    locks: Arc::new(KeyLocks::default()),
                    store,
                },
            );
        }
        for name in stores.keys() {
            warn!(cache = %name, "Store given for a cache without store configuration");
        }

        let grid = Self {
            config,
            transport,
            negotiator,
            caches,
            nodes: RwLock::new(BTreeMap::new()),
            view: Mutex::new(initial),
            membership: tokio::sync::Mutex::new(()),
        };
        for node_containers in containers {
            grid.add_node(node_containers);
        }
        info!(
            members = grid.members().len(),
            caches = grid.caches.len(),
            "Data grid started"
        );
        Ok(grid)
    }

    fn add_node(&self, containers: Arc<NodeContainers>) -> Arc<GridNode> {
        let address = containers.local_node().clone();
        let metrics = Arc::new(GridMetrics::for_node(address.clone()));
        let dispatcher = Arc::new(RequestDispatcher::new(
            self.config.server.default_cache.clone(),
            self.config.server.version.clone(),
            self.negotiator.clone(),
            metrics.clone(),
        ));
        let transport: Arc<dyn ClusterTransport> = self.transport.clone();
        for runtime in self.caches.values() {
            dispatcher.register_cache(runtime.handle(&address, transport.clone()));
            runtime.manager.add_listener(metrics.clone());
        }

        let node = Arc::new(GridNode {
            address: address.clone(),
            containers,
            dispatcher,
            metrics,
            server: Mutex::new(None),
        });
        self.nodes.write().insert(address, node.clone());
        node
    }

    // ==================== Membership ====================

    /// Add a member with capacity factor 1.
    pub async fn join(&self, node: NodeAddress) -> Result<Arc<GridNode>> {
        self.join_with_capacity(node, 1.0).await
    }

    /// Add a member. A factor of zero makes it own no segments.
    pub async fn join_with_capacity(
        &self,
        node: NodeAddress,
        capacity: f32,
    ) -> Result<Arc<GridNode>> {
        let _membership = self.membership.lock().await;
        if self.nodes.read().contains_key(&node) {
            return Err(TopologyError::Conflict(format!("{} is already a member", node)).into());
        }

        let containers = Arc::new(NodeContainers::new(node.clone()));
        for (name, cache) in &self.config.caches {
            containers.start_cache(name, cache.hash.num_segments);
        }
        self.transport.register(node.clone(), containers.clone());
        let grid_node = self.add_node(containers);

        let view = {
            let mut view = self.view.lock();
            let mut members = view.members.clone();
            members.push(node.clone());
            let mut next = ViewChange::new(view.view_id + 1, members, ViewChangeKind::Join);
            next.capacities = view.capacities.clone();
            next = next.with_capacity(node.clone(), capacity);
            *view = next.clone();
            next
        };
        info!(node = %node, capacity, view_id = view.view_id, "Member joining");
        self.deliver(view).await?;
        Ok(grid_node)
    }

    /// Remove a member. Its data is dropped; surviving owners restore
    /// redundancy.
    pub async fn leave(&self, node: &NodeAddress) -> Result<()> {
        let _membership = self.membership.lock().await;
        let removed = self.nodes.write().remove(node);
        let Some(removed) = removed else {
            return Err(TopologyError::Conflict(format!("{} is not a member", node)).into());
        };

        removed.stop_server().await;
        self.negotiator.unregister_endpoint(node);
        self.transport.unregister(node);

        let view = {
            let mut view = self.view.lock();
            let next = view.without(std::slice::from_ref(node), view.view_id + 1);
            let next = ViewChange {
                kind: ViewChangeKind::Leave,
                ..next
            };
            *view = next.clone();
            next
        };
        info!(node = %node, view_id = view.view_id, "Member leaving");
        self.deliver(view).await
    }

    async fn deliver(&self, view: ViewChange) -> Result<()> {
        for runtime in self.caches.values() {
            runtime.manager.membership_changed(view.clone()).await?;
        }
        Ok(())
    }

    /// Wait until no cache has a rehash in flight.
    pub async fn await_stable(&self) -> Result<()> {
        for runtime in self.caches.values() {
            runtime.manager.await_stable().await?;
        }
        Ok(())
    }

    // ==================== Client endpoints ====================

    /// Serve clients for `node` on `addr` (port 0 picks a free port).
    pub async fn start_server(&self, node: &NodeAddress, addr: SocketAddr) -> Result<SocketAddr> {
        let grid_node = self
            .node(node)
            .ok_or_else(|| TopologyError::Conflict(format!("{} is not a member", node)))?;
        if let Some(endpoint) = grid_node.endpoint() {
            return Ok(endpoint);
        }

        let server = GridServer::bind(
            addr,
            self.config.protocol.clone(),
            grid_node.dispatcher.clone(),
        )
        .await?;
        let local_addr = server.local_addr();
        *grid_node.server.lock() = Some(Arc::new(server));
        self.negotiator.register_endpoint(node.clone(), local_addr);
        Ok(local_addr)
    }

    /// Serve clients for `node` on the configured bind address.
    pub async fn start_configured_server(&self, node: &NodeAddress) -> Result<SocketAddr> {
        self.start_server(node, self.config.server.bind_addr).await
    }

    /// Stop serving clients for `node`.
    pub async fn stop_server(&self, node: &NodeAddress) {
        if let Some(grid_node) = self.node(node) {
            grid_node.stop_server().await;
            self.negotiator.unregister_endpoint(node);
        }
    }

    // ==================== Accessors ====================

    /// Grid configuration.
    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// A member.
    pub fn node(&self, node: &NodeAddress) -> Option<Arc<GridNode>> {
        self.nodes.read().get(node).cloned()
    }

    /// Current members, in view order.
    pub fn members(&self) -> Vec<NodeAddress> {
        self.view.lock().members.clone()
    }

    /// Latest membership view.
    pub fn view(&self) -> ViewChange {
        self.view.lock().clone()
    }

    /// A member's handle on a cache.
    pub fn cache(&self, node: &NodeAddress, name: &str) -> Result<GridCache> {
        self.node(node)
            .and_then(|n| n.cache(name))
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))
    }

    /// Topology manager of a cache.
    pub fn manager(&self, name: &str) -> Option<Arc<ClusterTopologyManager>> {
        self.caches.get(name).map(|c| c.manager.clone())
    }

    /// Names of the configured caches.
    pub fn cache_names(&self) -> Vec<String> {
        self.caches.values().map(|c| c.name.clone()).collect()
    }

    /// Node-to-node transport.
    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    /// Topology push state shared by every endpoint.
    pub fn negotiator(&self) -> &Arc<ClientIntelligenceNegotiator> {
        &self.negotiator
    }

    /// Stop every endpoint and topology manager.
    pub async fn shutdown(&self) {
        let nodes: Vec<Arc<GridNode>> = self.nodes.read().values().cloned().collect();
        for node in nodes {
            node.stop_server().await;
        }
        for runtime in self.caches.values() {
            runtime.manager.shutdown().await;
        }
        info!("Data grid stopped");
    }
}

impl std::fmt::Debug for DataGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataGrid")
            .field("members", &self.members())
            .field("caches", &self.cache_names())
            .finish()
    }
}
