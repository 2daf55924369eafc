//! Topology push to intelligent clients.
//!
//! Each cache has a client-visible topology: the endpoint-bearing servers of
//! its latest committed topology and, per segment, the indices of the owners
//! among them. A committed topology that leaves both unchanged keeps the
//! previous client-visible id, so clients are not sent a block that would
//! not change their routing. Storage-only members (no client endpoint) and
//! zero-capacity members can therefore come and go without a push.

use crate::cluster::{CacheTopology, TopologyListener};
use crate::partitioning::HASH_FUNCTION_XXH64;
use crate::protocol::TopologyUpdate;
use crate::types::{ClientIntelligence, NodeAddress, TopologyId};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Client endpoints of the members that serve clients.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<NodeAddress, SocketAddr>,
}

impl EndpointRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a member's client endpoint.
    pub fn register(&self, node: NodeAddress, addr: SocketAddr) {
        self.endpoints.insert(node, addr);
    }

    /// Forget a member's client endpoint.
    pub fn unregister(&self, node: &NodeAddress) -> Option<SocketAddr> {
        self.endpoints.remove(node).map(|(_, addr)| addr)
    }

    /// Client endpoint of a member.
    pub fn endpoint(&self, node: &NodeAddress) -> Option<SocketAddr> {
        self.endpoints.get(node).map(|e| *e.value())
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether no endpoint is registered.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Routing layout as clients see it.
#[derive(Debug, Clone, PartialEq)]
struct ClientLayout {
    servers: Vec<SocketAddr>,
    num_owners: u8,
    segment_owners: Vec<Vec<u32>>,
}

impl ClientLayout {
    fn of(topology: &CacheTopology, endpoints: &EndpointRegistry) -> Self {
        let mut servers = Vec::new();
        let mut index: HashMap<&NodeAddress, u32> = HashMap::new();
        for member in &topology.members {
            if let Some(addr) = endpoints.endpoint(member) {
                if !index.contains_key(member) {
                    index.insert(member, servers.len() as u32);
                    servers.push(addr);
                }
            }
        }
        let segment_owners = topology
            .hash
            .segment_owners()
            .iter()
            .map(|owners| owners.iter().filter_map(|o| index.get(o).copied()).collect())
            .collect();
        Self {
            servers,
            num_owners: topology.hash.num_owners().min(u8::MAX as u32) as u8,
            segment_owners,
        }
    }
}

#[derive(Debug)]
struct VisibleTopology {
    topology_id: TopologyId,
    latest: Arc<CacheTopology>,
    virtual_nodes: u32,
    layout: ClientLayout,
}

/// Topology ids last sent to one connection, per cache.
#[derive(Debug, Default)]
pub struct ClientTopologyState {
    last_sent: HashMap<String, TopologyId>,
}

impl ClientTopologyState {
    /// Create an empty state for a new connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last topology id sent for `cache`.
    pub fn last_sent(&self, cache: &str) -> Option<TopologyId> {
        self.last_sent.get(cache).copied()
    }
}

/// Decides which responses carry a topology block, and builds it.
#[derive(Debug, Default)]
pub struct ClientIntelligenceNegotiator {
    endpoints: EndpointRegistry,
    caches: RwLock<HashMap<String, VisibleTopology>>,
}

impl ClientIntelligenceNegotiator {
    /// Create a negotiator with no caches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Client endpoints known to the negotiator.
    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    /// Start tracking a cache from its current topology.
    pub fn register_cache(&self, cache: &str, topology: &Arc<CacheTopology>, virtual_nodes: u32) {
        let layout = ClientLayout::of(topology, &self.endpoints);
        self.caches.write().insert(
            cache.to_string(),
            VisibleTopology {
                topology_id: topology.topology_id,
                latest: topology.clone(),
                virtual_nodes,
                layout,
            },
        );
    }

    /// Stop tracking a cache.
    pub fn remove_cache(&self, cache: &str) {
        self.caches.write().remove(cache);
    }

    /// Record a member's client endpoint and refresh every cache.
    pub fn register_endpoint(&self, node: NodeAddress, addr: SocketAddr) {
        self.endpoints.register(node, addr);
        self.refresh_all();
    }

    /// Forget a member's client endpoint and refresh every cache.
    pub fn unregister_endpoint(&self, node: &NodeAddress) {
        if self.endpoints.unregister(node).is_some() {
            self.refresh_all();
        }
    }

    /// Client-visible topology id of a cache.
    pub fn client_topology_id(&self, cache: &str) -> Option<TopologyId> {
        self.caches.read().get(cache).map(|v| v.topology_id)
    }

    /// Topology block to attach to a response, if the client is due one.
    ///
    /// `client_topology_id` is the id the client declared in its request; it
    /// counts as sent when the connection has not been sent one yet.
    pub fn negotiate(
        &self,
        cache: &str,
        intelligence: ClientIntelligence,
        client_topology_id: TopologyId,
        state: &mut ClientTopologyState,
    ) -> Option<TopologyUpdate> {
        if intelligence == ClientIntelligence::Basic {
            return None;
        }
        let caches = self.caches.read();
        let visible = caches.get(cache)?;
        let known = state.last_sent(cache).unwrap_or(client_topology_id);
        if known == visible.topology_id {
            return None;
        }

        state
            .last_sent
            .insert(cache.to_string(), visible.topology_id);
        let layout = &visible.layout;
        let update = match intelligence {
            ClientIntelligence::HashDistributionAware => TopologyUpdate::Hash {
                topology_id: visible.topology_id,
                servers: layout.servers.clone(),
                num_owners: layout.num_owners,
                hash_function: HASH_FUNCTION_XXH64,
                num_segments: visible.latest.hash.num_segments(),
                virtual_nodes: visible.virtual_nodes,
                segment_owners: layout.segment_owners.clone(),
            },
            _ => TopologyUpdate::Servers {
                topology_id: visible.topology_id,
                servers: layout.servers.clone(),
            },
        };
        debug!(
            cache,
            topology_id = visible.topology_id,
            ?intelligence,
            "Sending topology to client"
        );
        Some(update)
    }

    fn refresh_all(&self) {
        let mut caches = self.caches.write();
        for (cache, visible) in caches.iter_mut() {
            let latest = visible.latest.clone();
            Self::advance(cache, visible, latest, &self.endpoints);
        }
    }

    fn advance(
        cache: &str,
        visible: &mut VisibleTopology,
        latest: Arc<CacheTopology>,
        endpoints: &EndpointRegistry,
    ) {
        let layout = ClientLayout::of(&latest, endpoints);
        if layout != visible.layout {
            // The id only moves forward, also when endpoints change without a
            // new topology.
            let next = latest.topology_id.max(visible.topology_id + 1);
            debug!(
                cache,
                from = visible.topology_id,
                to = next,
                "Client-visible topology changed"
            );
            visible.topology_id = next;
            visible.layout = layout;
        }
        visible.latest = latest;
    }
}

impl TopologyListener for ClientIntelligenceNegotiator {
    fn on_topology_committed(&self, cache: &str, topology: &Arc<CacheTopology>) {
        let mut caches = self.caches.write();
        if let Some(visible) = caches.get_mut(cache) {
            Self::advance(cache, visible, topology.clone(), &self.endpoints);
        }
    }
}
