//! Testing utilities for the data grid.
//!
//! [`TestCluster`] runs a whole grid in one process with a
//! [`ChaosController`] installed on its transport, so tests can crash
//! members, hold state transfer mid-flight and talk to real client
//! endpoints over TCP.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       TestCluster                         │
//! │                                                           │
//! │   DataGrid ──► LocalTransport ──► ChaosController         │
//! │      │                              - member crashes      │
//! │      │                              - request holds       │
//! │      ▼                              - drops / delays      │
//! │   GridServer (127.0.0.1:0) per served member              │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod chaos;
mod utils;

#[cfg(test)]
mod rehash_e2e_tests;

pub use chaos::{ChaosConfig, ChaosController, ChaosStats, NodeCrash};
pub use utils::{wait_for, wait_for_result};

use crate::cache::GridCache;
use crate::config::GridConfig;
use crate::error::Result;
use crate::grid::DataGrid;
use crate::types::{NodeAddress, TopologyId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An in-process grid with fault injection.
#[derive(Debug)]
pub struct TestCluster {
    grid: DataGrid,

    /// Fault injector on the node-to-node transport.
    pub chaos: Arc<ChaosController>,

    next_node: AtomicUsize,
    started_at: Instant,
}

impl TestCluster {
    /// Start a grid with `node_count` members named `node-0`, `node-1`, ...
    pub async fn start(config: GridConfig, node_count: usize) -> Result<Self> {
        Self::with_chaos(config, node_count, ChaosConfig::none()).await
    }

    /// Start a grid with custom random faults (disabled until enabled).
    pub async fn with_chaos(
        config: GridConfig,
        node_count: usize,
        chaos_config: ChaosConfig,
    ) -> Result<Self> {
        let members = (0..node_count).map(Self::node_name).collect();
        let grid = DataGrid::start(config, members).await?;
        let chaos = Arc::new(ChaosController::new(chaos_config));
        grid.transport().set_interceptor(chaos.clone());

        Ok(Self {
            grid,
            chaos,
            next_node: AtomicUsize::new(node_count),
            started_at: Instant::now(),
        })
    }

    /// Address of the `index`-th member.
    pub fn node_name(index: usize) -> NodeAddress {
        NodeAddress::new(format!("node-{}", index))
    }

    /// The grid under test.
    pub fn grid(&self) -> &DataGrid {
        &self.grid
    }

    /// Current members.
    pub fn members(&self) -> Vec<NodeAddress> {
        self.grid.members()
    }

    /// Get the first member.
    pub fn first_node(&self) -> NodeAddress {
        Self::node_name(0)
    }

    // ==================== Membership ====================

    /// Join a fresh member that owns segments.
    pub async fn add_node(&self) -> Result<NodeAddress> {
        let node = Self::node_name(self.next_node.fetch_add(1, Ordering::Relaxed));
        self.grid.join(node.clone()).await?;
        Ok(node)
    }

    /// Join a fresh member with capacity factor zero.
    pub async fn add_storage_node(&self) -> Result<NodeAddress> {
        let node = Self::node_name(self.next_node.fetch_add(1, Ordering::Relaxed));
        self.grid.join_with_capacity(node.clone(), 0.0).await?;
        Ok(node)
    }

    /// Remove a member.
    pub async fn remove_node(&self, node: &NodeAddress) -> Result<()> {
        self.grid.leave(node).await
    }

    /// Wait until every cache is stable.
    pub async fn await_stable(&self) -> Result<()> {
        self.grid.await_stable().await
    }

    /// Serve clients for `node` on a free local port.
    pub async fn serve(&self, node: &NodeAddress) -> Result<SocketAddr> {
        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        self.grid.start_server(node, addr).await
    }

    // ==================== Inspection ====================

    /// A member's handle on a cache.
    pub fn cache(&self, node: &NodeAddress, name: &str) -> Result<GridCache> {
        self.grid.cache(node, name)
    }

    /// Committed owners of `key`.
    pub fn owners_of(&self, cache: &str, key: &[u8]) -> Vec<NodeAddress> {
        self.grid
            .manager(cache)
            .map(|m| m.current_topology().hash.locate_owners(key).to_vec())
            .unwrap_or_default()
    }

    /// Members whose local container holds a live `key`.
    pub fn holders_of(&self, cache: &str, key: &[u8]) -> Vec<NodeAddress> {
        self.members()
            .into_iter()
            .filter(|node| {
                self.grid
                    .node(node)
                    .and_then(|n| n.containers().container(cache))
                    .is_some_and(|c| c.peek(key).is_some())
            })
            .collect()
    }

    /// Committed internal topology id of a cache.
    pub fn topology_id(&self, cache: &str) -> Option<TopologyId> {
        self.grid
            .manager(cache)
            .map(|m| m.current_topology().topology_id)
    }

    /// Topology id clients of a cache are told about.
    pub fn client_topology_id(&self, cache: &str) -> Option<TopologyId> {
        self.grid.negotiator().client_topology_id(cache)
    }

    // ==================== Faults ====================

    /// Make a member unreachable for `duration`.
    pub fn crash_node(&self, node: &NodeAddress, duration: Duration) {
        self.chaos.crash_node(node.clone(), duration);
    }

    /// Recover all crashed members.
    pub fn recover_nodes(&self) {
        self.chaos.recover_all_nodes();
    }

    /// Get elapsed time since the cluster started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Stop the grid.
    pub async fn shutdown(&self) {
        self.chaos.reset();
        self.grid.shutdown().await;
    }
}
