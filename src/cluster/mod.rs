//! Cache topologies and their lifecycle.
//!
//! The group membership layer delivers [`ViewChange`]s; each cache's
//! [`ClusterTopologyManager`] turns them into versioned [`CacheTopology`]s,
//! driving a rehash between the committed and the pending one.

pub mod events;
pub mod manager;
pub mod topology;

pub use events::{
    LoggingTopologyListener, NoopTopologyListener, TopologyListener, ViewChange, ViewChangeKind,
};
pub use manager::ClusterTopologyManager;
pub use topology::{
    CacheTopology, PendingRoute, RoutingView, SegmentRoute, TopologyHistory, TopologyPhase,
};
