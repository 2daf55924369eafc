//! Membership view events and topology listeners.

use crate::cluster::topology::CacheTopology;
use crate::types::NodeAddress;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What caused a membership view change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChangeKind {
    /// One or more members joined.
    Join,
    /// One or more members left or failed.
    Leave,
    /// Partitions merged.
    Merge,
    /// Members were excluded after failing to receive state.
    Exclusion,
}

/// A new membership view delivered by the group membership layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewChange {
    /// Monotonic id assigned by the membership layer.
    pub view_id: u64,

    /// Members, in view order.
    pub members: Vec<NodeAddress>,

    /// Capacity factors; members absent here have factor 1.0.
    pub capacities: BTreeMap<NodeAddress, f32>,

    /// Cause of the change.
    pub kind: ViewChangeKind,
}

impl ViewChange {
    /// Create a view where every member has the default capacity.
    pub fn new(view_id: u64, members: Vec<NodeAddress>, kind: ViewChangeKind) -> Self {
        Self {
            view_id,
            members,
            capacities: BTreeMap::new(),
            kind,
        }
    }

    /// Set a member's capacity factor.
    pub fn with_capacity(mut self, node: NodeAddress, factor: f32) -> Self {
        self.capacities.insert(node, factor);
        self
    }

    /// Capacity factor of a member.
    pub fn capacity_of(&self, node: &NodeAddress) -> f32 {
        self.capacities.get(node).copied().unwrap_or(1.0)
    }

    /// Whether both views have the same members and capacities, ignoring
    /// order, id and cause.
    pub fn same_membership(&self, other: &ViewChange) -> bool {
        let mut a = self.members.clone();
        let mut b = other.members.clone();
        a.sort();
        a.dedup();
        b.sort();
        b.dedup();
        a == b && a.iter().all(|m| self.capacity_of(m) == other.capacity_of(m))
    }

    /// The same view without some members.
    pub fn without(&self, excluded: &[NodeAddress], view_id: u64) -> ViewChange {
        ViewChange {
            view_id,
            members: self
                .members
                .iter()
                .filter(|m| !excluded.contains(m))
                .cloned()
                .collect(),
            capacities: self
                .capacities
                .iter()
                .filter(|(m, _)| !excluded.contains(m))
                .map(|(m, f)| (m.clone(), *f))
                .collect(),
            kind: ViewChangeKind::Exclusion,
        }
    }
}

/// Listener for topology changes of a cache.
pub trait TopologyListener: Send + Sync + 'static {
    /// Called after a topology is committed.
    fn on_topology_committed(&self, cache: &str, topology: &Arc<CacheTopology>);

    /// Called when members are excluded after a failed rehash.
    fn on_members_excluded(&self, _cache: &str, _members: &[NodeAddress]) {}
}

/// No-op topology listener.
pub struct NoopTopologyListener;

impl TopologyListener for NoopTopologyListener {
    fn on_topology_committed(&self, _cache: &str, _topology: &Arc<CacheTopology>) {}
}

/// Topology listener that logs changes.
pub struct LoggingTopologyListener;

impl TopologyListener for LoggingTopologyListener {
    fn on_topology_committed(&self, cache: &str, topology: &Arc<CacheTopology>) {
        tracing::info!(
            cache,
            topology_id = topology.topology_id,
            members = topology.members.len(),
            "Topology committed"
        );
    }

    fn on_members_excluded(&self, cache: &str, members: &[NodeAddress]) {
        tracing::warn!(cache, ?members, "Members excluded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeAddress> {
        names.iter().map(|n| NodeAddress::new(n)).collect()
    }

    #[test]
    fn test_same_membership_ignores_order() {
        let a = ViewChange::new(1, nodes(&["a", "b"]), ViewChangeKind::Join);
        let b = ViewChange::new(2, nodes(&["b", "a"]), ViewChangeKind::Merge);
        assert!(a.same_membership(&b));

        let c = b.clone().with_capacity(NodeAddress::new("a"), 0.0);
        assert!(!a.same_membership(&c));
    }

    #[test]
    fn test_without() {
        let view = ViewChange::new(1, nodes(&["a", "b", "c"]), ViewChangeKind::Join)
            .with_capacity(NodeAddress::new("b"), 2.0);
        let trimmed = view.without(&nodes(&["b"]), 2);

        assert_eq!(trimmed.members, nodes(&["a", "c"]));
        assert!(trimmed.capacities.is_empty());
        assert_eq!(trimmed.kind, ViewChangeKind::Exclusion);
        assert_eq!(trimmed.view_id, 2);
    }

    #[test]
    fn test_default_capacity() {
        let view = ViewChange::new(1, nodes(&["a"]), ViewChangeKind::Join);
        assert_eq!(view.capacity_of(&NodeAddress::new("a")), 1.0);
    }
}
