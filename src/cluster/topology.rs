//! Versioned cache topologies and the routing view derived from them.

use crate::partitioning::ConsistentHash;
use crate::rebalancing::{SegmentGates, SegmentTransferState, SegmentTransferTable};
use crate::types::{NodeAddress, SegmentId, TopologyId};
use std::collections::VecDeque;
use std::sync::Arc;

/// An immutable, versioned ownership layout of one cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheTopology {
    /// Strictly increasing version.
    pub topology_id: TopologyId,

    /// Cache membership, in view order.
    pub members: Vec<NodeAddress>,

    /// Segment ownership.
    pub hash: Arc<ConsistentHash>,
}

impl CacheTopology {
    /// Create a topology.
    pub fn new(topology_id: TopologyId, members: Vec<NodeAddress>, hash: ConsistentHash) -> Self {
        Self {
            topology_id,
            members,
            hash: Arc::new(hash),
        }
    }

    /// Whether a node is a member.
    pub fn is_member(&self, node: &NodeAddress) -> bool {
        self.members.contains(node)
    }
}

/// Append-only record of committed topologies, oldest trimmed first.
#[derive(Debug)]
pub struct TopologyHistory {
    entries: VecDeque<Arc<CacheTopology>>,
    max_history: usize,
}

impl TopologyHistory {
    /// Create an empty history keeping at most `max_history` topologies.
    pub fn new(max_history: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_history: max_history.max(1),
        }
    }

    /// Append a committed topology. Ids must increase.
    pub fn push(&mut self, topology: Arc<CacheTopology>) {
        debug_assert!(self
            .latest()
            .map_or(true, |last| last.topology_id < topology.topology_id));
        self.entries.push_back(topology);
        while self.entries.len() > self.max_history {
            self.entries.pop_front();
        }
    }

    /// Look up a topology by id.
    pub fn get(&self, topology_id: TopologyId) -> Option<Arc<CacheTopology>> {
        self.entries
            .binary_search_by_key(&topology_id, |t| t.topology_id)
            .ok()
            .and_then(|i| self.entries.get(i).cloned())
    }

    /// Most recent topology.
    pub fn latest(&self) -> Option<&Arc<CacheTopology>> {
        self.entries.back()
    }

    /// Ids retained, oldest first.
    pub fn ids(&self) -> Vec<TopologyId> {
        self.entries.iter().map(|t| t.topology_id).collect()
    }

    /// Number of retained topologies.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Phase of a cache's topology manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyPhase {
    /// No rehash in flight.
    Stable,
    /// A pending topology is being installed.
    Rebalancing,
}

/// A pending topology together with its transfer progress.
#[derive(Debug, Clone)]
pub struct PendingRoute {
    /// Topology being installed.
    pub topology: Arc<CacheTopology>,

    /// Live holders of the data per segment.
    pub source: Arc<ConsistentHash>,

    /// Transfer progress per segment.
    pub table: Arc<SegmentTransferTable>,
}

/// Where an operation on one segment goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRoute {
    /// Owners that apply writes; the first runs conditional commands.
    pub write_owners: Vec<NodeAddress>,

    /// Owner serving reads.
    pub read_owner: Option<NodeAddress>,
}

/// What client operations route against: the committed topology and, while
/// rebalancing, the pending one.
#[derive(Debug, Clone)]
pub struct RoutingView {
    /// Committed topology.
    pub current: Arc<CacheTopology>,

    /// Topology being installed, if any.
    pub pending: Option<PendingRoute>,

    /// Members actually holding each segment when an abandoned rehash left
    /// data off the committed owners. Overrides them until the next commit.
    pub holders: Option<Arc<ConsistentHash>>,

    /// Cache-wide segment gates.
    pub gates: Arc<SegmentGates>,
}

impl RoutingView {
    /// A view with no rehash in flight.
    pub fn stable(current: Arc<CacheTopology>, gates: Arc<SegmentGates>) -> Self {
        Self {
            current,
            pending: None,
            holders: None,
            gates,
        }
    }

    /// A view with no rehash in flight whose data sits on `holders` rather
    /// than on the committed owners.
    pub fn parked(
        current: Arc<CacheTopology>,
        holders: Arc<ConsistentHash>,
        gates: Arc<SegmentGates>,
    ) -> Self {
        Self {
            current,
            pending: None,
            holders: Some(holders),
            gates,
        }
    }

    /// Per-segment owner lists of whoever holds the data outside a rehash.
    pub fn settled_owners(&self) -> &Arc<ConsistentHash> {
        self.holders.as_ref().unwrap_or(&self.current.hash)
    }

    /// Newest topology id known, pending included.
    pub fn latest_topology_id(&self) -> TopologyId {
        self.pending
            .as_ref()
            .map(|p| p.topology.topology_id)
            .unwrap_or(self.current.topology_id)
    }

    /// Members of the newest topology.
    pub fn latest_members(&self) -> &[NodeAddress] {
        self.pending
            .as_ref()
            .map(|p| p.topology.members.as_slice())
            .unwrap_or(self.current.members.as_slice())
    }

    /// Every member that may hold entries of the cache.
    pub fn members_with_data(&self) -> Vec<NodeAddress> {
        let mut members = self.current.members.clone();
        let parked = self
            .holders
            .iter()
            .flat_map(|h| h.segment_owners().iter().flatten());
        for member in self.latest_members().iter().chain(parked) {
            if !members.contains(member) {
                members.push(member.clone());
            }
        }
        members
    }

    /// Segment a key maps to.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        self.current.hash.segment_of(key)
    }

    /// Route for a segment.
    ///
    /// Stable: the committed owners, or the parked holders. Rebalancing and
    /// not yet done: live
    /// holders first, then the pending owners that do not hold the segment
    /// yet; reads stay on the holders. Done: the pending owners only.
    pub fn route(&self, segment: SegmentId) -> SegmentRoute {
        let Some(pending) = &self.pending else {
            let owners = self.settled_owners().owners(segment).to_vec();
            return SegmentRoute {
                read_owner: owners.first().cloned(),
                write_owners: owners,
            };
        };

        let new_owners = pending.topology.hash.owners(segment);
        if pending.table.state(segment) == SegmentTransferState::Done {
            return SegmentRoute {
                read_owner: new_owners.first().cloned(),
                write_owners: new_owners.to_vec(),
            };
        }

        let holders = pending.source.owners(segment);
        let mut write_owners = holders.to_vec();
        for owner in new_owners {
            if !write_owners.contains(owner) {
                write_owners.push(owner.clone());
            }
        }
        SegmentRoute {
            read_owner: holders.first().or(new_owners.first()).cloned(),
            write_owners,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::ConsistentHashEngine;

    fn nodes(names: &[&str]) -> Vec<NodeAddress> {
        names.iter().map(|n| NodeAddress::new(n)).collect()
    }

    fn topology(id: TopologyId, names: &[&str]) -> Arc<CacheTopology> {
        let members = nodes(names);
        let hash = ConsistentHashEngine::compute_hash(&members, 8, 1, None).unwrap();
        Arc::new(CacheTopology::new(id, members, hash))
    }

    #[test]
    fn test_history_lookup_and_trim() {
        let mut history = TopologyHistory::new(3);
        for id in 0..5 {
            history.push(topology(id, &["a"]));
        }

        assert_eq!(history.ids(), vec![2, 3, 4]);
        assert!(history.get(1).is_none());
        assert_eq!(history.get(3).unwrap().topology_id, 3);
        assert_eq!(history.latest().unwrap().topology_id, 4);
    }

    #[test]
    fn test_stable_route() {
        let current = topology(0, &["a", "b"]);
        let view = RoutingView::stable(current.clone(), Arc::new(SegmentGates::new(8)));

        let route = view.route(3);
        assert_eq!(route.write_owners, current.hash.owners(3).to_vec());
        assert_eq!(route.read_owner.as_ref(), current.hash.primary(3));
        assert_eq!(view.latest_topology_id(), 0);
    }

    #[test]
    fn test_route_follows_transfer_state() {
        let current = topology(0, &["a"]);
        let pending = topology(1, &["b"]);
        let table = Arc::new(SegmentTransferTable::new(1, 8));
        let view = RoutingView {
            current: current.clone(),
            pending: Some(PendingRoute {
                topology: pending,
                source: current.hash.clone(),
                table: table.clone(),
            }),
            holders: None,
            gates: Arc::new(SegmentGates::new(8)),
        };

        let route = view.route(2);
        assert_eq!(route.write_owners, nodes(&["a", "b"]));
        assert_eq!(route.read_owner, Some(NodeAddress::new("a")));

        table.advance(2, SegmentTransferState::Transferring);
        assert_eq!(view.route(2).read_owner, Some(NodeAddress::new("a")));

        table.advance(2, SegmentTransferState::Done);
        let route = view.route(2);
        assert_eq!(route.write_owners, nodes(&["b"]));
        assert_eq!(route.read_owner, Some(NodeAddress::new("b")));
        assert_eq!(view.latest_topology_id(), 1);
        assert_eq!(view.latest_members(), nodes(&["b"]).as_slice());
    }

    #[test]
    fn test_parked_view_routes_to_holders() {
        let current = topology(0, &["a"]);
        let holders = ConsistentHash::from_owners(
            1,
            (0..8)
                .map(|s| if s < 4 { nodes(&["a"]) } else { Vec::new() })
                .collect(),
        );
        let view = RoutingView::parked(current, Arc::new(holders), Arc::new(SegmentGates::new(8)));

        assert_eq!(view.route(1).read_owner, Some(NodeAddress::new("a")));
        let route = view.route(6);
        assert!(route.read_owner.is_none());
        assert!(route.write_owners.is_empty());
        assert_eq!(view.latest_topology_id(), 0);
    }
}
