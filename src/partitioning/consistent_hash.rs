//! Segment-based consistent hashing.
//!
//! The key space is split into a fixed number of segments. A key maps to
//! `xxh64(key) mod num_segments`, and each segment has an ordered owner list
//! (primary first, then backups). [`ConsistentHashEngine`] computes owner
//! lists from a membership, reusing a prior assignment where possible so a
//! membership change moves as few segments as balance requires.

use crate::error::TopologyError;
use crate::types::{NodeAddress, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Identifier of the key hash function, advertised to hash-aware clients.
pub const HASH_FUNCTION_XXH64: u8 = 0x03;

/// Stable 64-bit hash of a key.
pub fn key_hash(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish()
}

/// Segment a key belongs to.
pub fn segment_for_key(key: &[u8], num_segments: u32) -> SegmentId {
    (key_hash(key) % u64::from(num_segments.max(1))) as SegmentId
}

/// Ownership of every segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentHash {
    num_segments: u32,
    num_owners: u32,
    segment_owners: Vec<Vec<NodeAddress>>,
}

impl ConsistentHash {
    /// Build a hash from explicit owner lists.
    pub fn from_owners(num_owners: u32, segment_owners: Vec<Vec<NodeAddress>>) -> Self {
        Self {
            num_segments: segment_owners.len() as u32,
            num_owners,
            segment_owners,
        }
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    /// Configured owners per segment.
    pub fn num_owners(&self) -> u32 {
        self.num_owners
    }

    /// Owner lists indexed by segment.
    pub fn segment_owners(&self) -> &[Vec<NodeAddress>] {
        &self.segment_owners
    }

    /// Owners of a segment, primary first.
    pub fn owners(&self, segment: SegmentId) -> &[NodeAddress] {
        self.segment_owners
            .get(segment as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Primary owner of a segment.
    pub fn primary(&self, segment: SegmentId) -> Option<&NodeAddress> {
        self.owners(segment).first()
    }

    /// Segment of a key.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        segment_for_key(key, self.num_segments)
    }

    /// Owners of a key, primary first.
    pub fn locate_owners(&self, key: &[u8]) -> &[NodeAddress] {
        self.owners(self.segment_of(key))
    }

    /// Primary owner of a key.
    pub fn locate_primary(&self, key: &[u8]) -> Option<&NodeAddress> {
        self.locate_owners(key).first()
    }

    /// Whether a node owns a segment.
    pub fn is_owner(&self, segment: SegmentId, node: &NodeAddress) -> bool {
        self.owners(segment).contains(node)
    }

    /// Distinct nodes owning at least one segment, sorted.
    pub fn owner_nodes(&self) -> Vec<NodeAddress> {
        let mut nodes: Vec<NodeAddress> = self
            .segment_owners
            .iter()
            .flatten()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        nodes.sort();
        nodes
    }

    /// Segments a node owns (as primary or backup).
    pub fn segments_owned_by(&self, node: &NodeAddress) -> Vec<SegmentId> {
        (0..self.num_segments)
            .filter(|&s| self.is_owner(s, node))
            .collect()
    }

    /// Segments a node is primary for.
    pub fn primary_segments_of(&self, node: &NodeAddress) -> Vec<SegmentId> {
        (0..self.num_segments)
            .filter(|&s| self.primary(s) == Some(node))
            .collect()
    }

    /// Number of owned segments per node.
    pub fn owner_counts(&self) -> BTreeMap<NodeAddress, usize> {
        let mut counts = BTreeMap::new();
        for owner in self.segment_owners.iter().flatten() {
            *counts.entry(owner.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Segments whose owner set differs between `self` and `other`.
    ///
    /// Owner order is ignored: promoting a backup to primary moves no data.
    pub fn changed_segments(&self, other: &ConsistentHash) -> Vec<SegmentId> {
        let n = self.num_segments.max(other.num_segments);
        (0..n)
            .filter(|&s| {
                let a: HashSet<&NodeAddress> = self.owners(s).iter().collect();
                let b: HashSet<&NodeAddress> = other.owners(s).iter().collect();
                a != b
            })
            .collect()
    }

    /// Number of owner slots assigned in `other` to a node that did not hold
    /// the segment in `self`.
    pub fn moved_slots(&self, other: &ConsistentHash) -> usize {
        (0..other.num_segments)
            .map(|s| {
                other
                    .owners(s)
                    .iter()
                    .filter(|o| !self.is_owner(s, o))
                    .count()
            })
            .sum()
    }
}

/// Computes segment ownership from a membership.
///
/// Policy, applied in order:
/// 1. Keep prior owners that are still capable members (or seed round-robin
///    when there is no usable prior).
/// 2. Shed owners above their slot budget, `ceil(segments * k * w / W)`,
///    at most one per segment per pass, backups before primaries.
/// 3. Fill vacancies with the candidate of lowest `load / weight`, ties
///    broken by lowest node identifier.
/// 4. Swap primaries with same-segment backups to even out primary counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistentHashEngine;

impl ConsistentHashEngine {
    /// Compute ownership with every member at capacity factor 1.
    pub fn compute_hash(
        members: &[NodeAddress],
        num_segments: u32,
        num_owners: u32,
        prior: Option<&ConsistentHash>,
    ) -> Result<ConsistentHash, TopologyError> {
        Self::compute_weighted(members, |_| 1.0, num_segments, num_owners, prior)
    }

    /// Compute ownership with per-member capacity factors.
    ///
    /// Members with a factor of zero belong to the membership but own no
    /// segments.
    pub fn compute_weighted<F>(
        members: &[NodeAddress],
        capacity: F,
        num_segments: u32,
        num_owners: u32,
        prior: Option<&ConsistentHash>,
    ) -> Result<ConsistentHash, TopologyError>
    where
        F: Fn(&NodeAddress) -> f32,
    {
        let mut capable: Vec<(NodeAddress, f64)> = Vec::with_capacity(members.len());
        let mut seen = HashSet::new();
        for member in members {
            if !seen.insert(member) {
                continue;
            }
            let factor = f64::from(capacity(member));
            if factor.is_finite() && factor > 0.0 {
                capable.push((member.clone(), factor));
            }
        }

        if capable.is_empty() || num_segments == 0 {
            return Err(TopologyError::NoOwnersAvailable);
        }

        let segments = num_segments as usize;
        let k = (num_owners.max(1) as usize).min(capable.len());
        let weight: HashMap<NodeAddress, f64> = capable.iter().cloned().collect();
        let total_weight: f64 = capable.iter().map(|(_, w)| w).sum();

        let mut owners: Vec<Vec<NodeAddress>> = match prior {
            Some(prior) if prior.num_segments == num_segments => prior
                .segment_owners
                .iter()
                .map(|list| {
                    let mut kept: Vec<NodeAddress> = Vec::with_capacity(k);
                    for owner in list {
                        if weight.contains_key(owner) && !kept.contains(owner) {
                            kept.push(owner.clone());
                        }
                    }
                    kept.truncate(k);
                    kept
                })
                .collect(),
            Some(prior) => {
                tracing::debug!(
                    prior_segments = prior.num_segments,
                    num_segments,
                    "Prior hash has a different segment count, seeding from scratch"
                );
                Self::seed(&capable, segments, k)
            }
            None => Self::seed(&capable, segments, k),
        };

        let slot_budget: HashMap<NodeAddress, usize> = capable
            .iter()
            .map(|(m, w)| (m.clone(), ceil_share(segments * k, *w, total_weight)))
            .collect();

        let mut load: HashMap<NodeAddress, usize> =
            capable.iter().map(|(m, _)| (m.clone(), 0)).collect();
        for owner in owners.iter().flatten() {
            *load.entry(owner.clone()).or_insert(0) += 1;
        }

        Self::shed_overload(&mut owners, &mut load, &slot_budget);
        Self::fill_vacancies(&mut owners, &mut load, &capable, k);
        Self::balance_primaries(&mut owners, &capable, total_weight);

        Ok(ConsistentHash {
            num_segments,
            num_owners,
            segment_owners: owners,
        })
    }

    fn seed(capable: &[(NodeAddress, f64)], segments: usize, k: usize) -> Vec<Vec<NodeAddress>> {
        let n = capable.len();
        (0..segments)
            .map(|s| (0..k).map(|j| capable[(s + j) % n].0.clone()).collect())
            .collect()
    }

    fn shed_overload(
        owners: &mut [Vec<NodeAddress>],
        load: &mut HashMap<NodeAddress, usize>,
        budget: &HashMap<NodeAddress, usize>,
    ) {
        let over = |load: &HashMap<NodeAddress, usize>, node: &NodeAddress| {
            load.get(node).copied().unwrap_or(0) > budget.get(node).copied().unwrap_or(0)
        };

        loop {
            let mut shed_any = false;
            for list in owners.iter_mut() {
                if let Some(pos) = (0..list.len()).rev().find(|&i| over(load, &list[i])) {
                    let node = list.remove(pos);
                    if let Some(l) = load.get_mut(&node) {
                        *l -= 1;
                    }
                    shed_any = true;
                }
            }
            if !shed_any {
                break;
            }
        }
    }

    fn fill_vacancies(
        owners: &mut [Vec<NodeAddress>],
        load: &mut HashMap<NodeAddress, usize>,
        capable: &[(NodeAddress, f64)],
        k: usize,
    ) {
        for list in owners.iter_mut() {
            while list.len() < k {
                let candidate = capable
                    .iter()
                    .filter(|(m, _)| !list.contains(m))
                    .min_by(|(a, wa), (b, wb)| {
                        let la = load.get(a).copied().unwrap_or(0) as f64 / wa;
                        let lb = load.get(b).copied().unwrap_or(0) as f64 / wb;
                        la.total_cmp(&lb).then_with(|| a.cmp(b))
                    })
                    .map(|(m, _)| m.clone());

                match candidate {
                    Some(node) => {
                        *load.entry(node.clone()).or_insert(0) += 1;
                        list.push(node);
                    }
                    None => break,
                }
            }
        }
    }

    fn balance_primaries(
        owners: &mut [Vec<NodeAddress>],
        capable: &[(NodeAddress, f64)],
        total_weight: f64,
    ) {
        let segments = owners.len();
        let weight: HashMap<&NodeAddress, f64> = capable.iter().map(|(m, w)| (m, *w)).collect();
        let budget: HashMap<NodeAddress, usize> = capable
            .iter()
            .map(|(m, w)| (m.clone(), ceil_share(segments, *w, total_weight)))
            .collect();

        let mut primaries: HashMap<NodeAddress, usize> = HashMap::new();
        for list in owners.iter() {
            if let Some(p) = list.first() {
                *primaries.entry(p.clone()).or_insert(0) += 1;
            }
        }

        for list in owners.iter_mut() {
            let Some(primary) = list.first().cloned() else {
                continue;
            };
            if primaries.get(&primary).copied().unwrap_or(0) <= budget[&primary] {
                continue;
            }

            let swap_with = (1..list.len())
                .filter(|&j| primaries.get(&list[j]).copied().unwrap_or(0) < budget[&list[j]])
                .min_by(|&a, &b| {
                    let ra = primaries.get(&list[a]).copied().unwrap_or(0) as f64 / weight[&list[a]];
                    let rb = primaries.get(&list[b]).copied().unwrap_or(0) as f64 / weight[&list[b]];
                    ra.total_cmp(&rb).then_with(|| list[a].cmp(&list[b]))
                });

            if let Some(j) = swap_with {
                let promoted = list[j].clone();
                list.swap(0, j);
                if let Some(c) = primaries.get_mut(&primary) {
                    *c -= 1;
                }
                *primaries.entry(promoted).or_insert(0) += 1;
            }
        }
    }
}

/// `ceil(total * w / total_weight)`, tolerant to float noise.
fn ceil_share(total: usize, w: f64, total_weight: f64) -> usize {
    let share = total as f64 * w / total_weight;
    (share - 1e-9).ceil().max(0.0) as usize
}
