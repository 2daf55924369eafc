//! State transfer types.
//!
//! Entries move between nodes in [`TransferBatch`]es. Each rehash tracks
//! per-segment progress in a [`SegmentTransferTable`], and writers coordinate
//! with transfers through the cache-wide [`SegmentGates`].

use crate::types::{now_millis, CacheEntry, SegmentId, TopologyId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A cache entry being transferred between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
    /// The cache key.
    pub key: Bytes,

    /// The entry, with its original creation and access times.
    pub entry: CacheEntry,
}

impl TransferEntry {
    /// Create a transfer entry.
    pub fn new(key: Bytes, entry: CacheEntry) -> Self {
        Self { key, entry }
    }

    /// Check if the entry has expired.
    pub fn is_expired(&self) -> bool {
        self.entry.is_expired_at(now_millis())
    }
}

/// A batch of entries of one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBatch {
    /// Topology the transfer belongs to.
    pub topology_id: TopologyId,

    /// Segment the entries belong to.
    pub segment: SegmentId,

    /// The batch sequence number within the segment.
    pub sequence: u64,

    /// Entries in this batch.
    pub entries: Vec<TransferEntry>,

    /// Whether this is the last batch of the segment.
    pub is_final: bool,
}

impl TransferBatch {
    /// Create a new transfer batch.
    pub fn new(
        topology_id: TopologyId,
        segment: SegmentId,
        sequence: u64,
        entries: Vec<TransferEntry>,
        is_final: bool,
    ) -> Self {
        Self {
            topology_id,
            segment,
            sequence,
            entries,
            is_final,
        }
    }

    /// Split entries into batches of at most `batch_size`. Always yields at
    /// least one (final) batch.
    pub fn split(
        topology_id: TopologyId,
        segment: SegmentId,
        entries: Vec<TransferEntry>,
        batch_size: usize,
    ) -> Vec<TransferBatch> {
        let batch_size = batch_size.max(1);
        if entries.is_empty() {
            return vec![Self::new(topology_id, segment, 0, Vec::new(), true)];
        }

        let chunks: Vec<Vec<TransferEntry>> = entries
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| Self::new(topology_id, segment, i as u64, chunk, i == last))
            .collect()
    }

    /// Get the number of entries in the batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Filter out expired entries.
    pub fn filter_expired(self) -> Self {
        Self {
            entries: self.entries.into_iter().filter(|e| !e.is_expired()).collect(),
            ..self
        }
    }

    /// Serialize batch to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize batch from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Transfer state of one segment within a rehash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegmentTransferState {
    /// Not started; old holders serve the segment.
    Idle = 0,
    /// Entries are being copied; writes go to old and new owners.
    Transferring = 1,
    /// Copy acknowledged; new owners serve the segment.
    Done = 2,
}

impl SegmentTransferState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SegmentTransferState::Transferring,
            2 => SegmentTransferState::Done,
            _ => SegmentTransferState::Idle,
        }
    }
}

/// Per-segment transfer states of one rehash.
///
/// States only move forward (`Idle -> Transferring -> Done`). Transitions
/// happen under the segment's gate write lock, so a writer holding the gate
/// read lock sees a stable state.
pub struct SegmentTransferTable {
    topology_id: TopologyId,
    states: Vec<AtomicU8>,
    entries_moved: AtomicU64,
}

impl SegmentTransferTable {
    /// Create a table with every segment idle.
    pub fn new(topology_id: TopologyId, num_segments: u32) -> Self {
        Self {
            topology_id,
            states: (0..num_segments).map(|_| AtomicU8::new(0)).collect(),
            entries_moved: AtomicU64::new(0),
        }
    }

    /// Topology the table belongs to.
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Number of segments tracked.
    pub fn num_segments(&self) -> u32 {
        self.states.len() as u32
    }

    /// State of a segment. Unknown segments read as `Idle`.
    pub fn state(&self, segment: SegmentId) -> SegmentTransferState {
        self.states
            .get(segment as usize)
            .map(|s| SegmentTransferState::from_u8(s.load(Ordering::Acquire)))
            .unwrap_or(SegmentTransferState::Idle)
    }

    /// Whether a segment is done.
    pub fn is_done(&self, segment: SegmentId) -> bool {
        self.state(segment) == SegmentTransferState::Done
    }

    /// Advance a segment. Backward transitions are ignored.
    pub fn advance(&self, segment: SegmentId, state: SegmentTransferState) {
        if let Some(slot) = self.states.get(segment as usize) {
            slot.fetch_max(state as u8, Ordering::AcqRel);
        }
    }

    /// Segments currently in `state`.
    pub fn segments_in(&self, state: SegmentTransferState) -> Vec<SegmentId> {
        (0..self.num_segments())
            .filter(|&s| self.state(s) == state)
            .collect()
    }

    /// Record moved entries.
    pub fn record_entries(&self, count: u64) {
        self.entries_moved.fetch_add(count, Ordering::Relaxed);
    }

    /// Entries moved so far.
    pub fn entries_moved(&self) -> u64 {
        self.entries_moved.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SegmentTransferTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentTransferTable")
            .field("topology_id", &self.topology_id)
            .field("done", &self.segments_in(SegmentTransferState::Done).len())
            .field(
                "transferring",
                &self.segments_in(SegmentTransferState::Transferring).len(),
            )
            .finish()
    }
}

/// One async read/write gate per segment, shared by the cache's writers and
/// the rehash coordinator.
///
/// Client operations hold the read side while they route and apply a
/// command. The coordinator holds the write side while it flips a segment's
/// transfer state, starts inbound tracking, or purges departing owners.
pub struct SegmentGates {
    gates: Vec<RwLock<()>>,
}

impl SegmentGates {
    /// Create gates for `num_segments` segments.
    pub fn new(num_segments: u32) -> Self {
        Self {
            gates: (0..num_segments.max(1)).map(|_| RwLock::new(())).collect(),
        }
    }

    /// Number of gates.
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// Always false; at least one gate exists.
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    fn gate(&self, segment: SegmentId) -> &RwLock<()> {
        &self.gates[segment as usize % self.gates.len()]
    }

    /// Acquire the shared side for a client operation.
    pub async fn read(&self, segment: SegmentId) -> RwLockReadGuard<'_, ()> {
        self.gate(segment).read().await
    }

    /// Acquire the exclusive side for a state transition.
    pub async fn write(&self, segment: SegmentId) -> RwLockWriteGuard<'_, ()> {
        self.gate(segment).write().await
    }
}

impl std::fmt::Debug for SegmentGates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentGates")
            .field("segments", &self.gates.len())
            .finish()
    }
}

/// Progress of one segment's transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// Segment transferred.
    pub segment: SegmentId,

    /// Entries read from the source.
    pub total_entries: u64,

    /// Batches acknowledged across all targets.
    pub batches_acked: u64,

    /// Number of targets that received the segment.
    pub targets: usize,

    /// True when no live source held the segment.
    pub source_missing: bool,
}

impl TransferProgress {
    /// Create a progress record.
    pub fn new(segment: SegmentId, total_entries: u64) -> Self {
        Self {
            segment,
            total_entries,
            ..Default::default()
        }
    }

    /// Record an acknowledged batch.
    pub fn update(&mut self) {
        self.batches_acked += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryMetadata;
    use std::time::Duration;

    fn entry(key: &str, value: &str) -> TransferEntry {
        TransferEntry::new(
            Bytes::copy_from_slice(key.as_bytes()),
            CacheEntry::new(
                Bytes::copy_from_slice(value.as_bytes()),
                EntryMetadata::default(),
            ),
        )
    }

    #[test]
    fn test_split_batches() {
        let entries: Vec<_> = (0..7).map(|i| entry(&format!("k{}", i), "v")).collect();
        let batches = TransferBatch::split(3, 5, entries, 3);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[2].len(), 1);
        assert!(batches[2].is_final);
        assert!(!batches[0].is_final);
        assert!(batches.iter().all(|b| b.segment == 5 && b.topology_id == 3));
    }

    #[test]
    fn test_split_empty_segment() {
        let batches = TransferBatch::split(1, 0, Vec::new(), 16);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_empty());
        assert!(batches[0].is_final);
    }

    #[test]
    fn test_batch_filter_expired() {
        let mut expired = entry("old", "v");
        expired.entry.metadata = EntryMetadata::default().lifespan(Duration::from_millis(10));
        expired.entry.created_ms = 1;

        let batch = TransferBatch::new(1, 0, 0, vec![entry("fresh", "v"), expired], true);
        let filtered = batch.filter_expired();

        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.entries[0].key.as_ref(), b"fresh");
    }

    #[test]
    fn test_batch_serialization() {
        let batch = TransferBatch::new(4, 2, 1, vec![entry("k", "v")], false);
        let decoded = TransferBatch::from_bytes(&batch.to_bytes().unwrap()).unwrap();
        assert_eq!(batch, decoded);
    }

    #[test]
    fn test_state_only_advances() {
        let table = SegmentTransferTable::new(7, 4);
        assert_eq!(table.state(1), SegmentTransferState::Idle);

        table.advance(1, SegmentTransferState::Transferring);
        table.advance(1, SegmentTransferState::Done);
        table.advance(1, SegmentTransferState::Transferring);

        assert!(table.is_done(1));
        assert_eq!(table.segments_in(SegmentTransferState::Done), vec![1]);
        assert_eq!(table.state(99), SegmentTransferState::Idle);
    }

    #[tokio::test]
    async fn test_gate_excludes_writers() {
        let gates = std::sync::Arc::new(SegmentGates::new(4));
        let read = gates.read(2).await;

        let g = gates.clone();
        let writer = tokio::spawn(async move {
            let _w = g.write(2).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        // Other segments are independent.
        drop(gates.write(3).await);

        drop(read);
        writer.await.unwrap();
    }
}
