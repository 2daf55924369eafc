//! Segmented in-memory storage for one cache on one node.

use crate::partitioning::segment_for_key;
use crate::rebalancing::{TransferBatch, TransferEntry};
use crate::types::{
    now_millis, CacheEntry, CacheStats, SegmentId, StateChange, WriteCommand, WriteOutcome,
    WriteResult,
};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Segment {
    entries: HashMap<Bytes, CacheEntry>,

    /// Keys written while an inbound transfer is open. Transferred entries
    /// never overwrite them.
    touched: Option<HashSet<Bytes>>,
}

impl Segment {
    fn live(&mut self, key: &[u8], now: u64) -> Option<&mut CacheEntry> {
        if self.entries.get(key).is_some_and(|e| e.is_expired_at(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn touch(&mut self, key: &Bytes) {
        if let Some(touched) = self.touched.as_mut() {
            touched.insert(key.clone());
        }
    }
}

/// Local data container of a cache, split into the cache's segments.
///
/// Expired entries are invisible and dropped lazily on access.
pub struct DataContainer {
    segments: Vec<RwLock<Segment>>,

    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    removals: AtomicU64,
}

impl DataContainer {
    /// Create a container with `num_segments` segments.
    pub fn new(num_segments: u32) -> Self {
        Self {
            segments: (0..num_segments.max(1))
                .map(|_| RwLock::new(Segment::default()))
                .collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            removals: AtomicU64::new(0),
        }
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    /// Segment of a key.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        segment_for_key(key, self.num_segments())
    }

    fn segment(&self, segment: SegmentId) -> &RwLock<Segment> {
        &self.segments[segment as usize % self.segments.len()]
    }

    /// Read an entry, refreshing its idle timer.
    pub fn get(&self, key: &[u8]) -> Option<CacheEntry> {
        let now = now_millis();
        let mut segment = self.segment(self.segment_of(key)).write();
        let result = segment.live(key, now).map(|entry| {
            entry.last_used_ms = now;
            entry.clone()
        });

        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Read an entry without touching it or the statistics.
    pub fn peek(&self, key: &[u8]) -> Option<CacheEntry> {
        let now = now_millis();
        self.segment(self.segment_of(key))
            .read()
            .entries
            .get(key)
            .filter(|e| !e.is_expired_at(now))
            .cloned()
    }

    /// Check if a key is present and not expired.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.peek(key).is_some()
    }

    /// Execute a write command.
    pub fn execute(&self, command: WriteCommand) -> WriteOutcome {
        let now = now_millis();
        let key = command.key().clone();
        let mut segment = self.segment(self.segment_of(&key)).write();

        let outcome = match command {
            WriteCommand::Put {
                key,
                value,
                metadata,
            } => Self::store(&mut segment, key, CacheEntry::new(value, metadata)),
            WriteCommand::PutIfAbsent {
                key,
                value,
                metadata,
            } => {
                if segment.live(&key, now).is_some() {
                    not_stored()
                } else {
                    Self::store(&mut segment, key, CacheEntry::new(value, metadata))
                }
            }
            WriteCommand::Replace {
                key,
                value,
                metadata,
            } => {
                if segment.live(&key, now).is_some() {
                    Self::store(&mut segment, key, CacheEntry::new(value, metadata))
                } else {
                    not_stored()
                }
            }
            WriteCommand::Append { key, data } => match segment.live(&key, now) {
                Some(existing) => {
                    let mut value = BytesMut::with_capacity(existing.value.len() + data.len());
                    value.extend_from_slice(&existing.value);
                    value.extend_from_slice(&data);
                    let entry = existing.with_value(value.freeze());
                    Self::store(&mut segment, key, entry)
                }
                None => not_stored(),
            },
            WriteCommand::Prepend { key, data } => match segment.live(&key, now) {
                Some(existing) => {
                    let mut value = BytesMut::with_capacity(existing.value.len() + data.len());
                    value.extend_from_slice(&data);
                    value.extend_from_slice(&existing.value);
                    let entry = existing.with_value(value.freeze());
                    Self::store(&mut segment, key, entry)
                }
                None => not_stored(),
            },
            WriteCommand::Remove { key } => {
                if segment.live(&key, now).is_some() {
                    segment.entries.remove(&key);
                    segment.touch(&key);
                    WriteOutcome {
                        result: WriteResult::Removed,
                        change: StateChange::Removed,
                    }
                } else {
                    WriteOutcome {
                        result: WriteResult::NotFound,
                        change: StateChange::Unchanged,
                    }
                }
            }
            WriteCommand::Increment { key, delta } => {
                Self::count(&mut segment, key, now, |n| n.wrapping_add(delta))
            }
            WriteCommand::Decrement { key, delta } => {
                Self::count(&mut segment, key, now, |n| n.saturating_sub(delta))
            }
            WriteCommand::Apply { key, entry } => {
                segment.touch(&key);
                match entry {
                    Some(entry) if !entry.is_expired_at(now) => {
                        segment.entries.insert(key, entry.clone());
                        WriteOutcome {
                            result: WriteResult::Stored,
                            change: StateChange::Written(entry),
                        }
                    }
                    _ => {
                        segment.entries.remove(&key);
                        WriteOutcome {
                            result: WriteResult::Removed,
                            change: StateChange::Removed,
                        }
                    }
                }
            }
        };

        match outcome.change {
            StateChange::Written(_) => self.writes.fetch_add(1, Ordering::Relaxed),
            StateChange::Removed => self.removals.fetch_add(1, Ordering::Relaxed),
            StateChange::Unchanged => 0,
        };
        outcome
    }

    fn store(segment: &mut Segment, key: Bytes, entry: CacheEntry) -> WriteOutcome {
        segment.touch(&key);
        segment.entries.insert(key, entry.clone());
        WriteOutcome {
            result: WriteResult::Stored,
            change: StateChange::Written(entry),
        }
    }

    fn count<F>(segment: &mut Segment, key: Bytes, now: u64, f: F) -> WriteOutcome
    where
        F: FnOnce(u64) -> u64,
    {
        let Some(existing) = segment.live(&key, now) else {
            return WriteOutcome {
                result: WriteResult::NotFound,
                change: StateChange::Unchanged,
            };
        };

        let current = std::str::from_utf8(&existing.value)
            .ok()
            .and_then(|s| s.trim_end().parse::<u64>().ok());
        let Some(current) = current else {
            return WriteOutcome {
                result: WriteResult::NonNumeric,
                change: StateChange::Unchanged,
            };
        };

        let next = f(current);
        let entry = existing.with_value(Bytes::from(next.to_string()));
        let mut outcome = Self::store(segment, key, entry);
        outcome.result = WriteResult::Counter(next);
        outcome
    }

    /// Live entries of a segment.
    pub fn segment_entries(&self, segment: SegmentId) -> Vec<TransferEntry> {
        let now = now_millis();
        self.segment(segment)
            .read()
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired_at(now))
            .map(|(k, e)| TransferEntry::new(k.clone(), e.clone()))
            .collect()
    }

    /// Start accepting a transferred segment: drop any leftover entries and
    /// start recording written keys.
    pub fn begin_inbound(&self, segment: SegmentId) {
        let mut seg = self.segment(segment).write();
        seg.entries.clear();
        seg.touched = Some(HashSet::new());
    }

    /// Stop recording written keys for a segment.
    pub fn end_inbound(&self, segment: SegmentId) {
        self.segment(segment).write().touched = None;
    }

    /// Whether an inbound transfer is open for a segment.
    pub fn is_inbound(&self, segment: SegmentId) -> bool {
        self.segment(segment).read().touched.is_some()
    }

    /// Install transferred entries. Keys written since
    /// [`begin_inbound`](Self::begin_inbound) and expired entries are
    /// skipped. Returns the number of entries installed.
    pub fn apply_transfer(&self, batch: &TransferBatch) -> usize {
        let now = now_millis();
        let mut segment = self.segment(batch.segment).write();
        let mut applied = 0;
        for item in &batch.entries {
            if item.entry.is_expired_at(now) {
                continue;
            }
            if segment
                .touched
                .as_ref()
                .is_some_and(|t| t.contains(&item.key))
            {
                continue;
            }
            segment.entries.insert(item.key.clone(), item.entry.clone());
            applied += 1;
        }
        applied
    }

    /// Drop every entry of a segment. Returns the number removed.
    pub fn purge_segment(&self, segment: SegmentId) -> usize {
        let mut seg = self.segment(segment).write();
        let removed = seg.entries.len();
        seg.entries.clear();
        removed
    }

    /// Drop expired entries everywhere. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = now_millis();
        self.segments
            .iter()
            .map(|segment| {
                let mut seg = segment.write();
                let before = seg.entries.len();
                seg.entries.retain(|_, e| !e.is_expired_at(now));
                before - seg.entries.len()
            })
            .sum()
    }

    /// Drop every entry. Open inbound transfers keep recording.
    pub fn clear(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| {
                let mut seg = segment.write();
                let removed = seg.entries.len();
                let keys: Vec<Bytes> = seg.entries.keys().cloned().collect();
                for key in &keys {
                    seg.touch(key);
                }
                seg.entries.clear();
                removed
            })
            .sum()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = now_millis();
        self.segments
            .iter()
            .map(|s| {
                s.read()
                    .entries
                    .values()
                    .filter(|e| !e.is_expired_at(now))
                    .count()
            })
            .sum()
    }

    /// Whether the container holds no live entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live entries per segment, for segments holding any.
    pub fn segment_sizes(&self) -> HashMap<SegmentId, usize> {
        let now = now_millis();
        self.segments
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let n = s
                    .read()
                    .entries
                    .values()
                    .filter(|e| !e.is_expired_at(now))
                    .count();
                (n > 0).then_some((i as SegmentId, n))
            })
            .collect()
    }

    /// Get container statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.len() as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        }
    }
}

fn not_stored() -> WriteOutcome {
    WriteOutcome {
        result: WriteResult::NotStored,
        change: StateChange::Unchanged,
    }
}

impl std::fmt::Debug for DataContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataContainer")
            .field("segments", &self.segments.len())
            .field("entry_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryMetadata;
    use std::time::Duration;

    fn put(key: &str, value: &str) -> WriteCommand {
        WriteCommand::Put {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
            metadata: EntryMetadata::default(),
        }
    }

    fn key(k: &str) -> Bytes {
        Bytes::copy_from_slice(k.as_bytes())
    }

    #[test]
    fn test_put_and_get() {
        let container = DataContainer::new(16);
        let outcome = container.execute(put("key1", "value1"));
        assert_eq!(outcome.result, WriteResult::Stored);

        let entry = container.get(b"key1").unwrap();
        assert_eq!(entry.value.as_ref(), b"value1");
        assert!(container.get(b"missing").is_none());

        let stats = container.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
    }

    #[test]
    fn test_conditional_writes() {
        let container = DataContainer::new(4);
        let add = WriteCommand::PutIfAbsent {
            key: key("k"),
            value: Bytes::from_static(b"1"),
            metadata: EntryMetadata::default(),
        };
        assert_eq!(container.execute(add.clone()).result, WriteResult::Stored);
        assert_eq!(container.execute(add).result, WriteResult::NotStored);

        let replace = WriteCommand::Replace {
            key: key("absent"),
            value: Bytes::from_static(b"x"),
            metadata: EntryMetadata::default(),
        };
        let outcome = container.execute(replace);
        assert_eq!(outcome.result, WriteResult::NotStored);
        assert_eq!(outcome.change, StateChange::Unchanged);
    }

    #[test]
    fn test_append_prepend() {
        let container = DataContainer::new(4);
        container.execute(put("k", "mid"));
        container.execute(WriteCommand::Append {
            key: key("k"),
            data: Bytes::from_static(b"-end"),
        });
        container.execute(WriteCommand::Prepend {
            key: key("k"),
            data: Bytes::from_static(b"start-"),
        });
        assert_eq!(container.get(b"k").unwrap().value.as_ref(), b"start-mid-end");

        let outcome = container.execute(WriteCommand::Append {
            key: key("none"),
            data: Bytes::from_static(b"x"),
        });
        assert_eq!(outcome.result, WriteResult::NotStored);
    }

    #[test]
    fn test_counters() {
        let container = DataContainer::new(4);
        container.execute(put("n", "10"));

        let incr = container.execute(WriteCommand::Increment {
            key: key("n"),
            delta: 5,
        });
        assert_eq!(incr.result, WriteResult::Counter(15));

        let decr = container.execute(WriteCommand::Decrement {
            key: key("n"),
            delta: 100,
        });
        assert_eq!(decr.result, WriteResult::Counter(0));

        container.execute(put("s", "abc"));
        let bad = container.execute(WriteCommand::Increment {
            key: key("s"),
            delta: 1,
        });
        assert_eq!(bad.result, WriteResult::NonNumeric);

        let missing = container.execute(WriteCommand::Increment {
            key: key("nope"),
            delta: 1,
        });
        assert_eq!(missing.result, WriteResult::NotFound);
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let container = DataContainer::new(4);
        let mut entry = CacheEntry::new(
            Bytes::from_static(b"v"),
            EntryMetadata::default().lifespan(Duration::from_millis(5)),
        );
        entry.created_ms = 1;
        container.execute(WriteCommand::Apply {
            key: key("old"),
            entry: Some(entry),
        });

        assert!(container.get(b"old").is_none());
        assert!(container.is_empty());
    }

    #[test]
    fn test_remove() {
        let container = DataContainer::new(4);
        container.execute(put("k", "v"));

        let removed = container.execute(WriteCommand::Remove { key: key("k") });
        assert_eq!(removed.result, WriteResult::Removed);
        assert_eq!(removed.change, StateChange::Removed);

        let again = container.execute(WriteCommand::Remove { key: key("k") });
        assert_eq!(again.result, WriteResult::NotFound);
    }

    #[test]
    fn test_transfer_skips_touched_keys() {
        let container = DataContainer::new(1);
        container.begin_inbound(0);
        assert!(container.is_inbound(0));

        // Written during the transfer: newer than the snapshot.
        container.execute(WriteCommand::Apply {
            key: key("a"),
            entry: Some(CacheEntry::new(Bytes::from_static(b"new"), EntryMetadata::default())),
        });
        // Removed during the transfer: must not come back.
        container.execute(WriteCommand::Apply {
            key: key("b"),
            entry: None,
        });

        let snapshot = vec![
            TransferEntry::new(
                key("a"),
                CacheEntry::new(Bytes::from_static(b"old"), EntryMetadata::default()),
            ),
            TransferEntry::new(
                key("b"),
                CacheEntry::new(Bytes::from_static(b"gone"), EntryMetadata::default()),
            ),
            TransferEntry::new(
                key("c"),
                CacheEntry::new(Bytes::from_static(b"copied"), EntryMetadata::default()),
            ),
        ];
        let applied = container.apply_transfer(&TransferBatch::new(1, 0, 0, snapshot, true));
        container.end_inbound(0);

        assert_eq!(applied, 1);
        assert_eq!(container.get(b"a").unwrap().value.as_ref(), b"new");
        assert!(container.get(b"b").is_none());
        assert_eq!(container.get(b"c").unwrap().value.as_ref(), b"copied");
        assert!(!container.is_inbound(0));
    }

    #[test]
    fn test_segment_entries_and_purge() {
        let container = DataContainer::new(8);
        for i in 0..50 {
            container.execute(put(&format!("key-{}", i), "v"));
        }

        let sizes = container.segment_sizes();
        let (&segment, &count) = sizes.iter().next().unwrap();
        assert_eq!(container.segment_entries(segment).len(), count);

        assert_eq!(container.purge_segment(segment), count);
        assert!(container.segment_entries(segment).is_empty());
        assert_eq!(container.len(), 50 - count);

        assert_eq!(container.clear(), 50 - count);
        assert!(container.is_empty());
    }
}
