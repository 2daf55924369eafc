//! Core types used throughout the data grid.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Index of a segment in `[0, num_segments)`.
pub type SegmentId = u32;

/// Version number of a cache topology.
pub type TopologyId = u32;

/// Identity of a cluster member.
///
/// Equality and ordering are by identifier only; ordering is used for
/// deterministic tie-breaking.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress(Arc<str>);

impl NodeAddress {
    /// Create an address from an identifier.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeAddress {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// A client's declared ability to consume routing metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientIntelligence {
    /// No routing metadata.
    #[default]
    Basic,
    /// Wants the server list.
    TopologyAware,
    /// Wants the server list and the segment ownership layout.
    HashDistributionAware,
}

impl ClientIntelligence {
    /// Wire code of the intelligence level.
    pub fn code(self) -> u8 {
        match self {
            ClientIntelligence::Basic => 0x01,
            ClientIntelligence::TopologyAware => 0x02,
            ClientIntelligence::HashDistributionAware => 0x03,
        }
    }

    /// Parse a wire code; unknown codes fall back to `Basic`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x02 => ClientIntelligence::TopologyAware,
            0x03 => ClientIntelligence::HashDistributionAware,
            _ => ClientIntelligence::Basic,
        }
    }
}

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-entry metadata supplied by writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Opaque client flags (memcached).
    pub flags: u32,
    /// Lifespan in milliseconds, `None` for immortal entries.
    pub lifespan_ms: Option<u64>,
    /// Maximum idle time in milliseconds.
    pub max_idle_ms: Option<u64>,
}

impl EntryMetadata {
    /// Metadata with client flags only.
    pub fn with_flags(flags: u32) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    /// Set the lifespan.
    pub fn lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan_ms = Some(lifespan.as_millis() as u64);
        self
    }

    /// Set the maximum idle time.
    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle_ms = Some(max_idle.as_millis() as u64);
        self
    }
}

/// A stored value with its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The value.
    pub value: Bytes,
    /// Writer-supplied metadata.
    pub metadata: EntryMetadata,
    /// Creation time, ms since epoch.
    pub created_ms: u64,
    /// Last access time, ms since epoch.
    pub last_used_ms: u64,
}

impl CacheEntry {
    /// Create an entry stamped with the current time.
    pub fn new(value: Bytes, metadata: EntryMetadata) -> Self {
        let now = now_millis();
        Self {
            value,
            metadata,
            created_ms: now,
            last_used_ms: now,
        }
    }

    /// Replace the value in place: metadata and creation time are kept, so
    /// the lifespan is not extended.
    pub fn with_value(&self, value: Bytes) -> Self {
        Self {
            value,
            metadata: self.metadata,
            created_ms: self.created_ms,
            last_used_ms: now_millis(),
        }
    }

    /// Absolute expiration time in ms since epoch, if any.
    pub fn expires_at_ms(&self) -> Option<u64> {
        let by_lifespan = self.metadata.lifespan_ms.map(|l| self.created_ms + l);
        let by_idle = self.metadata.max_idle_ms.map(|i| self.last_used_ms + i);
        match (by_lifespan, by_idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Whether the entry has expired at `now_ms`.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms().is_some_and(|at| at <= now_ms)
    }

    /// Whether the entry has expired now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }
}

/// Write commands executed against a node's data container.
///
/// Conditional commands run on one owner; the resulting state is then
/// replicated to the remaining owners as [`WriteCommand::Apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteCommand {
    /// Unconditional store.
    Put {
        key: Bytes,
        value: Bytes,
        metadata: EntryMetadata,
    },
    /// Store only when absent.
    PutIfAbsent {
        key: Bytes,
        value: Bytes,
        metadata: EntryMetadata,
    },
    /// Store only when present.
    Replace {
        key: Bytes,
        value: Bytes,
        metadata: EntryMetadata,
    },
    /// Append to an existing value.
    Append { key: Bytes, data: Bytes },
    /// Prepend to an existing value.
    Prepend { key: Bytes, data: Bytes },
    /// Remove a key.
    Remove { key: Bytes },
    /// Add to a numeric value.
    Increment { key: Bytes, delta: u64 },
    /// Subtract from a numeric value, saturating at zero.
    Decrement { key: Bytes, delta: u64 },
    /// Install the state produced by a command on another owner.
    Apply { key: Bytes, entry: Option<CacheEntry> },
}

impl WriteCommand {
    /// The key the command targets.
    pub fn key(&self) -> &Bytes {
        match self {
            WriteCommand::Put { key, .. }
            | WriteCommand::PutIfAbsent { key, .. }
            | WriteCommand::Replace { key, .. }
            | WriteCommand::Append { key, .. }
            | WriteCommand::Prepend { key, .. }
            | WriteCommand::Remove { key }
            | WriteCommand::Increment { key, .. }
            | WriteCommand::Decrement { key, .. }
            | WriteCommand::Apply { key, .. } => key,
        }
    }

    /// Serialize command to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize command from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Result of a write command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteResult {
    /// The value was stored.
    Stored,
    /// The condition did not hold; nothing changed.
    NotStored,
    /// The key was removed.
    Removed,
    /// The key does not exist.
    NotFound,
    /// New value of a counter.
    Counter(u64),
    /// Increment/decrement on a value that is not a decimal number.
    NonNumeric,
}

/// State change a command produced, to be replicated to other owners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateChange {
    /// Nothing changed.
    Unchanged,
    /// The key now holds this entry.
    Written(CacheEntry),
    /// The key was removed.
    Removed,
}

impl StateChange {
    /// The command that installs this change elsewhere.
    pub fn into_apply(self, key: Bytes) -> Option<WriteCommand> {
        match self {
            StateChange::Unchanged => None,
            StateChange::Written(entry) => Some(WriteCommand::Apply {
                key,
                entry: Some(entry),
            }),
            StateChange::Removed => Some(WriteCommand::Apply { key, entry: None }),
        }
    }
}

/// Outcome of executing a write command on one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// What the command reports to the caller.
    pub result: WriteResult,
    /// What must be replicated.
    pub change: StateChange,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries in the local container.
    pub entry_count: u64,
    /// Number of read hits.
    pub hits: u64,
    /// Number of read misses.
    pub misses: u64,
    /// Number of writes applied.
    pub writes: u64,
    /// Number of removals applied.
    pub removals: u64,
}
