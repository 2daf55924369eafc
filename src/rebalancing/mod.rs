//! State transfer during membership changes.
//!
//! When the owner set of a segment changes, the entries of that segment are
//! copied from a live holder to every new owner while clients keep reading
//! and writing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     RehashCoordinator                         │
//! │                                                              │
//! │  for each segment whose owner set changed (bounded fan-out): │
//! │                                                              │
//! │   Idle ──begin inbound──► Transferring ──acked──► Done        │
//! │            (targets)        fetch from holder      purge on   │
//! │                             push batches           departed   │
//! │                             (retry + backoff)      holders    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Writes during a transfer
//!
//! Until a segment is `Done`, writes go to the old holders and the new
//! owners. New owners record keys written while inbound tracking is open and
//! never let a transferred entry overwrite them, so neither a newer value
//! nor a removal can be undone by the copy.
//!
//! # Cancellation
//!
//! A superseded rehash stops at a segment boundary. Segments already `Done`
//! stay with their new owners, which the next rehash treats as holders.

mod coordinator;
mod transfer;

pub use coordinator::{RehashCoordinator, RehashOutcome, RehashPlan, RehashRecord, RehashReport};
pub use transfer::{
    SegmentGates, SegmentTransferState, SegmentTransferTable, TransferBatch, TransferEntry,
    TransferProgress,
};
