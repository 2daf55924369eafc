//! Partitioning of the key space across cluster members.
//!
//! Keys hash into a fixed number of segments, and every segment has an
//! ordered owner list. Membership changes recompute the owner lists while
//! keeping as many existing owners in place as balance allows.
//!
//! ```text
//!  key ──xxh64──► segment ──► [primary, backup, ...]
//!
//!  segment   0      1      2      3     ...
//!  owners  [a,b]  [b,c]  [c,a]  [a,b]   ...
//! ```
//!
//! # Example
//!
//! ```rust
//! use datagrid::partitioning::ConsistentHashEngine;
//! use datagrid::NodeAddress;
//!
//! let members = vec![NodeAddress::new("a"), NodeAddress::new("b"), NodeAddress::new("c")];
//! let hash = ConsistentHashEngine::compute_hash(&members, 64, 2, None).unwrap();
//!
//! let owners = hash.locate_owners(b"user:123");
//! assert_eq!(owners.len(), 2);
//! ```

mod consistent_hash;

pub use consistent_hash::{
    key_hash, segment_for_key, ConsistentHash, ConsistentHashEngine, HASH_FUNCTION_XXH64,
};
