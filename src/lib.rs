//! Clustered in-memory key-value data grid.
//!
//! Keys hash into segments, each segment is owned by a primary and backups,
//! and membership changes move exactly the segments whose owner set changed
//! while clients keep reading and writing. Clients speak a memcached-style
//! text protocol or a binary protocol; smart binary clients receive the
//! routing topology piggybacked on responses.
//!
//! # Features
//!
//! - Minimal-movement segment ownership with capacity factors
//! - Versioned topologies, serialized per cache by a manager actor
//! - Online state transfer with dual-writes and no lost updates
//! - Text and binary wire protocols with resumable decoding
//! - Topology push for topology-aware and hash-distribution-aware clients
//! - Optional per-cache store with read-through and write-through
//!
//! # Example
//!
//! ```rust,no_run
//! use datagrid::{DataGrid, GridConfig, NodeAddress};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let members = vec![NodeAddress::new("a"), NodeAddress::new("b")];
//!     let grid = DataGrid::start(GridConfig::default(), members).await?;
//!
//!     // Any member can serve any key.
//!     let cache = grid.cache(&NodeAddress::new("a"), "default")?;
//!     cache.put("user:123", "Alice", Default::default()).await?;
//!
//!     // Expose a member to memcached-style and binary clients.
//!     let addr = grid
//!         .start_server(&NodeAddress::new("b"), "127.0.0.1:11211".parse()?)
//!         .await?;
//!     println!("serving on {}", addr);
//!
//!     // Scale out; segments move in the background.
//!     grid.join(NodeAddress::new("c")).await?;
//!     grid.await_stable().await?;
//!
//!     grid.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!   clients (text / binary)
//!            │
//!            ▼
//! ┌──────────────────────┐      ┌──────────────────────────────┐
//! │ GridServer           │      │ ClusterTopologyManager       │
//! │  GridCodec           │      │  (one actor per cache)       │
//! │  RequestDispatcher ──┼──┐   │  ConsistentHashEngine        │
//! │  Negotiator          │  │   │  RehashCoordinator           │
//! └──────────────────────┘  │   └──────────────┬───────────────┘
//!                           ▼                  │ routing view
//!                  ┌─────────────────┐         │
//!                  │ GridCache       │◄────────┘
//!                  └────────┬────────┘
//!                           │ ClusterTransport
//!                           ▼
//!                  ┌─────────────────┐
//!                  │ DataContainer   │  (per member, per cache)
//!                  └─────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Writes**: applied on the primary, then replicated to the other
//!   owners before acknowledgement. Conditional writes on one key are
//!   serialized by a striped lock.
//! - **Reads**: served by the primary of the committed (or, while a
//!   segment is in transfer, the old) topology.
//! - **Rehash**: a segment switches to its new owners only after every new
//!   owner acknowledged its copy.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod grid;
pub mod metrics;
pub mod network;
pub mod partitioning;
pub mod protocol;
pub mod rebalancing;
pub mod server;
pub mod testing;
pub mod types;

// Core exports
pub use cache::{CacheStore, GridCache, InMemoryStore};
pub use config::{
    CacheConfig, GridConfig, HashConfig, ProtocolConfig, RehashConfig, ServerConfig, StoreConfig,
    DEFAULT_CACHE_NAME,
};
pub use error::{Error, Result};
pub use grid::{DataGrid, GridNode};
pub use types::{
    CacheEntry, CacheStats, ClientIntelligence, EntryMetadata, NodeAddress, SegmentId, TopologyId,
};

// Topology exports
pub use cluster::{CacheTopology, ClusterTopologyManager, TopologyListener, ViewChange};
pub use partitioning::{ConsistentHash, ConsistentHashEngine};
pub use rebalancing::RehashCoordinator;

// Client endpoint exports
pub use protocol::{GridCodec, ProtocolKind};
pub use server::{ClientIntelligenceNegotiator, GridServer, RequestDispatcher};

// Metrics exports
pub use metrics::{GridMetrics, MetricsSnapshot};

// Testing exports
pub use testing::{ChaosConfig, ChaosController, TestCluster};
