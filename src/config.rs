//! Configuration types for the data grid.
//!
//! One struct per concern, composed by [`GridConfig`]. Every struct has a
//! `Default` and `with_*` builder methods.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Name of the cache served when a protocol carries no cache name.
pub const DEFAULT_CACHE_NAME: &str = "default";

/// Top-level configuration of a data grid.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Cache definitions by name.
    pub caches: BTreeMap<String, CacheConfig>,

    /// Wire protocol limits.
    pub protocol: ProtocolConfig,

    /// Client endpoint settings.
    pub server: ServerConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        let mut caches = BTreeMap::new();
        caches.insert(DEFAULT_CACHE_NAME.to_string(), CacheConfig::default());
        Self {
            caches,
            protocol: ProtocolConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl GridConfig {
    /// Create a configuration with the default cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define (or redefine) a cache.
    pub fn with_cache(mut self, name: impl Into<String>, config: CacheConfig) -> Self {
        self.caches.insert(name.into(), config);
        self
    }

    /// Set protocol limits.
    pub fn with_protocol_config(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set endpoint settings.
    pub fn with_server_config(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> crate::Result<()> {
        if self.caches.is_empty() {
            return Err(crate::Error::Config("at least one cache must be defined".into()));
        }
        for (name, cache) in &self.caches {
            if cache.hash.num_segments == 0 {
                return Err(crate::Error::Config(format!(
                    "cache '{}': num_segments must be positive",
                    name
                )));
            }
            if cache.hash.num_owners == 0 {
                return Err(crate::Error::Config(format!(
                    "cache '{}': num_owners must be positive",
                    name
                )));
            }
            if cache.rehash.max_attempts == 0 {
                return Err(crate::Error::Config(format!(
                    "cache '{}': max_attempts must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Configuration of one cache.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Segment ownership settings.
    pub hash: HashConfig,

    /// State transfer settings.
    pub rehash: RehashConfig,

    /// Persistence collaborator settings, if the cache is backed by a store.
    pub store: Option<StoreConfig>,

    /// Lifespan applied to writes that do not carry one.
    pub default_lifespan: Option<Duration>,
}

impl CacheConfig {
    /// Create a cache configuration with the given ownership layout.
    pub fn new(num_segments: u32, num_owners: u32) -> Self {
        Self {
            hash: HashConfig::new(num_segments, num_owners),
            ..Default::default()
        }
    }

    /// Set the rehash configuration.
    pub fn with_rehash_config(mut self, rehash: RehashConfig) -> Self {
        self.rehash = rehash;
        self
    }

    /// Back the cache with a store.
    pub fn with_store_config(mut self, store: StoreConfig) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the default lifespan.
    pub fn with_default_lifespan(mut self, lifespan: Duration) -> Self {
        self.default_lifespan = Some(lifespan);
        self
    }

    /// Set the virtual-node count reported to clients.
    pub fn with_virtual_nodes(mut self, virtual_nodes: u32) -> Self {
        self.hash.virtual_nodes = virtual_nodes;
        self
    }
}

/// Segment ownership configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashConfig {
    /// Number of segments the key space is split into.
    pub num_segments: u32,

    /// Number of owners (primary + backups) per segment.
    pub num_owners: u32,

    /// Virtual-node count advertised to hash-aware clients.
    pub virtual_nodes: u32,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            num_segments: 256,
            num_owners: 2,
            virtual_nodes: 1,
        }
    }
}

impl HashConfig {
    /// Create a hash configuration.
    pub fn new(num_segments: u32, num_owners: u32) -> Self {
        Self {
            num_segments,
            num_owners,
            ..Default::default()
        }
    }
}

/// State transfer configuration.
#[derive(Debug, Clone)]
pub struct RehashConfig {
    /// Maximum entries per transfer batch.
    pub batch_size: usize,

    /// Maximum segments transferred concurrently.
    pub max_concurrent_transfers: usize,

    /// Delivery attempts per target before it is reported unreachable.
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubled on each further attempt.
    pub base_backoff: Duration,

    /// Upper bound on the backoff.
    pub max_backoff: Duration,

    /// Timeout of a single delivery attempt.
    pub transfer_timeout: Duration,
}

impl Default for RehashConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            max_concurrent_transfers: 4,
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            transfer_timeout: Duration::from_secs(10),
        }
    }
}

impl RehashConfig {
    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the transfer concurrency.
    pub fn with_max_concurrent_transfers(mut self, n: usize) -> Self {
        self.max_concurrent_transfers = n.max(1);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, max_attempts: u32, base_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_backoff = base_backoff;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Backoff to wait after `attempt` failed attempts (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Wire protocol limits.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Maximum key length in bytes.
    pub max_key_len: usize,

    /// Maximum value length in bytes.
    pub max_value_len: usize,

    /// Maximum text command line length in bytes (without the data block).
    pub max_line_len: usize,

    /// Maximum cache name length in bytes.
    pub max_cache_name_len: usize,

    /// Accept a bare `LF` as text line terminator.
    pub accept_bare_lf: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_key_len: 250,
            max_value_len: 1024 * 1024,
            max_line_len: 2048,
            max_cache_name_len: 255,
            accept_bare_lf: true,
        }
    }
}

impl ProtocolConfig {
    /// Set the maximum key length.
    pub fn with_max_key_len(mut self, len: usize) -> Self {
        self.max_key_len = len;
        self
    }

    /// Set the maximum value length.
    pub fn with_max_value_len(mut self, len: usize) -> Self {
        self.max_value_len = len;
        self
    }

    /// Require strict `CR LF` terminators.
    pub fn strict_line_endings(mut self) -> Self {
        self.accept_bare_lf = false;
        self
    }
}

/// Client endpoint settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind for client connections.
    pub bind_addr: SocketAddr,

    /// Cache served to text-protocol clients.
    pub default_cache: String,

    /// Version string reported by `version`.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 11222)),
            default_cache: DEFAULT_CACHE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create endpoint settings for an address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Set the cache served to text clients.
    pub fn with_default_cache(mut self, name: impl Into<String>) -> Self {
        self.default_cache = name.into();
        self
    }
}

/// Persistence collaborator settings.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Clear the store when the cache starts.
    pub purge_on_startup: bool,

    /// Never write modifications to the store (read-only store).
    pub ignore_modifications: bool,
}

impl StoreConfig {
    /// Purge the store when the cache starts.
    pub fn purge_on_startup(mut self, enabled: bool) -> Self {
        self.purge_on_startup = enabled;
        self
    }

    /// Treat the store as read-only.
    pub fn ignore_modifications(mut self, enabled: bool) -> Self {
        self.ignore_modifications = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GridConfig::default();
        assert!(config.caches.contains_key(DEFAULT_CACHE_NAME));
        assert_eq!(config.caches[DEFAULT_CACHE_NAME].hash.num_owners, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = GridConfig::new()
            .with_cache("users", CacheConfig::new(12, 2).with_virtual_nodes(4))
            .with_protocol_config(ProtocolConfig::default().with_max_key_len(16));

        assert_eq!(config.caches["users"].hash.num_segments, 12);
        assert_eq!(config.caches["users"].hash.virtual_nodes, 4);
        assert_eq!(config.protocol.max_key_len, 16);
    }

    #[test]
    fn test_invalid_config() {
        let config = GridConfig::new().with_cache("bad", CacheConfig::new(0, 2));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let rehash = RehashConfig {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(rehash.backoff_for(1), Duration::from_millis(100));
        assert_eq!(rehash.backoff_for(2), Duration::from_millis(200));
        assert_eq!(rehash.backoff_for(3), Duration::from_millis(350));
        assert_eq!(rehash.backoff_for(30), Duration::from_millis(350));
    }
}
