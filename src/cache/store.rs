//! Persistence collaborator for a cache.
//!
//! A [`CacheStore`] sits behind the in-memory containers: writes go through
//! to it and misses are read through from it. Durability is up to the
//! implementation.

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::types::CacheEntry;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Backing store of one cache.
#[async_trait]
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    /// Load an entry.
    async fn load(&self, key: &[u8]) -> StoreResult<Option<CacheEntry>>;

    /// Store (create or overwrite) an entry.
    async fn store(&self, key: Bytes, entry: CacheEntry) -> StoreResult<()>;

    /// Remove an entry. Returns whether it existed.
    async fn remove(&self, key: &[u8]) -> StoreResult<bool>;

    /// Remove every entry.
    async fn clear(&self) -> StoreResult<()>;

    /// Remove expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> StoreResult<usize>;
}

/// A store wrapped with its configuration.
#[derive(Debug, Clone)]
pub struct ConfiguredStore {
    store: Arc<dyn CacheStore>,
    config: StoreConfig,
}

impl ConfiguredStore {
    /// Wrap a store, purging it first if configured to.
    pub async fn open(store: Arc<dyn CacheStore>, config: StoreConfig) -> StoreResult<Self> {
        if config.purge_on_startup {
            debug!("Purging cache store on startup");
            store.clear().await?;
        }
        Ok(Self { store, config })
    }

    /// Read an entry, ignoring expired ones.
    pub async fn load(&self, key: &[u8]) -> StoreResult<Option<CacheEntry>> {
        Ok(self.store.load(key).await?.filter(|e| !e.is_expired()))
    }

    /// Write through, unless modifications are ignored.
    pub async fn write(&self, key: Bytes, entry: Option<CacheEntry>) -> StoreResult<()> {
        if self.config.ignore_modifications {
            return Ok(());
        }
        match entry {
            Some(entry) => self.store.store(key, entry).await,
            None => self.store.remove(&key).await.map(|_| ()),
        }
    }

    /// Clear, unless modifications are ignored.
    pub async fn clear(&self) -> StoreResult<()> {
        if self.config.ignore_modifications {
            return Ok(());
        }
        self.store.clear().await
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }
}

/// In-memory store, for tests and single-process setups.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<Bytes, CacheEntry>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn load(&self, key: &[u8]) -> StoreResult<Option<CacheEntry>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn store(&self, key: Bytes, entry: CacheEntry) -> StoreResult<()> {
        self.entries.write().insert(key, entry);
        Ok(())
    }

    async fn remove(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.entries.write().clear();
        Ok(())
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryMetadata;
    use std::time::Duration;

    fn entry(value: &'static str) -> CacheEntry {
        CacheEntry::new(Bytes::from_static(value.as_bytes()), EntryMetadata::default())
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStore::new();
        store.store(Bytes::from_static(b"a"), entry("1")).await.unwrap();

        assert_eq!(store.load(b"a").await.unwrap().unwrap().value, "1");
        assert!(store.remove(b"a").await.unwrap());
        assert!(!store.remove(b"a").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_purge_on_startup() {
        let store = Arc::new(InMemoryStore::new());
        store.store(Bytes::from_static(b"a"), entry("1")).await.unwrap();

        ConfiguredStore::open(store.clone(), StoreConfig::default().purge_on_startup(true))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_ignore_modifications() {
        let store = Arc::new(InMemoryStore::new());
        let configured = ConfiguredStore::open(
            store.clone(),
            StoreConfig::default().ignore_modifications(true),
        )
        .await
        .unwrap();

        configured
            .write(Bytes::from_static(b"a"), Some(entry("1")))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_loaded() {
        let store = Arc::new(InMemoryStore::new());
        let mut expired = entry("1");
        expired.metadata = expired.metadata.lifespan(Duration::from_millis(1));
        expired.created_ms = expired.created_ms.saturating_sub(1_000);
        store.store(Bytes::from_static(b"a"), expired).await.unwrap();

        let configured = ConfiguredStore::open(store.clone(), StoreConfig::default())
            .await
            .unwrap();
        assert!(configured.load(b"a").await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }
}
