//! Per-cache gauges.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Latest value of one quantity in each cache, such as the committed
/// topology id or the number of segments a node owns.
#[derive(Debug)]
pub struct CacheGauge {
    name: &'static str,
    help: &'static str,
    values: DashMap<String, AtomicI64>,
}

impl CacheGauge {
    /// Create a gauge with no caches.
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            values: DashMap::new(),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Set the value of `cache`.
    pub fn set(&self, cache: &str, value: i64) {
        if let Some(gauge) = self.values.get(cache) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        self.values
            .entry(cache.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Value of `cache`; 0 until first set.
    pub fn get(&self, cache: &str) -> i64 {
        self.values
            .get(cache)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Largest value over every cache.
    pub fn max(&self) -> i64 {
        self.values
            .iter()
            .map(|e| e.value().load(Ordering::Relaxed))
            .max()
            .unwrap_or(0)
    }

    /// Every cache with its value, sorted by cache name.
    pub fn get_all(&self) -> Vec<(String, i64)> {
        let mut all: Vec<_> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        all.sort();
        all
    }
}
