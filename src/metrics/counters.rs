//! Monotonic counters.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a counter.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
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

    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters keyed by one label value, such as an operation name.
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    help: &'static str,
    label: &'static str,
    values: DashMap<&'static str, AtomicU64>,
}

impl LabeledCounter {
    /// Create a labeled counter.
    pub fn new(name: &'static str, help: &'static str, label: &'static str) -> Self {
        Self {
            name,
            help,
            label,
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

    /// Label name.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Increment the counter of `value` by one.
    pub fn inc(&self, value: &'static str) {
        if let Some(counter) = self.values.get(value) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.values
            .entry(value)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Value for one label value.
    pub fn get(&self, value: &str) -> u64 {
        self.values
            .get(value)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Every label value with its count, sorted by label value.
    pub fn get_all(&self) -> Vec<(&'static str, u64)> {
        let mut all: Vec<_> = self
            .values
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        all.sort();
        all
    }

    /// Sum over every label value.
    pub fn total(&self) -> u64 {
        self.values
            .iter()
            .map(|e| e.value().load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "A test counter");
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::new("grid_commands_total", "Commands", "op");

        counter.inc("get");
        counter.inc("get");
        counter.inc("set");

        assert_eq!(counter.get("get"), 2);
        assert_eq!(counter.get("delete"), 0);
        assert_eq!(counter.get_all(), vec![("get", 2), ("set", 1)]);
        assert_eq!(counter.total(), 3);
    }
}
