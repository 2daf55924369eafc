//! Grid metrics.
//!
//! Counters and gauges of one node, served to clients through the `stats`
//! command and available in Prometheus exposition format.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       GridMetrics                          │
//! │  ┌──────────────────┐  ┌──────────────────────────────┐   │
//! │  │  Counters        │  │  Gauges                      │   │
//! │  │ - commands{op}   │  │ - connections                │   │
//! │  │ - hits/misses    │  │ - topology_id{cache}         │   │
//! │  │ - protocol errs  │  │ - segments_owned{cache}      │   │
//! │  │ - topology push  │  │                              │   │
//! │  └──────────────────┘  └──────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter};
pub use gauges::CacheGauge;

use crate::cluster::{CacheTopology, TopologyListener};
use crate::types::NodeAddress;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metrics of one grid node.
#[derive(Debug)]
pub struct GridMetrics {
    started: Instant,
    local: Option<NodeAddress>,
    connections: AtomicI64,

    /// Commands executed, by operation.
    pub commands: LabeledCounter,
    /// Reads that found an entry.
    pub get_hits: Counter,
    /// Reads that found nothing.
    pub get_misses: Counter,
    /// Requests rejected by the decoder.
    pub protocol_errors: Counter,
    /// Topology blocks attached to responses.
    pub topology_pushes: Counter,
    /// Connections accepted.
    pub connections_total: Counter,
    /// Topologies committed, over every cache.
    pub topologies_committed: Counter,
    /// Members excluded after failed transfers.
    pub members_excluded: Counter,
    /// Latest committed topology id of each cache.
    pub topology_id: CacheGauge,
    /// Segments the node owns in each cache's committed topology.
    pub segments_owned: CacheGauge,
}

impl GridMetrics {
    /// Create zeroed metrics that do not track segment ownership.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            local: None,
            connections: AtomicI64::new(0),
            commands: LabeledCounter::new("grid_commands_total", "Commands executed", "op"),
            get_hits: Counter::new("grid_get_hits", "Reads that found an entry"),
            get_misses: Counter::new("grid_get_misses", "Reads that found nothing"),
            protocol_errors: Counter::new(
                "grid_protocol_errors_total",
                "Requests rejected by the decoder",
            ),
            topology_pushes: Counter::new(
                "grid_topology_pushes_total",
                "Topology blocks sent to clients",
            ),
            connections_total: Counter::new("grid_connections_total", "Connections accepted"),
            topologies_committed: Counter::new(
                "grid_topologies_committed_total",
                "Topologies committed",
            ),
            members_excluded: Counter::new(
                "grid_members_excluded_total",
                "Members excluded after failed transfers",
            ),
            topology_id: CacheGauge::new("grid_topology_id", "Latest committed topology id"),
            segments_owned: CacheGauge::new(
                "grid_segments_owned",
                "Segments owned by this node",
            ),
        }
    }

    /// Create zeroed metrics of member `local`.
    pub fn for_node(local: NodeAddress) -> Self {
        Self {
            local: Some(local),
            ..Self::new()
        }
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> i64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Record an executed command.
    pub fn record_command(&self, op: &'static str) {
        self.commands.inc(op);
    }

    /// Record a read.
    pub fn record_get(&self, hit: bool) {
        if hit {
            self.get_hits.inc();
        } else {
            self.get_misses.inc();
        }
    }

    /// Record a rejected request.
    pub fn record_protocol_error(&self) {
        self.protocol_errors.inc();
    }

    /// Record a topology block sent to a client.
    pub fn record_topology_push(&self) {
        self.topology_pushes.inc();
    }

    /// Count a connection as open until the returned guard drops.
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.connections_total.inc();
        self.connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            metrics: self.clone(),
        }
    }

    /// Seconds since the metrics were created.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            commands: self.commands.get_all(),
            get_hits: self.get_hits.get(),
            get_misses: self.get_misses.get(),
            protocol_errors: self.protocol_errors.get(),
            topology_pushes: self.topology_pushes.get(),
            connections_total: self.connections_total.get(),
            connections: self.open_connections(),
            topologies_committed: self.topologies_committed.get(),
            topology_id: self.topology_id.max(),
            segments_owned: self.segments_owned.get_all(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($kind:expr, $metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $kind,
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_metric!("counter", self.get_hits);
        add_metric!("counter", self.get_misses);
        add_metric!("counter", self.protocol_errors);
        add_metric!("counter", self.topology_pushes);
        add_metric!("counter", self.connections_total);
        add_metric!("counter", self.topologies_committed);
        add_metric!("counter", self.members_excluded);

        output.push_str(&format!(
            "# HELP grid_connections Open connections\n# TYPE grid_connections gauge\ngrid_connections {}\n",
            self.open_connections()
        ));
        for gauge in [&self.topology_id, &self.segments_owned] {
            output.push_str(&format!(
                "# HELP {} {}\n# TYPE {} gauge\n",
                gauge.name(),
                gauge.help(),
                gauge.name()
            ));
            for (cache, value) in gauge.get_all() {
                output.push_str(&format!("{}{{cache=\"{}\"}} {}\n", gauge.name(), cache, value));
            }
        }

        output.push_str(&format!(
            "# HELP {} {}\n# TYPE {} counter\n",
            self.commands.name(),
            self.commands.help(),
            self.commands.name()
        ));
        for (op, count) in self.commands.get_all() {
            output.push_str(&format!(
                "{}{{{}=\"{}\"}} {}\n",
                self.commands.name(),
                self.commands.label(),
                op,
                count
            ));
        }
        output
    }
}

impl Default for GridMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyListener for GridMetrics {
    fn on_topology_committed(&self, cache: &str, topology: &Arc<CacheTopology>) {
        self.topologies_committed.inc();
        self.topology_id.set(cache, topology.topology_id as i64);
        if let Some(local) = &self.local {
            let owned = topology.hash.segments_owned_by(local).len();
            self.segments_owned.set(cache, owned as i64);
        }
    }

    fn on_members_excluded(&self, _cache: &str, members: &[NodeAddress]) {
        self.members_excluded.inc_by(members.len() as u64);
    }
}

/// Keeps a connection counted as open.
#[derive(Debug)]
pub struct ConnectionGuard {
    metrics: Arc<GridMetrics>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A snapshot of grid metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub commands: Vec<(&'static str, u64)>,
    pub get_hits: u64,
    pub get_misses: u64,
    pub protocol_errors: u64,
    pub topology_pushes: u64,
    pub connections_total: u64,
    pub connections: i64,
    pub topologies_committed: u64,
    pub topology_id: i64,
    pub segments_owned: Vec<(String, i64)>,
}

impl MetricsSnapshot {
    /// Calculate the read hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.get_hits + self.get_misses;
        if total == 0 {
            0.0
        } else {
            self.get_hits as f64 / total as f64
        }
    }

    /// Name/value pairs as reported by the `stats` command.
    pub fn stat_lines(&self) -> Vec<(String, String)> {
        let mut lines = vec![
            ("uptime".to_string(), self.uptime_secs.to_string()),
            ("curr_connections".to_string(), self.connections.to_string()),
            (
                "total_connections".to_string(),
                self.connections_total.to_string(),
            ),
            ("get_hits".to_string(), self.get_hits.to_string()),
            ("get_misses".to_string(), self.get_misses.to_string()),
            (
                "protocol_errors".to_string(),
                self.protocol_errors.to_string(),
            ),
            (
                "topology_pushes".to_string(),
                self.topology_pushes.to_string(),
            ),
            ("topology_id".to_string(), self.topology_id.to_string()),
        ];
        for (cache, owned) in &self.segments_owned {
            lines.push((format!("segments_owned_{}", cache), owned.to_string()));
        }
        for (op, count) in &self.commands {
            lines.push((format!("cmd_{}", op), count.to_string()));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::ConsistentHashEngine;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = GridMetrics::new();
        metrics.record_command("get");
        metrics.record_command("get");
        metrics.record_command("set");
        metrics.record_get(true);
        metrics.record_get(true);
        metrics.record_get(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commands, vec![("get", 2), ("set", 1)]);
        assert!((snapshot.hit_rate() - 0.666).abs() < 0.01);

        let lines = snapshot.stat_lines();
        assert!(lines.contains(&("cmd_get".to_string(), "2".to_string())));
        assert!(lines.contains(&("get_misses".to_string(), "1".to_string())));
    }

    #[test]
    fn test_connection_guard() {
        let metrics = Arc::new(GridMetrics::new());
        {
            let _a = metrics.connection_opened();
            let _b = metrics.connection_opened();
            assert_eq!(metrics.open_connections(), 2);
        }
        assert_eq!(metrics.open_connections(), 0);
        assert_eq!(metrics.connections_total.get(), 2);
    }

    #[test]
    fn test_listener_tracks_commits() {
        let metrics = GridMetrics::for_node(NodeAddress::new("a"));
        let members = vec![NodeAddress::new("a"), NodeAddress::new("b")];
        let hash = ConsistentHashEngine::compute_hash(&members, 8, 1, None).unwrap();
        let topology = Arc::new(CacheTopology::new(7, members, hash));

        metrics.on_topology_committed("default", &topology);
        assert_eq!(metrics.topology_id.get("default"), 7);
        assert_eq!(metrics.topologies_committed.get(), 1);
        let owned = topology.hash.segments_owned_by(&NodeAddress::new("a")).len() as i64;
        assert!(owned > 0 && owned < 8);
        assert_eq!(metrics.segments_owned.get("default"), owned);

        let lines = metrics.snapshot().stat_lines();
        assert!(lines.contains(&("topology_id".to_string(), "7".to_string())));
        assert!(lines.contains(&("segments_owned_default".to_string(), owned.to_string())));
        assert!(metrics
            .to_prometheus()
            .contains("grid_topology_id{cache=\"default\"} 7"));
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = GridMetrics::new();
        metrics.record_command("get");

        let output = metrics.to_prometheus();
        assert!(output.contains("grid_get_hits"));
        assert!(output.contains("grid_commands_total{op=\"get\"} 1"));
        assert!(output.contains("# TYPE grid_connections gauge"));
    }
}
