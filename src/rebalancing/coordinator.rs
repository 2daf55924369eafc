//! Rehash coordinator.
//!
//! Moves the entries of every segment whose owner set changes between the
//! holders of the data (`source`) and a pending hash (`target`). Each segment
//! runs through `Idle -> Transferring -> Done` independently, up to
//! `max_concurrent_transfers` at a time.

use crate::config::RehashConfig;
use crate::error::{NetworkError, RehashError};
use crate::network::ClusterTransport;
use crate::partitioning::ConsistentHash;
use crate::rebalancing::transfer::{
    SegmentGates, SegmentTransferState, SegmentTransferTable, TransferBatch, TransferEntry,
    TransferProgress,
};
use crate::types::{NodeAddress, SegmentId, TopologyId};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything one rehash needs.
#[derive(Debug, Clone)]
pub struct RehashPlan {
    /// Topology being installed.
    pub topology_id: TopologyId,

    /// Live holders of the data, per segment.
    pub source: Arc<ConsistentHash>,

    /// Owners after the rehash.
    pub target: Arc<ConsistentHash>,

    /// Per-segment progress, shared with the routing view.
    pub table: Arc<SegmentTransferTable>,

    /// Cache-wide segment gates.
    pub gates: Arc<SegmentGates>,
}

impl RehashPlan {
    /// Segments whose owner set changes.
    pub fn affected_segments(&self) -> Vec<SegmentId> {
        self.source.changed_segments(&self.target)
    }
}

/// Final state of a rehash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehashOutcome {
    /// Every affected segment is done.
    Completed,
    /// Superseded before every segment started.
    Cancelled,
    /// At least one segment failed.
    Failed,
}

/// Summary of a finished rehash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RehashReport {
    /// Topology installed.
    pub topology_id: TopologyId,

    /// Segments that reached `Done`.
    pub segments_done: usize,

    /// Entries copied to new owners, summed over targets.
    pub entries_transferred: u64,

    /// Segments that had no live source and completed empty.
    pub segments_without_source: Vec<SegmentId>,
}

impl RehashReport {
    fn new(topology_id: TopologyId) -> Self {
        Self {
            topology_id,
            segments_done: 0,
            entries_transferred: 0,
            segments_without_source: Vec::new(),
        }
    }

    fn record(&mut self, progress: TransferProgress) {
        self.segments_done += 1;
        self.entries_transferred += progress.total_entries * progress.targets as u64;
        if progress.source_missing {
            self.segments_without_source.push(progress.segment);
        }
    }
}

/// A finished rehash, kept for inspection.
#[derive(Debug, Clone)]
pub struct RehashRecord {
    /// Topology the rehash was for.
    pub topology_id: TopologyId,

    /// How it ended.
    pub outcome: RehashOutcome,

    /// Segments that reached `Done`.
    pub segments_done: usize,

    /// Wall-clock duration.
    pub duration: Duration,
}

/// Orchestrates data movement for pending topologies of one cache.
#[derive(Clone)]
pub struct RehashCoordinator {
    cache: Arc<str>,
    transport: Arc<dyn ClusterTransport>,
    config: RehashConfig,
    history: Arc<RwLock<Vec<RehashRecord>>>,
    max_history: usize,
}

impl RehashCoordinator {
    /// Create a coordinator for a cache.
    pub fn new(
        cache: impl Into<Arc<str>>,
        transport: Arc<dyn ClusterTransport>,
        config: RehashConfig,
    ) -> Self {
        Self {
            cache: cache.into(),
            transport,
            config,
            history: Arc::new(RwLock::new(Vec::new())),
            max_history: 100,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RehashConfig {
        &self.config
    }

    /// Finished rehashes, oldest first.
    pub fn history(&self) -> Vec<RehashRecord> {
        self.history.read().clone()
    }

    /// Run a rehash to completion, failure or cancellation.
    ///
    /// Cancellation is checked before each segment starts; segments already
    /// running finish first.
    #[tracing::instrument(
        skip(self, plan, cancel),
        fields(cache = %self.cache, topology_id = plan.topology_id)
    )]
    pub async fn run(
        &self,
        plan: RehashPlan,
        cancel: CancellationToken,
    ) -> Result<RehashReport, RehashError> {
        let started = Instant::now();
        let topology_id = plan.topology_id;
        let segments = plan.affected_segments();
        info!(segments = segments.len(), "Starting rehash");

        let plan = Arc::new(plan);
        let mut pending = segments.into_iter();
        let mut tasks: JoinSet<Result<TransferProgress, Vec<NodeAddress>>> = JoinSet::new();
        let mut report = RehashReport::new(topology_id);
        let mut unreachable = BTreeSet::new();
        let mut crashed = false;
        let mut cancelled = false;

        loop {
            while !cancelled && tasks.len() < self.config.max_concurrent_transfers.max(1) {
                if cancel.is_cancelled() {
                    debug!("Rehash cancelled, not starting further segments");
                    cancelled = true;
                    break;
                }
                let Some(segment) = pending.next() else {
                    break;
                };
                let this = self.clone();
                let plan = plan.clone();
                tasks.spawn(async move { this.transfer_segment(&plan, segment).await });
            }

            match tasks.join_next().await {
                Some(Ok(Ok(progress))) => report.record(progress),
                Some(Ok(Err(failed))) => unreachable.extend(failed),
                Some(Err(e)) => {
                    error!(error = %e, "Segment transfer task failed");
                    crashed = true;
                }
                None => break,
            }
        }

        let outcome = if cancelled {
            RehashOutcome::Cancelled
        } else if !unreachable.is_empty() || crashed {
            RehashOutcome::Failed
        } else {
            RehashOutcome::Completed
        };
        self.record(RehashRecord {
            topology_id,
            outcome,
            segments_done: report.segments_done,
            duration: started.elapsed(),
        });

        match outcome {
            RehashOutcome::Completed => {
                info!(
                    segments = report.segments_done,
                    entries = report.entries_transferred,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Rehash complete"
                );
                Ok(report)
            }
            RehashOutcome::Cancelled => {
                info!(segments_done = report.segments_done, "Rehash cancelled");
                Err(RehashError::Cancelled(topology_id))
            }
            RehashOutcome::Failed => {
                let unreachable: Vec<NodeAddress> = unreachable.into_iter().collect();
                warn!(?unreachable, "Rehash failed");
                Err(RehashError::Failed {
                    topology_id,
                    unreachable,
                })
            }
        }
    }

    fn record(&self, record: RehashRecord) {
        let mut history = self.history.write();
        history.push(record);
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(..excess);
        }
    }

    /// Move one segment. On failure returns the nodes that could not be
    /// reached.
    async fn transfer_segment(
        &self,
        plan: &RehashPlan,
        segment: SegmentId,
    ) -> Result<TransferProgress, Vec<NodeAddress>> {
        let sources: Vec<NodeAddress> = plan.source.owners(segment).to_vec();
        let targets: Vec<NodeAddress> = plan
            .target
            .owners(segment)
            .iter()
            .filter(|o| !sources.contains(o))
            .cloned()
            .collect();
        let leavers: Vec<NodeAddress> = sources
            .iter()
            .filter(|o| !plan.target.is_owner(segment, o))
            .cloned()
            .collect();

        if sources.is_empty() {
            warn!(segment, "No live holder for segment, its entries are lost");
            let _gate = plan.gates.write(segment).await;
            plan.table.advance(segment, SegmentTransferState::Done);
            let mut progress = TransferProgress::new(segment, 0);
            progress.source_missing = true;
            return Ok(progress);
        }

        let mut unreachable = Vec::new();
        let mut receivers = Vec::with_capacity(targets.len());
        for target in &targets {
            let result = self
                .with_retry(target, segment, "begin_inbound", || {
                    self.transport.begin_inbound(target, &self.cache, segment)
                })
                .await;
            match result {
                Ok(()) => receivers.push(target.clone()),
                Err(e) => {
                    warn!(segment, %target, error = %e, "Target did not accept segment");
                    unreachable.push(target.clone());
                }
            }
        }
        {
            let _gate = plan.gates.write(segment).await;
            plan.table.advance(segment, SegmentTransferState::Transferring);
        }

        let entries = if receivers.is_empty() {
            Vec::new()
        } else {
            match self.fetch_from_sources(&sources, segment).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(segment, error = %e, "Could not read segment from any holder");
                    unreachable.extend(sources.iter().cloned());
                    return Err(unreachable);
                }
            }
        };

        let mut progress = TransferProgress::new(segment, entries.len() as u64);
        let batches = TransferBatch::split(
            plan.topology_id,
            segment,
            entries,
            self.config.batch_size,
        );

        for target in &receivers {
            let mut delivered = true;
            for batch in &batches {
                let result = self
                    .with_retry(target, segment, "push_batch", || {
                        self.transport
                            .push_batch(target, &self.cache, batch.clone())
                    })
                    .await;
                match result {
                    Ok(_) => progress.update(),
                    Err(e) => {
                        warn!(segment, %target, error = %e, "Giving up on target");
                        delivered = false;
                        break;
                    }
                }
            }
            if delivered {
                progress.targets += 1;
            } else {
                unreachable.push(target.clone());
            }
        }

        if !unreachable.is_empty() {
            return Err(unreachable);
        }

        let _gate = plan.gates.write(segment).await;
        plan.table.advance(segment, SegmentTransferState::Done);
        plan.table.record_entries(progress.total_entries * progress.targets as u64);

        for target in &receivers {
            if let Err(e) = self.transport.end_inbound(target, &self.cache, segment).await {
                debug!(segment, %target, error = %e, "Failed to close inbound tracking");
            }
        }
        for leaver in &leavers {
            match self.transport.purge_segment(leaver, &self.cache, segment).await {
                Ok(removed) => debug!(segment, node = %leaver, removed, "Purged segment"),
                Err(e) => debug!(segment, node = %leaver, error = %e, "Failed to purge segment"),
            }
        }

        debug!(segment, entries = progress.total_entries, "Segment done");
        Ok(progress)
    }

    /// Read a segment from the first holder that answers, primary first.
    async fn fetch_from_sources(
        &self,
        sources: &[NodeAddress],
        segment: SegmentId,
    ) -> Result<Vec<TransferEntry>, RehashError> {
        for source in sources {
            let result = self
                .with_retry(source, segment, "fetch_segment", || {
                    self.transport.fetch_segment(source, &self.cache, segment)
                })
                .await;
            match result {
                Ok(entries) => {
                    return Ok(entries.into_iter().filter(|e| !e.is_expired()).collect());
                }
                Err(e) => debug!(segment, %source, error = %e, "Holder unavailable"),
            }
        }
        Err(RehashError::SourceUnavailable {
            segment,
            tried: sources.to_vec(),
        })
    }

    /// Run `op` against `target` until it succeeds or attempts run out.
    async fn with_retry<T, F, Fut>(
        &self,
        target: &NodeAddress,
        segment: SegmentId,
        op_name: &'static str,
        mut op: F,
    ) -> Result<T, RehashError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match tokio::time::timeout(self.config.transfer_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    debug!(segment, %target, attempt, op = op_name, error = %e, "Attempt failed");
                }
                Err(_) => {
                    debug!(segment, %target, attempt, op = op_name, "Attempt timed out");
                }
            }

            if attempt < max_attempts {
                let backoff = self.config.backoff_for(attempt);
                let jitter = {
                    let max = (backoff.as_millis() as u64 / 10).max(1);
                    Duration::from_millis(rand::rng().random_range(0..=max))
                };
                tokio::time::sleep(backoff + jitter).await;
            }
        }

        Err(RehashError::TargetUnreachable {
            target: target.clone(),
            segment,
            attempts: max_attempts,
        })
    }
}

impl std::fmt::Debug for RehashCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RehashCoordinator")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .field("history", &self.history.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NodeContainers;
    use crate::network::{LocalTransport, NodeRequest, TransportInterceptor};
    use crate::partitioning::ConsistentHashEngine;
    use crate::types::{EntryMetadata, WriteCommand};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashSet;

    const CACHE: &str = "default";

    struct Cluster {
        transport: Arc<LocalTransport>,
        nodes: Vec<(NodeAddress, Arc<NodeContainers>)>,
    }

    impl Cluster {
        fn new(names: &[&str], num_segments: u32) -> Self {
            let transport = Arc::new(LocalTransport::new());
            let nodes = names
                .iter()
                .map(|n| {
                    let addr = NodeAddress::new(n);
                    let containers = Arc::new(NodeContainers::new(addr.clone()));
                    containers.start_cache(CACHE, num_segments);
                    transport.register(addr.clone(), containers.clone());
                    (addr, containers)
                })
                .collect();
            Self { transport, nodes }
        }

        fn node(&self, name: &str) -> &Arc<NodeContainers> {
            &self.nodes.iter().find(|(a, _)| a.as_str() == name).unwrap().1
        }

        fn members(&self, names: &[&str]) -> Vec<NodeAddress> {
            names.iter().map(|n| NodeAddress::new(n)).collect()
        }

        /// Write `count` keys to their owners in `hash`.
        fn load(&self, hash: &ConsistentHash, count: usize) {
            for i in 0..count {
                let key = Bytes::from(format!("key-{}", i));
                for owner in hash.locate_owners(&key) {
                    self.node(owner.as_str())
                        .container(CACHE)
                        .unwrap()
                        .execute(WriteCommand::Put {
                            key: key.clone(),
                            value: Bytes::from(format!("value-{}", i)),
                            metadata: EntryMetadata::default(),
                        });
                }
            }
        }
    }

    fn plan(id: TopologyId, source: ConsistentHash, target: ConsistentHash) -> RehashPlan {
        let n = target.num_segments();
        RehashPlan {
            topology_id: id,
            source: Arc::new(source),
            target: Arc::new(target),
            table: Arc::new(SegmentTransferTable::new(id, n)),
            gates: Arc::new(SegmentGates::new(n)),
        }
    }

    fn fast_config() -> RehashConfig {
        RehashConfig::default()
            .with_batch_size(7)
            .with_retry(3, Duration::from_millis(1))
            .with_transfer_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_join_moves_segments_to_new_owner() {
        let cluster = Cluster::new(&["a", "b", "c"], 16);
        let old = ConsistentHashEngine::compute_hash(&cluster.members(&["a", "b"]), 16, 2, None)
            .unwrap();
        cluster.load(&old, 200);

        let new = ConsistentHashEngine::compute_hash(
            &cluster.members(&["a", "b", "c"]),
            16,
            2,
            Some(&old),
        )
        .unwrap();
        let plan = plan(1, old.clone(), new.clone());
        let affected = plan.affected_segments();
        let table = plan.table.clone();

        let coordinator = RehashCoordinator::new(CACHE, cluster.transport.clone(), fast_config());
        let report = coordinator
            .run(plan, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.segments_done, affected.len());
        assert!(affected.iter().all(|&s| table.is_done(s)));

        for i in 0..200 {
            let key = format!("key-{}", i);
            for owner in new.locate_owners(key.as_bytes()) {
                let entry = cluster
                    .node(owner.as_str())
                    .container(CACHE)
                    .unwrap()
                    .peek(key.as_bytes());
                assert!(entry.is_some(), "{} missing on {}", key, owner);
            }
        }

        // Departed owners purged what they lost.
        for (addr, containers) in &cluster.nodes {
            let container = containers.container(CACHE).unwrap();
            for (segment, _) in container.segment_sizes() {
                assert!(new.is_owner(segment, addr));
            }
        }
        assert_eq!(coordinator.history()[0].outcome, RehashOutcome::Completed);
    }

    #[tokio::test]
    async fn test_segment_without_source_completes_empty() {
        let cluster = Cluster::new(&["b"], 4);
        let source = ConsistentHash::from_owners(1, vec![vec![], vec![], vec![], vec![]]);
        let target =
            ConsistentHashEngine::compute_hash(&cluster.members(&["b"]), 4, 1, None).unwrap();

        let coordinator = RehashCoordinator::new(CACHE, cluster.transport.clone(), fast_config());
        let report = coordinator
            .run(plan(2, source, target), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.segments_done, 4);
        assert_eq!(report.segments_without_source.len(), 4);
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_rehash() {
        let cluster = Cluster::new(&["a"], 8);
        let old =
            ConsistentHashEngine::compute_hash(&cluster.members(&["a"]), 8, 2, None).unwrap();
        cluster.load(&old, 50);
        let new = ConsistentHashEngine::compute_hash(
            &cluster.members(&["a", "ghost"]),
            8,
            2,
            Some(&old),
        )
        .unwrap();

        let coordinator = RehashCoordinator::new(CACHE, cluster.transport.clone(), fast_config());
        let result = coordinator
            .run(plan(3, old, new), CancellationToken::new())
            .await;

        match result {
            Err(RehashError::Failed {
                topology_id,
                unreachable,
            }) => {
                assert_eq!(topology_id, 3);
                assert_eq!(unreachable, vec![NodeAddress::new("ghost")]);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(coordinator.history()[0].outcome, RehashOutcome::Failed);
    }

    struct FlakyPushes {
        failures_left: parking_lot::Mutex<u32>,
    }

    #[async_trait]
    impl TransportInterceptor for FlakyPushes {
        async fn before_send(
            &self,
            target: &NodeAddress,
            request: &NodeRequest,
        ) -> Result<(), NetworkError> {
            if matches!(request, NodeRequest::PushBatch { .. }) {
                let mut left = self.failures_left.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(NetworkError::NodeUnreachable(target.clone()));
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let cluster = Cluster::new(&["a", "b"], 4);
        let old =
            ConsistentHashEngine::compute_hash(&cluster.members(&["a"]), 4, 1, None).unwrap();
        cluster.load(&old, 40);
        let new =
            ConsistentHashEngine::compute_hash(&cluster.members(&["a", "b"]), 4, 1, Some(&old))
                .unwrap();

        cluster.transport.set_interceptor(Arc::new(FlakyPushes {
            failures_left: parking_lot::Mutex::new(2),
        }));
        let config = fast_config().with_max_concurrent_transfers(1);
        let coordinator = RehashCoordinator::new(CACHE, cluster.transport.clone(), config);
        let report = coordinator
            .run(plan(4, old, new), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.segments_done, 2);
        let b = cluster.node("b").container(CACHE).unwrap();
        assert!(!b.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cluster = Cluster::new(&["a", "b"], 8);
        let old =
            ConsistentHashEngine::compute_hash(&cluster.members(&["a"]), 8, 1, None).unwrap();
        let new =
            ConsistentHashEngine::compute_hash(&cluster.members(&["a", "b"]), 8, 1, Some(&old))
                .unwrap();
        let plan = plan(5, old, new);
        let table = plan.table.clone();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let coordinator = RehashCoordinator::new(CACHE, cluster.transport.clone(), fast_config());
        let result = coordinator.run(plan, cancel).await;

        assert_eq!(result, Err(RehashError::Cancelled(5)));
        let done: HashSet<_> = table
            .segments_in(SegmentTransferState::Done)
            .into_iter()
            .collect();
        assert!(done.is_empty());
    }
}
