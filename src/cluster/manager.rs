//! Per-cache topology manager.
//!
//! A single actor task per cache consumes membership views and rehash
//! completions in order, so topology transitions of one cache never race.
//! Readers use the published [`RoutingView`] without talking to the actor.

use crate::cluster::events::{TopologyListener, ViewChange};
use crate::cluster::topology::{
    CacheTopology, PendingRoute, RoutingView, TopologyHistory, TopologyPhase,
};
use crate::config::HashConfig;
use crate::error::{RehashError, TopologyError};
use crate::partitioning::{ConsistentHash, ConsistentHashEngine};
use crate::rebalancing::{
    RehashCoordinator, RehashPlan, RehashReport, SegmentGates, SegmentTransferTable,
};
use crate::types::{NodeAddress, TopologyId};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Number of committed topologies kept per cache.
const MAX_HISTORY: usize = 64;

/// Capacity of the commit feed.
const COMMIT_FEED_CAPACITY: usize = 64;

enum TopologyCommand {
    ViewChanged {
        view: ViewChange,
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

struct RehashCompletion {
    topology_id: TopologyId,
    result: Result<RehashReport, RehashError>,
}

struct Shared {
    cache: Arc<str>,
    routing: RwLock<Arc<RoutingView>>,
    history: RwLock<TopologyHistory>,
    listeners: RwLock<Vec<Arc<dyn TopologyListener>>>,
    commits: broadcast::Sender<Arc<CacheTopology>>,
    phase: watch::Sender<TopologyPhase>,
}

impl Shared {
    fn publish(&self, view: RoutingView, phase: TopologyPhase) {
        *self.routing.write() = Arc::new(view);
        self.phase.send_replace(phase);
    }
}

/// Owns the topology of one cache and drives its rehashes.
pub struct ClusterTopologyManager {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<TopologyCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterTopologyManager {
    /// Start the manager with the initial membership.
    ///
    /// The initial topology has id 0 and is committed without a rehash.
    pub fn start(
        cache: impl Into<Arc<str>>,
        hash_config: HashConfig,
        coordinator: RehashCoordinator,
        initial: ViewChange,
    ) -> Result<Self, TopologyError> {
        let cache: Arc<str> = cache.into();
        let hash = ConsistentHashEngine::compute_weighted(
            &initial.members,
            |m| initial.capacity_of(m),
            hash_config.num_segments,
            hash_config.num_owners,
            None,
        )?;
        let current = Arc::new(CacheTopology::new(0, initial.members.clone(), hash));
        let gates = Arc::new(SegmentGates::new(hash_config.num_segments));

        let mut history = TopologyHistory::new(MAX_HISTORY);
        history.push(current.clone());

        let (commits, _) = broadcast::channel(COMMIT_FEED_CAPACITY);
        let (phase, _) = watch::channel(TopologyPhase::Stable);
        let shared = Arc::new(Shared {
            cache: cache.clone(),
            routing: RwLock::new(Arc::new(RoutingView::stable(current, gates.clone()))),
            history: RwLock::new(history),
            listeners: RwLock::new(Vec::new()),
            commits,
            phase,
        });

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let actor = ManagerActor {
            shared: shared.clone(),
            hash_config,
            coordinator,
            gates,
            commands: commands_rx,
            completions: completion_rx,
            completion_tx,
            view: initial,
            next_topology_id: 1,
            active: None,
        };

        info!(cache = %cache, "Topology manager started");
        let task = tokio::spawn(actor.run());

        Ok(Self {
            shared,
            commands: commands_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Name of the managed cache.
    pub fn cache_name(&self) -> &str {
        &self.shared.cache
    }

    /// The committed topology.
    pub fn current_topology(&self) -> Arc<CacheTopology> {
        self.shared.routing.read().current.clone()
    }

    /// The topology being installed, if any.
    pub fn pending_topology(&self) -> Option<Arc<CacheTopology>> {
        self.shared
            .routing
            .read()
            .pending
            .as_ref()
            .map(|p| p.topology.clone())
    }

    /// What client operations route against.
    pub fn routing_view(&self) -> Arc<RoutingView> {
        self.shared.routing.read().clone()
    }

    /// A committed topology by id, while retained.
    pub fn topology(&self, topology_id: TopologyId) -> Option<Arc<CacheTopology>> {
        self.shared.history.read().get(topology_id)
    }

    /// Ids of the retained committed topologies.
    pub fn history_ids(&self) -> Vec<TopologyId> {
        self.shared.history.read().ids()
    }

    /// Current phase.
    pub fn phase(&self) -> TopologyPhase {
        *self.shared.phase.borrow()
    }

    /// Feed of committed topologies.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CacheTopology>> {
        self.shared.commits.subscribe()
    }

    /// Register a listener for committed topologies.
    pub fn add_listener(&self, listener: Arc<dyn TopologyListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Deliver a membership view. Returns once the manager has acted on it
    /// (a rehash may still be running).
    pub async fn membership_changed(&self, view: ViewChange) -> Result<(), TopologyError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(TopologyCommand::ViewChanged { view, ack })
            .map_err(|_| TopologyError::ManagerStopped(self.cache_name().to_string()))?;
        done.await
            .map_err(|_| TopologyError::ManagerStopped(self.cache_name().to_string()))
    }

    /// Wait until no rehash is in flight.
    pub async fn await_stable(&self) -> Result<Arc<CacheTopology>, TopologyError> {
        let mut phase = self.shared.phase.subscribe();
        phase
            .wait_for(|p| *p == TopologyPhase::Stable)
            .await
            .map_err(|_| TopologyError::ManagerStopped(self.cache_name().to_string()))?;
        Ok(self.current_topology())
    }

    /// Stop the actor, cancelling any rehash in flight.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(TopologyCommand::Shutdown { ack }).is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for ClusterTopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.routing_view();
        f.debug_struct("ClusterTopologyManager")
            .field("cache", &self.shared.cache)
            .field("current", &view.current.topology_id)
            .field("pending", &view.pending.as_ref().map(|p| p.topology.topology_id))
            .finish()
    }
}

struct ActiveRehash {
    pending: Arc<CacheTopology>,
    source: Arc<ConsistentHash>,
    table: Arc<SegmentTransferTable>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ManagerActor {
    shared: Arc<Shared>,
    hash_config: HashConfig,
    coordinator: RehashCoordinator,
    gates: Arc<SegmentGates>,
    commands: mpsc::UnboundedReceiver<TopologyCommand>,
    completions: mpsc::UnboundedReceiver<RehashCompletion>,
    completion_tx: mpsc::UnboundedSender<RehashCompletion>,
    view: ViewChange,
    next_topology_id: TopologyId,
    active: Option<ActiveRehash>,
}

impl ManagerActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(TopologyCommand::ViewChanged { view, ack }) => {
                        self.on_view(view).await;
                        let _ = ack.send(());
                    }
                    Some(TopologyCommand::Shutdown { ack }) => {
                        self.stop_active().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.stop_active().await;
                        break;
                    }
                },
                Some(completion) = self.completions.recv() => {
                    self.on_rehash_completed(completion).await;
                }
            }
        }
        debug!(cache = %self.shared.cache, "Topology manager stopped");
    }

    async fn on_view(&mut self, view: ViewChange) {
        if self.view.same_membership(&view) {
            debug!(
                cache = %self.shared.cache,
                view_id = view.view_id,
                "Membership unchanged, ignoring view"
            );
            return;
        }
        info!(
            cache = %self.shared.cache,
            view_id = view.view_id,
            kind = ?view.kind,
            members = view.members.len(),
            "Membership changed"
        );
        self.view = view;
        self.rebalance().await;
    }

    async fn on_rehash_completed(&mut self, completion: RehashCompletion) {
        let is_active = self
            .active
            .as_ref()
            .is_some_and(|a| a.pending.topology_id == completion.topology_id);
        if !is_active {
            debug!(
                cache = %self.shared.cache,
                topology_id = completion.topology_id,
                "Ignoring completion of superseded rehash"
            );
            return;
        }

        match completion.result {
            Ok(report) => self.commit(report),
            Err(RehashError::Failed { unreachable, .. }) if !unreachable.is_empty() => {
                warn!(
                    cache = %self.shared.cache,
                    topology_id = completion.topology_id,
                    ?unreachable,
                    "Excluding members that could not receive state"
                );
                let listeners = self.shared.listeners.read().clone();
                for listener in &listeners {
                    listener.on_members_excluded(&self.shared.cache, &unreachable);
                }
                self.view = self.view.without(&unreachable, self.view.view_id);
                self.rebalance().await;
            }
            Err(e) => {
                warn!(
                    cache = %self.shared.cache,
                    topology_id = completion.topology_id,
                    error = %e,
                    "Rehash failed, retrying"
                );
                self.rebalance().await;
            }
        }
    }

    /// Cancel any rehash in flight and start one towards the latest view.
    async fn rebalance(&mut self) {
        let live = self.view.members.clone();
        let source = match self.active.take() {
            Some(mut active) => {
                active.cancel.cancel();
                let _ = (&mut active.handle).await;
                effective_holders(&active, &live)
            }
            None => {
                let routing = self.shared.routing.read().clone();
                restrict_to(routing.settled_owners(), &live)
            }
        };

        let view = &self.view;
        let hash = match ConsistentHashEngine::compute_weighted(
            &view.members,
            |m| view.capacity_of(m),
            self.hash_config.num_segments,
            self.hash_config.num_owners,
            Some(&source),
        ) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(
                    cache = %self.shared.cache,
                    error = %e,
                    "No owners for membership, routing to the members still holding data"
                );
                let current = self.shared.routing.read().current.clone();
                self.shared.publish(
                    RoutingView::parked(current, Arc::new(source), self.gates.clone()),
                    TopologyPhase::Stable,
                );
                return;
            }
        };

        let topology_id = self.next_topology_id;
        self.next_topology_id += 1;
        let pending = Arc::new(CacheTopology::new(topology_id, live, hash));
        let source = Arc::new(source);
        let table = Arc::new(SegmentTransferTable::new(
            topology_id,
            self.hash_config.num_segments,
        ));

        let current = self.shared.routing.read().current.clone();
        self.shared.publish(
            RoutingView {
                current,
                pending: Some(PendingRoute {
                    topology: pending.clone(),
                    source: source.clone(),
                    table: table.clone(),
                }),
                holders: None,
                gates: self.gates.clone(),
            },
            TopologyPhase::Rebalancing,
        );

        let plan = RehashPlan {
            topology_id,
            source: source.clone(),
            target: pending.hash.clone(),
            table: table.clone(),
            gates: self.gates.clone(),
        };
        info!(
            cache = %self.shared.cache,
            topology_id,
            segments = plan.affected_segments().len(),
            "Installing pending topology"
        );

        let cancel = CancellationToken::new();
        let coordinator = self.coordinator.clone();
        let completions = self.completion_tx.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = coordinator.run(plan, token).await;
            let _ = completions.send(RehashCompletion {
                topology_id,
                result,
            });
        });

        self.active = Some(ActiveRehash {
            pending,
            source,
            table,
            cancel,
            handle,
        });
    }

    fn commit(&mut self, report: RehashReport) {
        let Some(active) = self.active.take() else {
            return;
        };
        let committed = active.pending;

        self.shared.history.write().push(committed.clone());
        info!(
            cache = %self.shared.cache,
            topology_id = committed.topology_id,
            segments = report.segments_done,
            entries = report.entries_transferred,
            "Committed topology"
        );

        // Listeners see the commit before the phase turns stable.
        let listeners = self.shared.listeners.read().clone();
        for listener in &listeners {
            listener.on_topology_committed(&self.shared.cache, &committed);
        }
        let _ = self.shared.commits.send(committed.clone());

        self.shared.publish(
            RoutingView::stable(committed, self.gates.clone()),
            TopologyPhase::Stable,
        );
    }

    async fn stop_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            let _ = active.handle.await;
        }
    }
}

/// Owner lists restricted to live members.
fn restrict_to(hash: &ConsistentHash, live: &[NodeAddress]) -> ConsistentHash {
    let owners = hash
        .segment_owners()
        .iter()
        .map(|list| list.iter().filter(|o| live.contains(o)).cloned().collect())
        .collect();
    ConsistentHash::from_owners(hash.num_owners(), owners)
}

/// Who holds each segment after a rehash stopped: its new owners where the
/// segment finished, its previous holders elsewhere, restricted to live
/// members.
fn effective_holders(active: &ActiveRehash, live: &[NodeAddress]) -> ConsistentHash {
    let owners = (0..active.source.num_segments())
        .map(|segment| {
            let holders = if active.table.is_done(segment) {
                active.pending.hash.owners(segment)
            } else {
                active.source.owners(segment)
            };
            holders.iter().filter(|o| live.contains(o)).cloned().collect()
        })
        .collect();
    ConsistentHash::from_owners(active.source.num_owners(), owners)
}
