//! [`Coordinator`]: ties the shard maps, planner, recovery scheduler, health
//! monitors and routing gates together.
//!
//! All allocation work runs on one control task: membership changes,
//! session completions, replica count changes and explicit relocations are
//! queued to it as [`ControlEvent`]s, so the planner never runs twice at
//! once. Requests (writes, reads, health waits) are served concurrently
//! from the caller's task and only read the shard maps.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reef_health::{ClusterHealth, HealthReport};
use reef_placement::{AllocationPlan, AllocationPlanner, Decision, PlacementError};
use reef_recovery::{
    RecoveryExecutor, RecoveryScheduler, RecoverySource, RecoveryTask, RecoveryTransport,
    SessionKey, SessionReport,
};
use reef_routing::{Operation, RouteOutcome};
use reef_shardmap::{ShardMapSnapshot, Transition};
use reef_types::events::{EventBus, PrimaryPromoted};
use reef_types::{CollectionId, CollectionSettings, CopyId, CopyState, NodeId, ShardCopy, ShardId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collection::Collection;
use crate::config::ReefConfig;
use crate::error::EngineError;
use crate::transport::{FlushedLog, LocalTransport};

/// Planner passes per reroute when decisions go stale mid-application.
const MAX_PLAN_PASSES: usize = 3;

/// Work queued to the control task.
enum ControlEvent {
    Membership {
        nodes: BTreeSet<NodeId>,
        done: oneshot::Sender<()>,
    },
    Reroute {
        /// `None` reroutes every collection.
        collection: Option<CollectionId>,
        done: Option<oneshot::Sender<()>>,
    },
    Relocate {
        collection: CollectionId,
        shard: ShardId,
        from: NodeId,
        to: NodeId,
        done: oneshot::Sender<Result<CopyId, EngineError>>,
    },
    ForceAllocate {
        collection: CollectionId,
        shard: ShardId,
        done: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// State shared by the coordinator handle and its control task.
pub(crate) struct Inner {
    pub(crate) config: ReefConfig,
    pub(crate) transport: Arc<LocalTransport>,
    pub(crate) flushed: Arc<FlushedLog>,
    planner: AllocationPlanner,
    scheduler: Arc<RecoveryScheduler>,
    bus: EventBus,
    collections: RwLock<HashMap<CollectionId, Arc<Collection>>>,
    live: RwLock<BTreeSet<NodeId>>,
}

/// Coordinates allocation and recovery for every collection on a set of
/// in-process nodes.
///
/// Must be created inside a tokio runtime. Dropping the coordinator aborts
/// its control task and every running recovery session.
pub struct Coordinator {
    pub(crate) inner: Arc<Inner>,
    control: mpsc::UnboundedSender<ControlEvent>,
    control_task: JoinHandle<()>,
}

impl Coordinator {
    /// Create a coordinator over the nodes of `transport`.
    ///
    /// No node is live until [`Coordinator::on_membership_changed`] is called.
    pub fn new(config: ReefConfig, transport: Arc<LocalTransport>) -> Self {
        let bus = EventBus::new();
        let flushed = FlushedLog::new();
        let recovery_transport: Arc<dyn RecoveryTransport> = transport.clone();
        let executor = RecoveryExecutor::new(
            recovery_transport,
            flushed.clone(),
            config.recovery.clone(),
        )
        .with_event_bus(bus.clone());
        let (scheduler, reports) =
            RecoveryScheduler::new(Arc::new(executor), config.recovery.max_concurrent);

        let inner = Arc::new(Inner {
            planner: AllocationPlanner::new(config.allocation.clone()),
            config,
            transport,
            flushed,
            scheduler,
            bus,
            collections: RwLock::new(HashMap::new()),
            live: RwLock::new(BTreeSet::new()),
        });

        let (control, events) = mpsc::unbounded_channel();
        let control_task = tokio::spawn(control_loop(
            inner.clone(),
            control.downgrade(),
            events,
            reports,
        ));

        info!(
            max_concurrent = inner.config.recovery.max_concurrent,
            rebalance = inner.config.allocation.rebalance_enabled,
            "coordinator started"
        );
        Self {
            inner,
            control,
            control_task,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &ReefConfig {
        &self.inner.config
    }

    /// The event bus recovery, promotion and health events go to.
    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// The node data plane.
    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.inner.transport
    }

    /// The recovery scheduler.
    pub fn scheduler(&self) -> &Arc<RecoveryScheduler> {
        &self.inner.scheduler
    }

    /// Nodes currently considered live.
    pub fn live_nodes(&self) -> BTreeSet<NodeId> {
        self.inner.live_nodes()
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    /// Create a collection and allocate its shards over the live nodes.
    pub async fn create_collection(
        &self,
        name: impl Into<CollectionId>,
        settings: CollectionSettings,
    ) -> Result<(), EngineError> {
        let name = name.into();
        if settings.shards == 0 {
            return Err(EngineError::InvalidSettings {
                collection: name,
                reason: "a collection needs at least one shard".to_string(),
            });
        }
        {
            let mut collections = self
                .inner
                .collections
                .write()
                .expect("collection table lock poisoned");
            if collections.contains_key(&name) {
                return Err(EngineError::CollectionExists(name));
            }
            let collection = Collection::new(name.clone(), settings, self.inner.bus.clone());
            collections.insert(name.clone(), Arc::new(collection));
        }
        info!(collection = %name, shards = settings.shards, replicas = settings.replicas, "collection created");
        self.reroute(Some(name)).await
    }

    /// Snapshot of a collection's shard map.
    pub fn get_shard_map(&self, collection: &CollectionId) -> Result<ShardMapSnapshot, EngineError> {
        Ok(self.inner.collection(collection)?.map.snapshot())
    }

    /// Current health of a collection.
    pub fn health(&self, collection: &CollectionId) -> Result<HealthReport, EngineError> {
        Ok(self.inner.collection(collection)?.health.report())
    }

    /// Wait until a collection's status is at least `min`.
    pub async fn await_status(
        &self,
        collection: &CollectionId,
        min: ClusterHealth,
        timeout: Duration,
    ) -> Result<HealthReport, EngineError> {
        let coll = self.inner.collection(collection)?;
        Ok(coll.health.await_status(min, timeout).await?)
    }

    /// Wait until a collection's status is at least `min` and no copy is
    /// recovering or relocating.
    pub async fn await_settled(
        &self,
        collection: &CollectionId,
        min: ClusterHealth,
        timeout: Duration,
    ) -> Result<HealthReport, EngineError> {
        let coll = self.inner.collection(collection)?;
        Ok(coll.health.await_settled(min, timeout).await?)
    }

    /// Route an operation, waiting up to the configured routing timeout.
    pub async fn route(
        &self,
        collection: &CollectionId,
        op: &Operation,
    ) -> Result<ShardCopy, EngineError> {
        let coll = self.inner.collection(collection)?;
        Ok(coll
            .gate
            .route(op, self.inner.config.routing.timeout())
            .await?)
    }

    /// Route an operation without waiting.
    pub fn try_route(
        &self,
        collection: &CollectionId,
        op: &Operation,
    ) -> Result<RouteOutcome, EngineError> {
        let coll = self.inner.collection(collection)?;
        Ok(coll.gate.try_route(op)?)
    }

    /// Replace the set of live nodes and re-plan every collection.
    ///
    /// Returns once the new plan has been applied; recoveries it started
    /// continue in the background.
    pub async fn on_membership_changed(&self, nodes: BTreeSet<NodeId>) -> Result<(), EngineError> {
        let (done, wait) = oneshot::channel();
        self.send(ControlEvent::Membership { nodes, done })?;
        wait.await.map_err(|_| EngineError::Shutdown)
    }

    /// Change the replica count of a collection.
    pub async fn update_replicas(
        &self,
        collection: &CollectionId,
        replicas: u32,
    ) -> Result<(), EngineError> {
        let coll = self.inner.collection(collection)?;
        let before = coll.map.settings().replicas;
        coll.map.set_replicas(replicas);
        info!(%collection, from = before, to = replicas, "replica count updated");
        self.reroute(Some(collection.clone())).await
    }

    /// Move the copy of `shard` on `from` to `to`.
    ///
    /// Returns the id of the relocation target; the move finishes in the
    /// background.
    pub async fn relocate(
        &self,
        collection: &CollectionId,
        shard: ShardId,
        from: NodeId,
        to: NodeId,
    ) -> Result<CopyId, EngineError> {
        let (done, wait) = oneshot::channel();
        self.send(ControlEvent::Relocate {
            collection: collection.clone(),
            shard,
            from,
            to,
            done,
        })?;
        wait.await.map_err(|_| EngineError::Shutdown)?
    }

    /// Accept the loss of a shard's data and bring up a new primary from
    /// its last flush.
    pub async fn force_allocate_primary(
        &self,
        collection: &CollectionId,
        shard: ShardId,
    ) -> Result<(), EngineError> {
        let (done, wait) = oneshot::channel();
        self.send(ControlEvent::ForceAllocate {
            collection: collection.clone(),
            shard,
            done,
        })?;
        wait.await.map_err(|_| EngineError::Shutdown)?
    }

    /// Abort every recovery session and stop the control task.
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
        self.control_task.abort();
    }

    pub(crate) fn request_reroute(&self, collection: &CollectionId) {
        let _ = self.control.send(ControlEvent::Reroute {
            collection: Some(collection.clone()),
            done: None,
        });
    }

    async fn reroute(&self, collection: Option<CollectionId>) -> Result<(), EngineError> {
        let (done, wait) = oneshot::channel();
        self.send(ControlEvent::Reroute {
            collection,
            done: Some(done),
        })?;
        wait.await.map_err(|_| EngineError::Shutdown)
    }

    fn send(&self, event: ControlEvent) -> Result<(), EngineError> {
        self.control.send(event).map_err(|_| EngineError::Shutdown)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let collections = self
            .inner
            .collections
            .read()
            .expect("collection table lock poisoned")
            .len();
        f.debug_struct("Coordinator")
            .field("live_nodes", &self.inner.live_nodes().len())
            .field("collections", &collections)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------
// Control task
// ----------------------------------------------------------------------

async fn control_loop(
    inner: Arc<Inner>,
    control: mpsc::WeakUnboundedSender<ControlEvent>,
    mut events: mpsc::UnboundedReceiver<ControlEvent>,
    mut reports: mpsc::UnboundedReceiver<SessionReport>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("coordinator handle dropped, control task exiting");
                    return;
                };
                inner.handle(event).await;
            }
            Some(report) = reports.recv() => {
                inner.on_session_report(report, &control).await;
            }
        }
    }
}

impl Inner {
    pub(crate) fn collection(&self, name: &CollectionId) -> Result<Arc<Collection>, EngineError> {
        self.collections
            .read()
            .expect("collection table lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::CollectionNotFound(name.clone()))
    }

    fn all_collections(&self) -> Vec<Arc<Collection>> {
        self.collections
            .read()
            .expect("collection table lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn live_nodes(&self) -> BTreeSet<NodeId> {
        self.live.read().expect("live set lock poisoned").clone()
    }

    async fn handle(&self, event: ControlEvent) {
        match event {
            ControlEvent::Membership { nodes, done } => {
                self.set_live(nodes);
                for coll in self.all_collections() {
                    self.reroute(&coll).await;
                }
                let _ = done.send(());
            }
            ControlEvent::Reroute { collection, done } => {
                let targets = match collection {
                    Some(name) => self.collection(&name).into_iter().collect(),
                    None => self.all_collections(),
                };
                for coll in targets {
                    self.reroute(&coll).await;
                }
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            ControlEvent::Relocate {
                collection,
                shard,
                from,
                to,
                done,
            } => {
                let _ = done.send(self.relocate(&collection, shard, from, to));
            }
            ControlEvent::ForceAllocate {
                collection,
                shard,
                done,
            } => {
                let result = self.force_allocate(&collection, shard).await;
                let _ = done.send(result);
            }
        }
    }

    fn set_live(&self, nodes: BTreeSet<NodeId>) {
        let mut live = self.live.write().expect("live set lock poisoned");
        for joined in nodes.difference(&live) {
            info!(node = %joined.short(), "node joined");
        }
        for left in live.difference(&nodes) {
            warn!(node = %left.short(), "node left");
        }
        *live = nodes;
    }

    async fn on_session_report(
        &self,
        report: SessionReport,
        control: &mpsc::WeakUnboundedSender<ControlEvent>,
    ) {
        let Ok(coll) = self.collection(&report.key.collection) else {
            return;
        };
        match report.result {
            Ok(_) => self.reroute(&coll).await,
            Err(e) => {
                // Re-plan later so a node that keeps failing is not retried in
                // a tight loop.
                let delay = self.config.recovery.backoff(self.config.recovery.max_attempts);
                debug!(
                    collection = %report.key.collection,
                    copy = %report.key.copy,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "session failed, rerouting later"
                );
                let control = control.clone();
                let collection = report.key.collection;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(control) = control.upgrade() {
                        let _ = control.send(ControlEvent::Reroute {
                            collection: Some(collection),
                            done: None,
                        });
                    }
                });
            }
        }
    }

    /// Plan and apply until the plan is empty or has been applied cleanly.
    async fn reroute(&self, coll: &Arc<Collection>) {
        for pass in 1..=MAX_PLAN_PASSES {
            let plan = self.planner.plan(&coll.map.snapshot(), &self.live_nodes());
            if plan.is_empty() {
                return;
            }
            match self.apply_plan(coll, plan).await {
                Ok(()) => return,
                Err(e) => {
                    debug!(collection = %coll.name(), pass, error = %e, "plan went stale, replanning");
                }
            }
        }
        warn!(collection = %coll.name(), "allocation did not settle, waiting for the next event");
    }

    async fn apply_plan(&self, coll: &Arc<Collection>, plan: AllocationPlan) -> Result<(), EngineError> {
        for decision in plan {
            self.apply_decision(coll, decision).await?;
        }
        Ok(())
    }

    async fn apply_decision(&self, coll: &Arc<Collection>, decision: Decision) -> Result<(), EngineError> {
        let map = &coll.map;
        match decision {
            Decision::Unassign { copy, node, from } => {
                map.apply_transition(copy, from, CopyState::Unassigned)?;
                info!(collection = %coll.name(), %copy, node = %node.short(), "copy unassigned, node left");
                self.discard(coll, copy.shard, node).await;
            }
            Decision::Cancel {
                copy,
                node,
                state,
                remove,
            } => {
                self.stop_session(coll, copy);
                if remove {
                    map.apply(copy.shard, Transition::Remove { copy })?;
                } else {
                    map.apply_transition(copy, state, CopyState::Unassigned)?;
                }
                info!(collection = %coll.name(), %copy, node = %node.short(), "recovery cancelled");
                self.discard(coll, copy.shard, node).await;
            }
            Decision::RevertRelocation { copy } => {
                map.apply_transition(copy, CopyState::Relocating, CopyState::Started)?;
                info!(collection = %coll.name(), %copy, "relocation reverted, source serving again");
            }
            Decision::Promote { copy, node } => {
                map.apply(copy.shard, Transition::Promote { copy })?;
                info!(collection = %coll.name(), %copy, node = %node.short(), "replica promoted to primary");
                self.bus.emit(PrimaryPromoted {
                    collection: coll.name().clone(),
                    copy,
                    node,
                });
            }
            Decision::MarkLost { shard } => {
                map.set_lost(shard, true)?;
                error!(collection = %coll.name(), %shard, "every copy holding data is gone, shard lost");
            }
            Decision::AddReplica { copy } => {
                let added = map.apply(copy.shard, Transition::AddReplica)?;
                if added.id != copy {
                    warn!(expected = %copy, added = %added.id, "replica slot differs from plan");
                }
            }
            Decision::Drop { copy, node, state } => {
                if state.is_in_flight() {
                    self.stop_session(coll, copy);
                }
                map.apply(copy.shard, Transition::Remove { copy })?;
                debug!(collection = %coll.name(), %copy, "surplus replica dropped");
                if let Some(node) = node {
                    self.discard(coll, copy.shard, node).await;
                }
            }
            Decision::Assign { copy, node, source } => {
                map.apply(copy.shard, Transition::Assign { copy, node })?;
                let source = match source {
                    Some(peer) => RecoverySource::Peer(peer),
                    None => RecoverySource::DurableLog,
                };
                self.start_session(coll, copy, node, source);
            }
            Decision::Relocate { source, target, node } => {
                let created = map.apply(source.shard, Transition::Relocate { source, node })?;
                if created.id != target {
                    warn!(expected = %target, created = %created.id, "relocation target differs from plan");
                }
                info!(collection = %coll.name(), %source, node = %node.short(), "rebalancing copy");
                self.start_session(coll, created.id, node, RecoverySource::Relocation(source));
            }
        }
        Ok(())
    }

    fn start_session(&self, coll: &Arc<Collection>, copy: CopyId, target: NodeId, source: RecoverySource) {
        let task = RecoveryTask {
            scope: coll.scope.clone(),
            copy,
            target,
            source,
        };
        if !self.scheduler.spawn(task) {
            debug!(collection = %coll.name(), %copy, "session already running");
        }
    }

    fn stop_session(&self, coll: &Arc<Collection>, copy: CopyId) {
        self.scheduler.cancel(&SessionKey {
            collection: coll.name().clone(),
            copy,
        });
        coll.scope.replay.unregister(copy);
    }

    /// Best-effort removal of a node's data for a shard.
    async fn discard(&self, coll: &Arc<Collection>, shard: ShardId, node: NodeId) {
        if let Err(e) = self.transport.discard(node, &coll.key(shard)).await {
            debug!(node = %node.short(), error = %e, "could not discard shard data");
        }
    }

    fn relocate(
        &self,
        collection: &CollectionId,
        shard: ShardId,
        from: NodeId,
        to: NodeId,
    ) -> Result<CopyId, EngineError> {
        let coll = self.collection(collection)?;
        let source =
            self.planner
                .validate_relocation(&coll.map.snapshot(), &self.live_nodes(), shard, from, to)?;
        let target = coll
            .map
            .apply(shard, Transition::Relocate { source, node: to })?;
        info!(%collection, %source, target = %target.id, from = %from.short(), to = %to.short(), "relocation requested");
        self.start_session(&coll, target.id, to, RecoverySource::Relocation(source));
        Ok(target.id)
    }

    async fn force_allocate(&self, collection: &CollectionId, shard: ShardId) -> Result<(), EngineError> {
        let coll = self.collection(collection)?;
        let entry = coll.map.current_assignment(shard)?;
        if !entry.is_lost() {
            return Err(PlacementError::NotLost(shard).into());
        }
        warn!(
            %collection,
            %shard,
            flushed_seq = ?self.flushed.flushed_seq(&coll.key(shard)),
            "forcing a new primary from the last flush"
        );
        coll.map.set_lost(shard, false)?;
        self.reroute(&coll).await;
        Ok(())
    }
}
