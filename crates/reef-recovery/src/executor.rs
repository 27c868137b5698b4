//! Recovery executor: moves one copy from INITIALIZING to STARTED.
//!
//! A session runs in three phases:
//!
//! 1. **Initializing**: the target node is probed. An unreachable target
//!    releases the slot immediately, without retrying.
//! 2. **Recovering**: a replay log is registered behind the shard's write
//!    fence, then the source snapshot (or the durable log for a shard that
//!    never started) is transferred through the throttle and restored on the
//!    target. Writes accepted in the meantime are replayed. Unreachable
//!    nodes are retried with backoff.
//! 3. **Started**: the target's version is checked against its source and
//!    deltas are sent until it has caught up. A relocation first stops the
//!    source from serving and waits out running writes, then hands the
//!    source's role over to the target.

use std::sync::Arc;

use reef_shardmap::{MapError, ShardMap, Transition};
use reef_store::{ShardKey, WriteOp};
use reef_types::events::{EventBus, RecoveryCompleted, RecoveryFailed, RecoveryStarted};
use reef_types::{CollectionId, CopyId, CopyState, NodeId, RecoveryConfig};
use tracing::{debug, info, warn};

use crate::error::RecoveryError;
use crate::fence::WriteFence;
use crate::replay::{ReplayLog, ReplayRegistry};
use crate::throttle::Throttle;
use crate::transport::{DurableLog, RecoveryTransport, encode_snapshot};

/// Per-collection state a session works against.
#[derive(Debug, Clone)]
pub struct RecoveryScope {
    /// The collection's shard map.
    pub map: Arc<ShardMap>,
    /// Replay logs of the collection's recovering copies.
    pub replay: Arc<ReplayRegistry>,
    /// Write fence of the collection.
    pub fence: Arc<WriteFence>,
}

/// Where a recovering copy gets its data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    /// The durable log; used for the primary of a shard that never started.
    DurableLog,
    /// A STARTED copy of the shard, normally its primary.
    Peer(CopyId),
    /// The STARTED copy this relocation target replaces.
    Relocation(CopyId),
}

impl RecoverySource {
    fn copy(&self) -> Option<CopyId> {
        match self {
            Self::DurableLog => None,
            Self::Peer(c) | Self::Relocation(c) => Some(*c),
        }
    }
}

/// One recovery session's work order.
#[derive(Debug, Clone)]
pub struct RecoveryTask {
    /// Collection state.
    pub scope: RecoveryScope,
    /// The INITIALIZING copy to recover.
    pub copy: CopyId,
    /// Node the copy is placed on.
    pub target: NodeId,
    /// Where the data comes from.
    pub source: RecoverySource,
}

impl RecoveryTask {
    /// Collection of the copy.
    pub fn collection(&self) -> &CollectionId {
        self.scope.map.collection()
    }

    /// Storage key of the shard on every node.
    pub fn key(&self) -> ShardKey {
        ShardKey::new(self.collection().clone(), self.copy.shard)
    }
}

/// Result of a successful session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Version of the copy when it started.
    pub version: u64,
    /// Delta transfers needed to catch up.
    pub delta_rounds: u32,
}

/// Runs recovery sessions.
pub struct RecoveryExecutor {
    transport: Arc<dyn RecoveryTransport>,
    durable: Arc<dyn DurableLog>,
    throttle: Arc<Throttle>,
    config: RecoveryConfig,
    event_bus: EventBus,
}

impl RecoveryExecutor {
    /// Create an executor.
    pub fn new(
        transport: Arc<dyn RecoveryTransport>,
        durable: Arc<dyn DurableLog>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            transport,
            durable,
            throttle: Throttle::new(config.max_bytes_per_sec),
            config,
            event_bus: EventBus::new(),
        }
    }

    /// Use a shared event bus for session events.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = bus;
        self
    }

    /// The transfer throttle.
    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    /// Recovery settings.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Run one session to completion.
    ///
    /// On failure the target's partial data is discarded and the copy is
    /// released (relocation targets are removed), so the planner can place
    /// it again.
    pub async fn recover(&self, task: &RecoveryTask) -> Result<RecoveryOutcome, RecoveryError> {
        let result = self.attempt(task).await;
        if let Err(e) = &result {
            self.abandon(task, e);
        }
        result
    }

    /// Run one session, leaving a failed copy in the map as it was.
    ///
    /// The target's partial data is discarded on failure. The caller hands
    /// the error to [`RecoveryExecutor::abandon`] once no other session can
    /// be started for the copy.
    #[tracing::instrument(
        skip(self, task),
        fields(collection = %task.collection(), copy = %task.copy, target = %task.target.short())
    )]
    pub async fn attempt(&self, task: &RecoveryTask) -> Result<RecoveryOutcome, RecoveryError> {
        let key = task.key();

        if let Err(e) = self.transport.probe(task.target).await {
            warn!(error = %e, "recovery target unreachable");
            return Err(e);
        }

        match self.run(task, &key).await {
            Ok(outcome) => {
                info!(
                    version = outcome.version,
                    delta_rounds = outcome.delta_rounds,
                    "copy recovered"
                );
                self.event_bus.emit(RecoveryCompleted {
                    collection: task.collection().clone(),
                    copy: task.copy,
                    target: task.target,
                    delta_rounds: outcome.delta_rounds,
                });
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "recovery failed");
                task.scope.replay.unregister(task.copy);
                if let Err(discard) = self.transport.discard(task.target, &key).await {
                    debug!(error = %discard, "could not discard partial target data");
                }
                Err(e)
            }
        }
    }

    /// Return a failed session's copy to the planner and report the failure.
    pub fn abandon(&self, task: &RecoveryTask, error: &RecoveryError) {
        self.release(task);
        self.event_bus.emit(RecoveryFailed {
            collection: task.collection().clone(),
            copy: task.copy,
            reason: error.to_string(),
        });
    }

    async fn run(&self, task: &RecoveryTask, key: &ShardKey) -> Result<RecoveryOutcome, RecoveryError> {
        self.transport.discard(task.target, key).await?;
        self.transport.open(task.target, key).await?;
        let log = {
            let _blocked = task.scope.fence.block(task.copy.shard).await;
            task.scope.replay.register(task.copy, task.target)
        };
        task.scope
            .map
            .apply_transition(task.copy, CopyState::Initializing, CopyState::Recovering)?;

        let source_node = match task.source.copy() {
            Some(c) => Some(self.source_node(task, c)?),
            None => None,
        };
        self.event_bus.emit(RecoveryStarted {
            collection: task.collection().clone(),
            copy: task.copy,
            target: task.target,
            source: source_node,
        });

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transfer(task, key, 0).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let backoff = self.config.backoff(attempt);
                    warn!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "snapshot transfer failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(RecoveryError::RecoveryFailed {
                        copy: task.copy,
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        self.replay(task, key, log.drain()).await?;

        match task.source {
            RecoverySource::Relocation(source) => {
                self.finish_relocation(task, key, &log, source).await
            }
            _ => self.finish(task, key, &log).await,
        }
    }

    /// Node currently holding the data of `source`.
    fn source_node(&self, task: &RecoveryTask, source: CopyId) -> Result<NodeId, RecoveryError> {
        let entry = task.scope.map.current_assignment(source.shard)?;
        entry
            .copy(source)
            .filter(|c| c.state.holds_data())
            .and_then(|c| c.node)
            .ok_or(RecoveryError::SourceUnavailable(source))
    }

    /// Ship the documents above `since` from the source to the target.
    async fn transfer(&self, task: &RecoveryTask, key: &ShardKey, since: u64) -> Result<(), RecoveryError> {
        let data = match task.source.copy() {
            None => encode_snapshot(&self.durable.load(key).await?)?,
            Some(source) => {
                let node = self.source_node(task, source)?;
                self.transport.snapshot(node, key, since).await?
            }
        };
        self.throttle.acquire(data.len() as u64).await;
        debug!(bytes = data.len(), since, "restoring snapshot on target");
        self.transport.restore(task.target, key, data).await
    }

    async fn replay(&self, task: &RecoveryTask, key: &ShardKey, ops: Vec<WriteOp>) -> Result<(), RecoveryError> {
        if ops.is_empty() {
            return Ok(());
        }
        let count = ops.len();
        for op in &ops {
            self.transport.apply(task.target, key, op).await?;
        }
        debug!(count, "replayed queued writes");
        Ok(())
    }

    /// Replay and send deltas until the target is at least at its source's
    /// version. Gives up after `max_attempts` deltas; returns the rounds used.
    async fn catch_up(&self, task: &RecoveryTask, key: &ShardKey, log: &ReplayLog) -> Result<u32, RecoveryError> {
        let mut rounds = 0;
        loop {
            self.replay(task, key, log.drain()).await?;
            let actual = self.transport.version(task.target, key).await?;
            let expected = match task.source.copy() {
                None => actual,
                Some(source) => {
                    let node = self.source_node(task, source)?;
                    self.transport.version(node, key).await?
                }
            };
            if actual >= expected {
                return Ok(rounds);
            }
            if rounds >= self.config.max_attempts {
                return Err(RecoveryError::VersionMismatch {
                    copy: task.copy,
                    expected,
                    actual,
                });
            }
            rounds += 1;
            debug!(rounds, expected, actual, "target behind source, sending delta");
            self.transfer(task, key, actual).await?;
        }
    }

    fn record_version(&self, task: &RecoveryTask, version: u64) -> Result<(), RecoveryError> {
        let transition = Transition::RecordVersion {
            copy: task.copy,
            version,
        };
        match task.scope.map.apply(task.copy.shard, transition) {
            Ok(_) | Err(MapError::VersionRegression { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn finish(&self, task: &RecoveryTask, key: &ShardKey, log: &ReplayLog) -> Result<RecoveryOutcome, RecoveryError> {
        let delta_rounds = self.catch_up(task, key, log).await?;
        self.replay(task, key, log.close()).await?;
        self.transport.refresh(task.target, key).await?;

        let version = self.transport.version(task.target, key).await?;
        self.record_version(task, version)?;
        task.scope
            .map
            .apply_transition(task.copy, CopyState::Recovering, CopyState::Started)?;
        task.scope.replay.unregister(task.copy);
        Ok(RecoveryOutcome {
            version,
            delta_rounds,
        })
    }

    async fn finish_relocation(
        &self,
        task: &RecoveryTask,
        key: &ShardKey,
        log: &ReplayLog,
        source: CopyId,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let early_rounds = self.catch_up(task, key, log).await?;

        task.scope
            .map
            .apply_transition(source, CopyState::Started, CopyState::Relocating)?;
        let (outcome, source_node) = match self.hand_off(task, key, log, source).await {
            Ok((version, late_rounds, node)) => (
                RecoveryOutcome {
                    version,
                    delta_rounds: early_rounds + late_rounds,
                },
                node,
            ),
            Err(e) => {
                if let Err(revert) = task.scope.map.apply_transition(
                    source,
                    CopyState::Relocating,
                    CopyState::Started,
                ) {
                    warn!(error = %revert, %source, "could not revert relocation source");
                }
                return Err(e);
            }
        };

        task.scope.replay.unregister(task.copy);
        if let Err(e) = self.transport.discard(source_node, key).await {
            warn!(error = %e, node = %source_node.short(), "could not discard relocated source data");
        }
        Ok(outcome)
    }

    /// Final step of a relocation; the source is RELOCATING.
    async fn hand_off(
        &self,
        task: &RecoveryTask,
        key: &ShardKey,
        log: &ReplayLog,
        source: CopyId,
    ) -> Result<(u64, u32, NodeId), RecoveryError> {
        task.scope.fence.drain(task.copy.shard).await;
        self.replay(task, key, log.close()).await?;
        let rounds = self.catch_up(task, key, log).await?;
        self.transport.refresh(task.target, key).await?;

        let source_node = self.source_node(task, source)?;
        let version = self.transport.version(task.target, key).await?;
        self.record_version(task, version)?;
        task.scope.map.apply(
            task.copy.shard,
            Transition::Handoff {
                source,
                target: task.copy,
            },
        )?;
        Ok((version, rounds, source_node))
    }

    /// Return a copy still owned by this session to the planner.
    fn release(&self, task: &RecoveryTask) {
        let Ok(entry) = task.scope.map.current_assignment(task.copy.shard) else {
            return;
        };
        let Some(copy) = entry.copy(task.copy) else {
            return;
        };
        if !copy.state.is_in_flight() || copy.node != Some(task.target) {
            return;
        }
        let result = if copy.is_relocation_target() {
            task.scope
                .map
                .apply(task.copy.shard, Transition::Remove { copy: task.copy })
        } else {
            task.scope
                .map
                .apply_transition(task.copy, copy.state, CopyState::Unassigned)
        };
        if let Err(e) = result {
            debug!(error = %e, "copy changed while releasing it");
        }
    }
}
