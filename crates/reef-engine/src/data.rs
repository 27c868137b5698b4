//! Data plane: writes, reads, refresh and flush.

use std::collections::HashSet;

use bytes::Bytes;
use reef_recovery::{Appended, RecoveryTransport};
use reef_routing::{Operation, ReadPreference, RoutingError};
use reef_shardmap::{MapError, Transition};
use reef_store::{Document, DocumentStore, ShardKey, WriteOp};
use reef_types::{CollectionId, CopyId, CopyRole, CopyState, ShardCopy, ShardId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::collection::Collection;
use crate::coordinator::Coordinator;
use crate::error::EngineError;

/// Where a read runs.
///
/// Both modes return the same data; `Spawned` moves the store lookup onto
/// its own task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadExecution {
    /// On the caller's task.
    #[default]
    Inline,
    /// On a freshly spawned task.
    Spawned,
}

/// Result of an accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexResponse {
    /// Shard the document went to.
    pub shard: ShardId,
    /// Sequence number assigned by the primary.
    pub seq: u64,
    /// STARTED copies that applied the write, primary included.
    pub successful_copies: usize,
    /// STARTED replicas that failed to apply it and were taken out of service.
    pub failed_copies: usize,
}

/// Per-copy outcome of a refresh or flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResponse {
    /// Every configured copy (primaries plus replicas).
    pub total_shards: u32,
    /// STARTED copies that completed the operation.
    pub successful_shards: u32,
    /// STARTED copies that failed it.
    pub failed_shards: u32,
}

#[derive(Debug, Clone, Copy)]
enum Broadcast {
    Refresh,
    Flush,
}

impl Coordinator {
    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Index a document: route to the primary, apply, then replicate.
    ///
    /// Waits up to the routing timeout for a STARTED primary. Copies that are
    /// still recovering receive the write through their replay log.
    pub async fn index(
        &self,
        collection: &CollectionId,
        id: &str,
        source: impl Into<Bytes>,
    ) -> Result<IndexResponse, EngineError> {
        let coll = self.inner.collection(collection)?;
        let source = source.into();
        let shard = coll.shard_for(id);
        let deadline = Instant::now() + self.inner.config.routing.timeout();
        let op = Operation::Write { shard };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let primary = coll.gate.route(&op, remaining).await?;

            let _entered = coll
                .scope
                .fence
                .enter(shard)
                .await
                .ok_or(MapError::ShardNotFound(shard))?;
            // Registry before map: a copy that starts in between is still
            // covered by its log.
            let targets = coll.scope.replay.targets(shard);
            let entry = coll.map.current_assignment(shard)?;
            let still_primary = entry.active_primary().is_some_and(|p| p.id == primary.id);
            let Some(primary_node) = primary.node.filter(|_| still_primary) else {
                debug!(%collection, %shard, "primary changed while routing, retrying");
                continue;
            };

            let write = WriteOp {
                seq: coll.next_seq(shard),
                id: id.to_string(),
                source: source.clone(),
            };
            let key = coll.key(shard);
            self.inner
                .transport
                .apply(primary_node, &key, &write)
                .await
                .map_err(|e| EngineError::WriteFailed {
                    shard,
                    reason: e.to_string(),
                })?;
            record_version(&coll, primary.id, write.seq);

            let mut applied: HashSet<CopyId> = HashSet::from([primary.id]);
            let mut failed = 0;
            let holders: Vec<ShardCopy> = entry
                .copies()
                .filter(|c| c.id != primary.id && c.state.holds_data())
                .cloned()
                .collect();
            for copy in holders {
                let Some(node) = copy.node else { continue };
                match self.inner.transport.apply(node, &key, &write).await {
                    Ok(_) => {
                        record_version(&coll, copy.id, write.seq);
                        applied.insert(copy.id);
                    }
                    Err(e) => {
                        failed += 1;
                        self.fail_copy(&coll, &copy, &e.to_string());
                    }
                }
            }

            for target in targets {
                if applied.contains(&target.copy) {
                    continue;
                }
                if target.log.append(write.clone()) == Appended::Closed {
                    // The session already replayed its log; apply directly.
                    if let Err(e) = self.inner.transport.apply(target.node, &key, &write).await {
                        debug!(copy = %target.copy, error = %e, "late write to started copy failed");
                    }
                }
            }

            debug!(%collection, %shard, seq = write.seq, copies = applied.len(), "document indexed");
            return Ok(IndexResponse {
                shard,
                seq: write.seq,
                successful_copies: applied.len(),
                failed_copies: failed,
            });
        }
    }

    /// Take a replica that missed a write out of service.
    fn fail_copy(&self, coll: &Collection, copy: &ShardCopy, reason: &str) {
        warn!(collection = %coll.name(), copy = %copy.id, reason, "replica failed a write, unassigning");
        match coll
            .map
            .apply_transition(copy.id, copy.state, CopyState::Unassigned)
        {
            Ok(_) => self.request_reroute(coll.name()),
            Err(e) => debug!(copy = %copy.id, error = %e, "replica changed before it could be failed"),
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Get a document by id from a STARTED copy chosen by `preference`.
    ///
    /// Returns what that copy made visible at its last refresh.
    pub async fn get(
        &self,
        collection: &CollectionId,
        id: &str,
        preference: ReadPreference,
        execution: ReadExecution,
    ) -> Result<Option<Document>, EngineError> {
        let coll = self.inner.collection(collection)?;
        let shard = coll.shard_for(id);
        let copy = coll
            .gate
            .route(
                &Operation::Read { shard, preference },
                self.inner.config.routing.timeout(),
            )
            .await?;
        let node = copy.node.ok_or(RoutingError::NoCopyAvailable(shard))?;
        let store = self.inner.transport.store(node)?;
        let key = coll.key(shard);

        match execution {
            ReadExecution::Inline => Ok(store.get(&key, id).await?),
            ReadExecution::Spawned => {
                let id = id.to_string();
                let handle = tokio::spawn(async move { store.get(&key, &id).await });
                Ok(handle.await??)
            }
        }
    }

    // ------------------------------------------------------------------
    // Refresh / flush
    // ------------------------------------------------------------------

    /// Make applied writes visible to reads on every STARTED copy.
    pub async fn refresh(&self, collection: &CollectionId) -> Result<BroadcastResponse, EngineError> {
        self.broadcast(collection, Broadcast::Refresh).await
    }

    /// Refresh and commit every STARTED copy; primaries are recorded as the
    /// durable state of their shard.
    pub async fn flush(&self, collection: &CollectionId) -> Result<BroadcastResponse, EngineError> {
        self.broadcast(collection, Broadcast::Flush).await
    }

    async fn broadcast(
        &self,
        collection: &CollectionId,
        kind: Broadcast,
    ) -> Result<BroadcastResponse, EngineError> {
        let coll = self.inner.collection(collection)?;
        let snapshot = coll.map.snapshot();
        let mut response = BroadcastResponse {
            total_shards: snapshot.settings.total_copies(),
            ..BroadcastResponse::default()
        };

        for entry in &snapshot.shards {
            let key = coll.key(entry.shard());
            for copy in entry.started() {
                let result = self.broadcast_copy(copy, &key, kind).await;
                match result {
                    Ok(()) => response.successful_shards += 1,
                    Err(reason) => {
                        warn!(%collection, copy = %copy.id, ?kind, reason, "broadcast failed on copy");
                        response.failed_shards += 1;
                    }
                }
            }
        }

        debug!(%collection, ?kind, ?response, "broadcast done");
        Ok(response)
    }

    async fn broadcast_copy(&self, copy: &ShardCopy, key: &ShardKey, kind: Broadcast) -> Result<(), String> {
        let node = copy.node.ok_or_else(|| "copy has no node".to_string())?;
        let store = self.inner.transport.store(node).map_err(|e| e.to_string())?;
        match kind {
            Broadcast::Refresh => store.refresh(key).await.map_err(|e| e.to_string()),
            Broadcast::Flush => {
                store.flush(key).await.map_err(|e| e.to_string())?;
                if copy.role == CopyRole::Primary {
                    let snapshot = store.snapshot(key, 0).await.map_err(|e| e.to_string())?;
                    self.inner.flushed.record(key.clone(), snapshot);
                }
                Ok(())
            }
        }
    }
}

/// Record a copy's version; a regression means a newer write already landed.
fn record_version(coll: &Collection, copy: CopyId, version: u64) {
    let transition = Transition::RecordVersion { copy, version };
    match coll.map.apply(copy.shard, transition) {
        Ok(_) | Err(MapError::VersionRegression { .. }) => {}
        Err(e) => debug!(%copy, error = %e, "version not recorded"),
    }
}
