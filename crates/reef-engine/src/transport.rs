//! In-process data plane: one [`MemoryDocumentStore`] per node.
//!
//! [`LocalTransport`] implements [`RecoveryTransport`] over the node stores
//! and is also what the coordinator's write and read paths use. Snapshots
//! cross it postcard-encoded, exactly as they would cross a network link.
//! Nodes can be marked down to simulate unreachable peers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use reef_recovery::{DurableLog, RecoveryError, RecoveryTransport, decode_snapshot, encode_snapshot};
use reef_store::{DocumentStore, MemoryDocumentStore, ShardKey, ShardSnapshot, WriteOp};
use reef_types::NodeId;
use tracing::{debug, info};

/// Transport over in-memory node stores.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<NodeId, Arc<MemoryDocumentStore>>>,
    down: RwLock<HashSet<NodeId>>,
    /// Added before every snapshot; slows recoveries down in tests.
    snapshot_delay: Mutex<Duration>,
}

impl LocalTransport {
    /// Create a transport with no nodes.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a node with an empty store. No-op if it already runs.
    pub fn add_node(&self, node: NodeId) -> Arc<MemoryDocumentStore> {
        let mut nodes = self.nodes.write().expect("node table lock poisoned");
        nodes
            .entry(node)
            .or_insert_with(|| {
                info!(node = %node.short(), "node store created");
                Arc::new(MemoryDocumentStore::new())
            })
            .clone()
    }

    /// Stop a node and lose everything it held.
    pub fn remove_node(&self, node: &NodeId) {
        let removed = self
            .nodes
            .write()
            .expect("node table lock poisoned")
            .remove(node);
        self.down
            .write()
            .expect("down set lock poisoned")
            .remove(node);
        if removed.is_some() {
            info!(node = %node.short(), "node store removed");
        }
    }

    /// Mark a node unreachable (or reachable again) without touching its data.
    pub fn set_down(&self, node: NodeId, down: bool) {
        let mut set = self.down.write().expect("down set lock poisoned");
        if down {
            set.insert(node);
        } else {
            set.remove(&node);
        }
        debug!(node = %node.short(), down, "node reachability changed");
    }

    /// Delay every snapshot by `delay`.
    pub fn set_snapshot_delay(&self, delay: Duration) {
        *self.snapshot_delay.lock().expect("delay lock poisoned") = delay;
    }

    /// The store of a reachable node.
    pub fn store(&self, node: NodeId) -> Result<Arc<MemoryDocumentStore>, RecoveryError> {
        if self
            .down
            .read()
            .expect("down set lock poisoned")
            .contains(&node)
        {
            return Err(RecoveryError::NodeUnreachable(node));
        }
        self.nodes
            .read()
            .expect("node table lock poisoned")
            .get(&node)
            .cloned()
            .ok_or(RecoveryError::NodeUnreachable(node))
    }
}

#[async_trait::async_trait]
impl RecoveryTransport for LocalTransport {
    async fn probe(&self, node: NodeId) -> Result<(), RecoveryError> {
        self.store(node).map(|_| ())
    }

    async fn open(&self, node: NodeId, key: &ShardKey) -> Result<(), RecoveryError> {
        Ok(self.store(node)?.open(key).await?)
    }

    async fn snapshot(
        &self,
        node: NodeId,
        key: &ShardKey,
        since: u64,
    ) -> Result<Bytes, RecoveryError> {
        let delay = *self.snapshot_delay.lock().expect("delay lock poisoned");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let snapshot = self.store(node)?.snapshot(key, since).await?;
        encode_snapshot(&snapshot)
    }

    async fn restore(
        &self,
        node: NodeId,
        key: &ShardKey,
        data: Bytes,
    ) -> Result<(), RecoveryError> {
        let snapshot = decode_snapshot(&data)?;
        Ok(self.store(node)?.restore(key, snapshot).await?)
    }

    async fn apply(
        &self,
        node: NodeId,
        key: &ShardKey,
        op: &WriteOp,
    ) -> Result<bool, RecoveryError> {
        Ok(self.store(node)?.apply(key, op).await?)
    }

    async fn refresh(&self, node: NodeId, key: &ShardKey) -> Result<(), RecoveryError> {
        Ok(self.store(node)?.refresh(key).await?)
    }

    async fn version(&self, node: NodeId, key: &ShardKey) -> Result<u64, RecoveryError> {
        Ok(self.store(node)?.version(key).await?)
    }

    async fn discard(&self, node: NodeId, key: &ShardKey) -> Result<(), RecoveryError> {
        Ok(self.store(node)?.drop_shard(key).await?)
    }
}

/// Durable record of each shard as of its last flush.
///
/// A shard that has never been flushed loads as empty.
#[derive(Debug, Default)]
pub struct FlushedLog {
    shards: Mutex<HashMap<ShardKey, ShardSnapshot>>,
}

impl FlushedLog {
    /// Create an empty log.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the durable record of a shard.
    pub fn record(&self, key: ShardKey, snapshot: ShardSnapshot) {
        debug!(%key, max_seq = snapshot.max_seq, documents = snapshot.documents.len(), "flushed shard recorded");
        self.shards
            .lock()
            .expect("flushed log lock poisoned")
            .insert(key, snapshot);
    }

    /// Sequence number covered by the last flush of a shard.
    pub fn flushed_seq(&self, key: &ShardKey) -> Option<u64> {
        self.shards
            .lock()
            .expect("flushed log lock poisoned")
            .get(key)
            .map(|s| s.max_seq)
    }
}

#[async_trait::async_trait]
impl DurableLog for FlushedLog {
    async fn load(&self, key: &ShardKey) -> Result<ShardSnapshot, RecoveryError> {
        Ok(self
            .shards
            .lock()
            .expect("flushed log lock poisoned")
            .get(key)
            .cloned()
            .unwrap_or_default())
    }
}
