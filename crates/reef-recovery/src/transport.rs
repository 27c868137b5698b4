//! Collaborators a recovery session moves data through.

use bytes::Bytes;
use reef_store::{ShardKey, ShardSnapshot, WriteOp};
use reef_types::NodeId;

use crate::error::RecoveryError;

/// Abstracts the data transfer channel between nodes so tests can inject
/// failures.
///
/// Snapshots cross the channel encoded with [`encode_snapshot`].
#[async_trait::async_trait]
pub trait RecoveryTransport: Send + Sync {
    /// Check that a node answers.
    async fn probe(&self, node: NodeId) -> Result<(), RecoveryError>;

    /// Create an empty shard on a node.
    async fn open(&self, node: NodeId, key: &ShardKey) -> Result<(), RecoveryError>;

    /// Take a point-in-time snapshot of the documents above `since`.
    async fn snapshot(
        &self,
        node: NodeId,
        key: &ShardKey,
        since: u64,
    ) -> Result<Bytes, RecoveryError>;

    /// Merge an encoded snapshot into a node's shard.
    async fn restore(&self, node: NodeId, key: &ShardKey, data: Bytes)
    -> Result<(), RecoveryError>;

    /// Apply one write to a node's shard.
    async fn apply(&self, node: NodeId, key: &ShardKey, op: &WriteOp)
    -> Result<bool, RecoveryError>;

    /// Make every applied write on a node's shard visible to reads.
    async fn refresh(&self, node: NodeId, key: &ShardKey) -> Result<(), RecoveryError>;

    /// Highest sequence number a node's shard has applied.
    async fn version(&self, node: NodeId, key: &ShardKey) -> Result<u64, RecoveryError>;

    /// Delete whatever a node holds for the shard.
    async fn discard(&self, node: NodeId, key: &ShardKey) -> Result<(), RecoveryError>;
}

/// Source of a shard's data when no copy of it has ever started.
#[async_trait::async_trait]
pub trait DurableLog: Send + Sync {
    /// Load everything durably recorded for the shard.
    async fn load(&self, key: &ShardKey) -> Result<ShardSnapshot, RecoveryError>;
}

/// A durable log with nothing in it: new shards start empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyStoreLog;

#[async_trait::async_trait]
impl DurableLog for EmptyStoreLog {
    async fn load(&self, _key: &ShardKey) -> Result<ShardSnapshot, RecoveryError> {
        Ok(ShardSnapshot::default())
    }
}

/// Encode a snapshot for the wire.
pub fn encode_snapshot(snapshot: &ShardSnapshot) -> Result<Bytes, RecoveryError> {
    Ok(Bytes::from(postcard::to_allocvec(snapshot)?))
}

/// Decode a snapshot received from the wire.
pub fn decode_snapshot(data: &[u8]) -> Result<ShardSnapshot, RecoveryError> {
    Ok(postcard::from_bytes(data)?)
}
