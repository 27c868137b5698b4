//! Core trait and types for document storage.

use std::fmt;

use bytes::Bytes;
use reef_types::{CollectionId, ShardId};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Names one shard of one collection on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ShardKey {
    /// The collection.
    pub collection: CollectionId,
    /// The shard within the collection.
    pub shard: ShardId,
}

impl ShardKey {
    /// Build a key.
    pub fn new(collection: CollectionId, shard: ShardId) -> Self {
        Self { collection, shard }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.collection, self.shard)
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Document body.
    pub source: Bytes,
    /// Primary sequence number of the write that produced this body.
    pub seq: u64,
}

/// A write accepted by a shard's primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOp {
    /// Sequence number assigned by the primary.
    pub seq: u64,
    /// Document id.
    pub id: String,
    /// Document body.
    pub source: Bytes,
}

impl WriteOp {
    /// The document this write produces.
    pub fn to_document(&self) -> Document {
        Document {
            id: self.id.clone(),
            source: self.source.clone(),
            seq: self.seq,
        }
    }
}

/// Point-in-time copy of a shard's applied documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSnapshot {
    /// Documents with a sequence number above the requested floor.
    pub documents: Vec<Document>,
    /// Highest sequence number applied when the snapshot was taken.
    pub max_seq: u64,
}

/// Trait for the documents a node holds for its shard copies.
///
/// Writes are idempotent on sequence numbers: applying an op whose sequence
/// is not newer than the stored document is a no-op, so replaying a write
/// that is also part of a snapshot is harmless.
///
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create an empty shard if the node does not hold it yet.
    async fn open(&self, key: &ShardKey) -> Result<(), StoreError>;

    /// Apply a write. Returns `false` when a newer body was already stored.
    async fn apply(&self, key: &ShardKey, op: &WriteOp) -> Result<bool, StoreError>;

    /// Read the refreshed (visible) body of a document.
    async fn get(&self, key: &ShardKey, id: &str) -> Result<Option<Document>, StoreError>;

    /// Make every applied write visible to reads.
    async fn refresh(&self, key: &ShardKey) -> Result<(), StoreError>;

    /// Commit every applied write and make it visible.
    async fn flush(&self, key: &ShardKey) -> Result<(), StoreError>;

    /// Copy the documents whose sequence number is above `since`.
    async fn snapshot(&self, key: &ShardKey, since: u64) -> Result<ShardSnapshot, StoreError>;

    /// Merge a snapshot into the shard, creating it if needed, and refresh.
    async fn restore(&self, key: &ShardKey, snapshot: ShardSnapshot) -> Result<(), StoreError>;

    /// Highest sequence number applied to the shard.
    async fn version(&self, key: &ShardKey) -> Result<u64, StoreError>;

    /// Whether the node holds the shard.
    async fn contains(&self, key: &ShardKey) -> Result<bool, StoreError>;

    /// Delete the shard and everything in it.
    async fn drop_shard(&self, key: &ShardKey) -> Result<(), StoreError>;

    /// List every shard held by this node.
    async fn list(&self) -> Result<Vec<ShardKey>, StoreError>;
}
