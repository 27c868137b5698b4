//! Error types for allocation requests.

use reef_types::{NodeId, ShardId};

/// Errors produced when validating an explicit allocation command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// The shard index is outside the collection.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// No copy of the shard lives on the source node.
    #[error("shard {shard} has no copy on node {node:?}")]
    NoCopyOnNode {
        /// The shard.
        shard: ShardId,
        /// The node that was named as source.
        node: NodeId,
    },

    /// Only STARTED copies can be relocated.
    #[error("copy of shard {0} on the source node is not started")]
    NotStarted(ShardId),

    /// The destination is not a live node.
    #[error("node {0:?} is not a live member")]
    NodeNotLive(NodeId),

    /// The destination already holds a copy of the shard.
    #[error("node {node:?} already hosts a copy of shard {shard}")]
    NodeOccupied {
        /// The shard.
        shard: ShardId,
        /// The occupied node.
        node: NodeId,
    },

    /// The copy is already moving.
    #[error("copy of shard {0} is already relocating")]
    AlreadyRelocating(ShardId),

    /// Manual primary allocation is only for shards flagged as lost.
    #[error("shard {0} is not lost")]
    NotLost(ShardId),
}
