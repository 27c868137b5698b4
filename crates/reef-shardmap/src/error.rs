//! Error types for shard map mutations.

use reef_types::{CopyId, CopyState, NodeId, ShardId};

/// Errors returned when a transition cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The shard index is outside the collection.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// No copy with this id exists in the shard.
    #[error("copy not found: {0}")]
    CopyNotFound(CopyId),

    /// The copy is not in the state the caller expected.
    ///
    /// Callers re-read the shard and retry; the map is never overwritten.
    #[error("conflict on copy {copy}: expected {expected}, found {actual}")]
    Conflict {
        /// The contested copy.
        copy: CopyId,
        /// State the caller expected.
        expected: CopyState,
        /// State the map actually holds.
        actual: CopyState,
    },

    /// The requested state change is not in the transition table.
    #[error("illegal transition for copy {copy}: {from} -> {to}")]
    IllegalTransition {
        /// The copy.
        copy: CopyId,
        /// Current state.
        from: CopyState,
        /// Requested state.
        to: CopyState,
    },

    /// Another copy of the same shard already lives on the node.
    #[error("node {node:?} already hosts a copy of shard {shard}")]
    NodeOccupied {
        /// The shard.
        shard: ShardId,
        /// The occupied node.
        node: NodeId,
    },

    /// Starting this copy would expose two STARTED primaries.
    #[error("shard {0} already has a started primary")]
    DualPrimary(ShardId),

    /// Starting this replica would exceed the configured replica count.
    #[error("shard {shard} already has {limit} started replicas")]
    ReplicaLimit {
        /// The shard.
        shard: ShardId,
        /// Configured replica count.
        limit: u32,
    },

    /// A version record would move a copy's version backwards.
    #[error("version of copy {copy} cannot go from {current} to {proposed}")]
    VersionRegression {
        /// The copy.
        copy: CopyId,
        /// Version currently recorded.
        current: u64,
        /// Rejected version.
        proposed: u64,
    },

    /// The copy already has a relocation target.
    #[error("copy {0} is already relocating")]
    AlreadyRelocating(CopyId),

    /// The transition needs the copy to hold another role.
    #[error("copy {0} has the wrong role for this transition")]
    WrongRole(CopyId),
}

impl MapError {
    /// Whether the error means "someone else moved first, re-read and retry".
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            MapError::Conflict { .. } | MapError::CopyNotFound(_) | MapError::DualPrimary(_)
        )
    }
}
