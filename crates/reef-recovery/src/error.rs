//! Error types for recovery operations.

use reef_shardmap::MapError;
use reef_store::StoreError;
use reef_types::{CopyId, NodeId};

/// Errors that can occur while recovering a copy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryError {
    /// A node did not answer.
    #[error("node unreachable: {0:?}")]
    NodeUnreachable(NodeId),

    /// The session gave up after exhausting its attempts.
    #[error("recovery of {copy} failed after {attempts} attempt(s): {reason}")]
    RecoveryFailed {
        /// The copy being recovered.
        copy: CopyId,
        /// Attempts made.
        attempts: u32,
        /// Last error seen.
        reason: String,
    },

    /// The target did not catch up with its source within the delta budget.
    #[error("version mismatch on {copy}: source at {expected}, target at {actual}")]
    VersionMismatch {
        /// The copy being recovered.
        copy: CopyId,
        /// Source version.
        expected: u64,
        /// Target version.
        actual: u64,
    },

    /// The copy to recover from no longer holds data.
    #[error("recovery source {0} is unavailable")]
    SourceUnavailable(CopyId),

    /// The session was cancelled.
    #[error("recovery of {0} cancelled")]
    Cancelled(CopyId),

    /// A shard map transition was refused.
    #[error("shard map error: {0}")]
    Map(#[from] MapError),

    /// The document store on a node failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A snapshot could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl RecoveryError {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NodeUnreachable(_))
    }
}

impl From<postcard::Error> for RecoveryError {
    fn from(e: postcard::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
