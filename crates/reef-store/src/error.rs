//! Error types for document storage operations.

use crate::traits::ShardKey;

/// Errors that can occur during document storage operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The node holds no copy of the shard.
    #[error("shard not found: {0}")]
    NotFound(ShardKey),

    /// A snapshot could not be decoded or encoded.
    #[error("snapshot codec error: {0}")]
    Codec(String),
}
