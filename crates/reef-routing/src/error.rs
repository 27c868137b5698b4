//! Error types for request routing.

use std::time::Duration;

use reef_shardmap::MapError;
use reef_types::ShardId;

/// Errors returned by the routing gate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    /// No STARTED primary appeared before the write timeout.
    #[error("no primary available for shard {shard} after {waited:?}")]
    NoPrimaryAvailable {
        /// The shard.
        shard: ShardId,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The shard has no STARTED copy to read from.
    #[error("no started copy of shard {0}")]
    NoCopyAvailable(ShardId),

    /// A read stayed blocked behind a relocation handoff past its timeout.
    #[error("timed out routing to shard {shard} after {waited:?}")]
    Timeout {
        /// The shard.
        shard: ShardId,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Shard map lookup failed (unknown shard).
    #[error("shard map error: {0}")]
    Map(#[from] MapError),
}
