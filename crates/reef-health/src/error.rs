//! Error types for health queries.

use reef_types::CollectionId;

use crate::monitor::ClusterHealth;

/// Errors returned while waiting on cluster health.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HealthError {
    /// The wanted condition was not reached in time.
    #[error("timed out waiting for {collection} to reach {wanted}, last status {last}")]
    Timeout {
        /// The collection.
        collection: CollectionId,
        /// Status the caller asked for.
        wanted: ClusterHealth,
        /// Status when the wait ended.
        last: ClusterHealth,
    },

    /// The shard map was dropped.
    #[error("shard map of {0} closed")]
    Closed(CollectionId),
}
