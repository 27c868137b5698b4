//! Error types for the coordinator.

use reef_types::{CollectionId, ShardId};

use crate::config::ConfigError;

/// Errors that can occur during coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No collection with this name.
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionId),

    /// A collection with this name already exists.
    #[error("collection already exists: {0}")]
    CollectionExists(CollectionId),

    /// Collection settings were rejected.
    #[error("invalid settings for {collection}: {reason}")]
    InvalidSettings {
        /// The collection.
        collection: CollectionId,
        /// Why the settings were rejected.
        reason: String,
    },

    /// The write reached its primary but the primary could not apply it.
    #[error("write to shard {shard} failed on its primary: {reason}")]
    WriteFailed {
        /// The shard.
        shard: ShardId,
        /// Underlying error.
        reason: String,
    },

    /// Shard map error.
    #[error("shard map error: {0}")]
    Map(#[from] reef_shardmap::MapError),

    /// Rejected placement request.
    #[error("placement error: {0}")]
    Placement(#[from] reef_placement::PlacementError),

    /// Recovery or transport error.
    #[error("recovery error: {0}")]
    Recovery(#[from] reef_recovery::RecoveryError),

    /// Routing error.
    #[error("routing error: {0}")]
    Routing(#[from] reef_routing::RoutingError),

    /// Health wait failed.
    #[error("health error: {0}")]
    Health(#[from] reef_health::HealthError),

    /// Document store error.
    #[error("store error: {0}")]
    Store(#[from] reef_store::StoreError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A spawned read task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The coordinator's control task is gone.
    #[error("coordinator shut down")]
    Shutdown,
}
