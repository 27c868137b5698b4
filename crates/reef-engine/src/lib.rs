//! Reef coordinator.
//!
//! The [`Coordinator`] owns a shard map per collection and keeps it
//! converging on a valid placement over the live nodes: it runs the
//! allocation planner on every membership change, drives the recovery
//! sessions the planner asks for, promotes replicas when a primary's node
//! leaves and reports per-collection health.
//!
//! Nodes are in-process [`LocalTransport`] stores. The data plane
//! ([`Coordinator::index`], [`Coordinator::get`], [`Coordinator::refresh`],
//! [`Coordinator::flush`]) routes every request through the collection's
//! routing gate, so requests only ever reach STARTED copies.

mod collection;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod telemetry;
pub mod transport;

pub use config::{ConfigError, LogSection, ReefConfig, RoutingSection};
pub use coordinator::Coordinator;
pub use data::{BroadcastResponse, IndexResponse, ReadExecution};
pub use error::EngineError;
pub use transport::{FlushedLog, LocalTransport};

pub use reef_health::{ClusterHealth, HealthReport};
pub use reef_routing::{Operation, ReadPreference, RouteOutcome};
