//! Cluster health for Reef collections.
//!
//! Health is derived from a shard map snapshot and never mutates it:
//!
//! - **RED**: some shard has no STARTED primary.
//! - **YELLOW**: every shard has a STARTED primary, but some shard has fewer
//!   STARTED replicas than configured.
//! - **GREEN**: every configured copy is STARTED.
//!
//! [`HealthMonitor`] wakes on shard map changes to serve `await_status`
//! callers without polling.

mod error;
mod monitor;

pub use error::HealthError;
pub use monitor::{ClusterHealth, HealthMonitor, HealthReport};
