//! Shard copy recovery for Reef.
//!
//! This crate provides:
//!
//! - [`RecoveryExecutor`]: runs one recovery session through its phases:
//!   target registration, snapshot transfer with write replay, and the
//!   version check that moves the copy to STARTED (or hands a relocating
//!   copy's role over to its target).
//! - [`RecoveryScheduler`]: spawns sessions on a bounded pool, keeps at
//!   most one per copy, and supports cancellation.
//! - [`ReplayLog`] / [`ReplayRegistry`]: queues writes accepted while a
//!   copy recovers.
//! - [`WriteFence`]: lets a relocation wait out writes already in progress.
//! - [`Throttle`]: token bucket rate limiter for transfer bandwidth.
//! - [`RecoveryTransport`] and [`DurableLog`]: the collaborators a session
//!   moves data through.

pub mod error;
pub mod executor;
pub mod fence;
pub mod replay;
pub mod scheduler;
pub mod throttle;
pub mod transport;

pub use error::RecoveryError;
pub use executor::{RecoveryExecutor, RecoveryScope, RecoverySource, RecoveryTask};
pub use fence::WriteFence;
pub use replay::{Appended, ReplayLog, ReplayRegistry, ReplayTarget};
pub use scheduler::{RecoveryScheduler, SessionKey, SessionReport};
pub use throttle::Throttle;
pub use transport::{DurableLog, EmptyStoreLog, RecoveryTransport, decode_snapshot, encode_snapshot};
