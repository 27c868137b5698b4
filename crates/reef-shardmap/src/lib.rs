//! The Shard Map: who holds which copy of every shard, and in what state.
//!
//! [`ShardMap`] is the single shared mutable resource of the allocation and
//! recovery subsystem. Readers take cheap per-shard snapshots
//! ([`ShardEntry`] behind an `Arc`) and never block writers for longer than
//! a pointer swap. Every mutation is a [`Transition`] applied atomically to
//! one shard's copy set and validated against the caller's expected prior
//! state, so concurrent recovery completions cannot overwrite each other.

mod error;
mod map;

pub use error::MapError;
pub use map::{ShardEntry, ShardMap, ShardMapSnapshot, Transition};
