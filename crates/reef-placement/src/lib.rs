//! Allocation planner for shard copies.
//!
//! The planner is a pure function from the current shard map snapshot, the
//! live node set and the allocation config to an [`AllocationPlan`]: the
//! ordered list of [`Decision`]s that moves the map towards a placement where
//!
//! - copies of one shard sit on distinct nodes,
//! - per-node copy counts differ by at most one when the cluster allows it,
//! - STARTED copies only move when a constraint is violated.
//!
//! Slots are filled greedily from a work queue: each picks the live node with
//! the fewest assigned or in-flight copies that does not already host the
//! shard, ties broken by the lowest node id, so identical inputs always yield
//! identical plans.

mod error;
mod planner;

pub use error::PlacementError;
pub use planner::{AllocationPlan, AllocationPlanner, Decision};
