//! The Routing Gate: picks the copy that serves each request.
//!
//! Writes go to the shard's STARTED primary; when there is none (promotion
//! or relocation handoff in progress) [`RoutingGate::route`] waits on the
//! shard map until one appears or the caller's timeout runs out. Reads go to
//! any STARTED copy chosen by a [`ReadPreference`]. Copies in any other state
//! are never returned.

mod error;
mod gate;

pub use error::RoutingError;
pub use gate::{Operation, ReadPreference, RouteOutcome, RoutingGate};
