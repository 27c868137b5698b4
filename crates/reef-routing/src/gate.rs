//! Copy selection for reads and writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reef_shardmap::{ShardEntry, ShardMap};
use reef_types::{CopyRole, CopyState, ShardCopy, ShardId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::RoutingError;

/// How a read picks among STARTED copies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadPreference {
    /// Only the STARTED primary.
    Primary,
    /// A deterministic copy: the primary when `key` is `None`, otherwise
    /// the copy chosen by hashing `key`.
    Sequential {
        /// Request identity; the same key lands on the same copy while the
        /// set of STARTED copies is unchanged.
        key: Option<String>,
    },
    /// Round-robin over STARTED copies.
    Scatter,
}

impl Default for ReadPreference {
    fn default() -> Self {
        Self::Sequential { key: None }
    }
}

/// A request to route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A write; always goes to the primary.
    Write {
        /// Target shard.
        shard: ShardId,
    },
    /// A read.
    Read {
        /// Target shard.
        shard: ShardId,
        /// Copy selection.
        preference: ReadPreference,
    },
}

impl Operation {
    /// The shard the operation addresses.
    pub fn shard(&self) -> ShardId {
        match self {
            Self::Write { shard } | Self::Read { shard, .. } => *shard,
        }
    }
}

/// Result of a non-blocking routing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The copy to send the request to.
    Target(ShardCopy),
    /// No eligible copy right now, but one is on its way.
    Blocked,
}

/// Routes requests for one collection.
#[derive(Debug)]
pub struct RoutingGate {
    map: Arc<ShardMap>,
    scatter: AtomicUsize,
}

impl RoutingGate {
    /// Create a gate over `map`.
    pub fn new(map: Arc<ShardMap>) -> Self {
        Self {
            map,
            scatter: AtomicUsize::new(0),
        }
    }

    /// Route without waiting.
    ///
    /// Writes are [`RouteOutcome::Blocked`] whenever the shard has no
    /// STARTED primary. Reads are blocked only while a primary is being
    /// brought up or handed off; otherwise a shard with nothing to read
    /// from fails immediately.
    pub fn try_route(&self, op: &Operation) -> Result<RouteOutcome, RoutingError> {
        let shard = op.shard();
        let entry = self.map.current_assignment(shard)?;

        let target = match op {
            Operation::Write { .. } => entry.active_primary().cloned(),
            Operation::Read { preference, .. } => self.pick_read(&entry, preference),
        };
        if let Some(copy) = target {
            trace!(%shard, copy = %copy.id, node = ?copy.node, "routed");
            return Ok(RouteOutcome::Target(copy));
        }

        match op {
            Operation::Write { .. } => Ok(RouteOutcome::Blocked),
            Operation::Read { preference, .. } => {
                if primary_pending(&entry) {
                    Ok(RouteOutcome::Blocked)
                } else if *preference == ReadPreference::Primary {
                    Err(RoutingError::NoPrimaryAvailable {
                        shard,
                        waited: Duration::ZERO,
                    })
                } else {
                    Err(RoutingError::NoCopyAvailable(shard))
                }
            }
        }
    }

    /// Route, waiting up to `timeout` for a blocked shard to open.
    ///
    /// A write that stays blocked fails with
    /// [`RoutingError::NoPrimaryAvailable`]; a read fails with
    /// [`RoutingError::Timeout`].
    pub async fn route(
        &self,
        op: &Operation,
        timeout: Duration,
    ) -> Result<ShardCopy, RoutingError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut changes = self.map.subscribe();
        loop {
            if let RouteOutcome::Target(copy) = self.try_route(op)? {
                return Ok(copy);
            }
            debug!(shard = %op.shard(), "route blocked, waiting for shard map change");
            let woke = tokio::time::timeout_at(deadline, changes.changed()).await;
            if !matches!(woke, Ok(Ok(()))) {
                let shard = op.shard();
                let waited = started.elapsed();
                return Err(match op {
                    Operation::Write { .. } => RoutingError::NoPrimaryAvailable { shard, waited },
                    Operation::Read { .. } => RoutingError::Timeout { shard, waited },
                });
            }
        }
    }

    fn pick_read(&self, entry: &ShardEntry, preference: &ReadPreference) -> Option<ShardCopy> {
        let started: Vec<&ShardCopy> = entry.started().collect();
        if started.is_empty() {
            return None;
        }
        let copy = match preference {
            ReadPreference::Primary => return entry.active_primary().cloned(),
            ReadPreference::Sequential { key: None } => entry
                .active_primary()
                .unwrap_or(started[0]),
            ReadPreference::Sequential { key: Some(key) } => {
                started[key_slot(key, started.len())]
            }
            ReadPreference::Scatter => {
                let n = self.scatter.fetch_add(1, Ordering::Relaxed);
                started[n % started.len()]
            }
        };
        Some(copy.clone())
    }
}

/// A primary is recovering, promoting or handing off, so a STARTED copy is
/// expected shortly.
fn primary_pending(entry: &ShardEntry) -> bool {
    entry.copies().any(|c| {
        c.state == CopyState::Relocating || (c.role == CopyRole::Primary && c.state.is_in_flight())
    })
}

fn key_slot(key: &str, len: usize) -> usize {
    let hash = blake3::hash(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(prefix) % len as u64) as usize
}
