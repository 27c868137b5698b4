//! Write queues for copies that are still recovering.
//!
//! A session registers a [`ReplayLog`] for its target before it takes the
//! source snapshot. From then on the write path appends every write it
//! accepts for the shard, and the session replays the queue onto the target
//! after the snapshot lands. Once the log is closed, appenders are told to
//! apply the write to the target themselves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use reef_store::WriteOp;
use reef_types::{CopyId, NodeId, ShardId};

/// Result of appending to a replay log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// The session will replay the write.
    Queued,
    /// The log is closed; the caller must apply the write to the target.
    Closed,
}

#[derive(Debug)]
enum LogState {
    Open(Vec<WriteOp>),
    Closed,
}

/// Writes waiting to be replayed onto one recovering copy.
#[derive(Debug)]
pub struct ReplayLog {
    state: Mutex<LogState>,
}

impl ReplayLog {
    /// Create an open, empty log.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LogState::Open(Vec::new())),
        })
    }

    /// Queue a write for replay.
    pub fn append(&self, op: WriteOp) -> Appended {
        let mut state = self.state.lock().expect("replay log lock poisoned");
        match &mut *state {
            LogState::Open(ops) => {
                ops.push(op);
                Appended::Queued
            }
            LogState::Closed => Appended::Closed,
        }
    }

    /// Take every queued write, leaving the log open.
    pub fn drain(&self) -> Vec<WriteOp> {
        let mut state = self.state.lock().expect("replay log lock poisoned");
        match &mut *state {
            LogState::Open(ops) => std::mem::take(ops),
            LogState::Closed => Vec::new(),
        }
    }

    /// Take every queued write and close the log.
    pub fn close(&self) -> Vec<WriteOp> {
        let mut state = self.state.lock().expect("replay log lock poisoned");
        match std::mem::replace(&mut *state, LogState::Closed) {
            LogState::Open(ops) => ops,
            LogState::Closed => Vec::new(),
        }
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        match &*self.state.lock().expect("replay log lock poisoned") {
            LogState::Open(ops) => ops.len(),
            LogState::Closed => 0,
        }
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the log stopped accepting writes.
    pub fn is_closed(&self) -> bool {
        matches!(
            *self.state.lock().expect("replay log lock poisoned"),
            LogState::Closed
        )
    }
}

/// A registered replay log and the node its copy recovers onto.
#[derive(Debug, Clone)]
pub struct ReplayTarget {
    /// The recovering copy.
    pub copy: CopyId,
    /// Node the copy recovers onto.
    pub node: NodeId,
    /// Its write queue.
    pub log: Arc<ReplayLog>,
}

/// The replay logs of one collection, keyed by copy.
#[derive(Debug, Default)]
pub struct ReplayRegistry {
    logs: Mutex<HashMap<CopyId, ReplayTarget>>,
}

impl ReplayRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a fresh log for `copy`, replacing any previous one.
    pub fn register(&self, copy: CopyId, node: NodeId) -> Arc<ReplayLog> {
        let log = ReplayLog::new();
        let target = ReplayTarget {
            copy,
            node,
            log: log.clone(),
        };
        self.logs
            .lock()
            .expect("replay registry lock poisoned")
            .insert(copy, target);
        log
    }

    /// Drop the log of `copy`.
    pub fn unregister(&self, copy: CopyId) {
        self.logs
            .lock()
            .expect("replay registry lock poisoned")
            .remove(&copy);
    }

    /// Every registered log of a shard.
    pub fn targets(&self, shard: ShardId) -> Vec<ReplayTarget> {
        self.logs
            .lock()
            .expect("replay registry lock poisoned")
            .values()
            .filter(|t| t.copy.shard == shard)
            .cloned()
            .collect()
    }
}
