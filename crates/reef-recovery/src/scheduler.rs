//! Recovery scheduler: runs sessions on a bounded pool.
//!
//! Every session gets its own task, which waits for a semaphore permit
//! before transferring anything, so excess sessions queue instead of
//! polling. At most one session exists per copy; cancelling a session
//! aborts its task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use reef_types::{CollectionId, CopyId, NodeId};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::RecoveryError;
use crate::executor::{RecoveryExecutor, RecoveryTask};

/// Identifies a session: one per copy of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// The collection.
    pub collection: CollectionId,
    /// The recovering copy.
    pub copy: CopyId,
}

/// Sent when a session finishes on its own (not when it is cancelled).
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// The session.
    pub key: SessionKey,
    /// Node the copy was recovering onto.
    pub target: NodeId,
    /// Version the copy started at, or why it failed.
    pub result: Result<u64, RecoveryError>,
}

struct Session {
    id: u64,
    handle: JoinHandle<()>,
}

type Sessions = Arc<Mutex<HashMap<SessionKey, Session>>>;

/// Dispatches recovery sessions to the executor.
pub struct RecoveryScheduler {
    executor: Arc<RecoveryExecutor>,
    /// Limits concurrent transfers.
    concurrency: Arc<Semaphore>,
    sessions: Sessions,
    next_id: AtomicU64,
    /// Sessions that reached STARTED since the scheduler was created.
    completed: Arc<AtomicU64>,
    /// Sessions that failed since the scheduler was created.
    failed: Arc<AtomicU64>,
    reports: mpsc::UnboundedSender<SessionReport>,
}

impl RecoveryScheduler {
    /// Create a scheduler running at most `max_concurrent` sessions at once.
    ///
    /// The receiver yields a [`SessionReport`] for every session that ends.
    pub fn new(
        executor: Arc<RecoveryExecutor>,
        max_concurrent: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            executor,
            concurrency: Arc::new(Semaphore::new(max_concurrent.max(1))),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            completed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            reports,
        });
        (scheduler, rx)
    }

    /// Start a session. Returns `false` if the copy already has one.
    pub fn spawn(&self, task: RecoveryTask) -> bool {
        let key = SessionKey {
            collection: task.collection().clone(),
            copy: task.copy,
        };
        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        if sessions.contains_key(&key) {
            debug!(collection = %key.collection, copy = %key.copy, "session already running");
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let executor = self.executor.clone();
        let concurrency = self.concurrency.clone();
        let table = self.sessions.clone();
        let completed = self.completed.clone();
        let failed = self.failed.clone();
        let reports = self.reports.clone();
        let own_key = key.clone();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = concurrency.acquire_owned().await else {
                return;
            };

            let result = executor.attempt(&task).await.map(|o| o.version);

            // Leave the table before the copy is released, so a re-plan that
            // assigns it again can start a new session.
            {
                let mut table = table.lock().expect("session table lock poisoned");
                if table.get(&own_key).is_some_and(|s| s.id == id) {
                    table.remove(&own_key);
                }
            }
            match &result {
                Ok(version) => {
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    info!(collection = %own_key.collection, copy = %own_key.copy, version, completed = done, "recovery session completed");
                }
                Err(e) => {
                    executor.abandon(&task, e);
                    let err = failed.fetch_add(1, Ordering::Relaxed) + 1;
                    error!(collection = %own_key.collection, copy = %own_key.copy, failed = err, error = %e, "recovery session failed");
                }
            }
            let _ = reports.send(SessionReport {
                key: own_key,
                target: task.target,
                result,
            });
        });

        sessions.insert(key, Session { id, handle });
        true
    }

    /// Abort a running or queued session. Returns `false` if none existed.
    ///
    /// The caller is responsible for the copy's map entry and any partial
    /// data on the target.
    pub fn cancel(&self, key: &SessionKey) -> bool {
        let removed = self
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .remove(key);
        match removed {
            Some(session) => {
                session.handle.abort();
                info!(collection = %key.collection, copy = %key.copy, "recovery session cancelled");
                true
            }
            None => false,
        }
    }

    /// Abort every session.
    pub fn shutdown(&self) {
        let sessions: Vec<Session> = self
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in sessions {
            session.handle.abort();
        }
    }

    /// Whether a session exists for the key.
    pub fn is_running(&self, key: &SessionKey) -> bool {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .contains_key(key)
    }

    /// Sessions running or waiting for a permit.
    pub fn active(&self) -> usize {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .len()
    }

    /// Sessions completed so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Sessions failed so far.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// The executor sessions run on.
    pub fn executor(&self) -> &Arc<RecoveryExecutor> {
        &self.executor
    }
}

impl Drop for RecoveryScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
