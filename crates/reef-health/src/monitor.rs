//! Health computation and the status watcher.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reef_shardmap::{ShardMap, ShardMapSnapshot};
use reef_types::events::{EventBus, HealthChanged};
use reef_types::{CollectionId, CopyState};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::HealthError;

/// Aggregate status of a collection. Ordered `Red < Yellow < Green`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClusterHealth {
    /// Some shard has no STARTED primary.
    Red,
    /// Every shard has a STARTED primary but some replicas are missing.
    Yellow,
    /// Every configured copy is STARTED.
    Green,
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Red => "RED",
            Self::Yellow => "YELLOW",
            Self::Green => "GREEN",
        };
        f.write_str(s)
    }
}

/// Status plus copy counters for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// The collection.
    pub collection: CollectionId,
    /// Aggregate status.
    pub status: ClusterHealth,
    /// Shards with a STARTED primary.
    pub active_primaries: usize,
    /// STARTED copies of any role.
    pub active_shards: usize,
    /// Copies being moved to another node.
    pub relocating_shards: usize,
    /// Copies owned by a recovery session, relocation targets included.
    pub initializing_shards: usize,
    /// Copies with no node.
    pub unassigned_shards: usize,
    /// Shards flagged as having lost every data-holding copy.
    pub lost_shards: usize,
}

impl HealthReport {
    /// Compute health from a shard map snapshot.
    pub fn compute(snapshot: &ShardMapSnapshot) -> Self {
        let wanted_replicas = snapshot.settings.replicas as usize;
        let mut status = ClusterHealth::Green;
        let mut report = Self {
            collection: snapshot.collection.clone(),
            status,
            active_primaries: 0,
            active_shards: 0,
            relocating_shards: 0,
            initializing_shards: 0,
            unassigned_shards: 0,
            lost_shards: 0,
        };

        for entry in &snapshot.shards {
            if entry.is_lost() {
                report.lost_shards += 1;
            }
            if entry.active_primary().is_some() {
                report.active_primaries += 1;
                if entry.started_replicas() < wanted_replicas {
                    status = status.min(ClusterHealth::Yellow);
                }
            } else {
                status = ClusterHealth::Red;
            }

            for copy in entry.copies() {
                match copy.state {
                    CopyState::Started => report.active_shards += 1,
                    CopyState::Unassigned => report.unassigned_shards += 1,
                    CopyState::Initializing | CopyState::Recovering => {
                        report.initializing_shards += 1;
                        if copy.is_relocation_target() {
                            report.relocating_shards += 1;
                        }
                    }
                    // Counted through its target above.
                    CopyState::Relocating => {}
                }
            }
        }

        report.status = status;
        report
    }

    /// Whether no copy is moving or recovering.
    pub fn is_settled(&self) -> bool {
        self.relocating_shards == 0 && self.initializing_shards == 0
    }

    /// STARTED replicas (active copies minus active primaries).
    pub fn active_replicas(&self) -> usize {
        self.active_shards.saturating_sub(self.active_primaries)
    }
}

/// Watches one collection's shard map and answers health queries.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    map: Arc<ShardMap>,
}

impl HealthMonitor {
    /// Create a monitor over `map`.
    pub fn new(map: Arc<ShardMap>) -> Self {
        Self { map }
    }

    /// Current health.
    pub fn report(&self) -> HealthReport {
        HealthReport::compute(&self.map.snapshot())
    }

    /// Current status only.
    pub fn status(&self) -> ClusterHealth {
        self.report().status
    }

    /// Wait until the status is at least `min`.
    ///
    /// Returns the first report that satisfies it, or
    /// [`HealthError::Timeout`] carrying the last observed status.
    pub async fn await_status(
        &self,
        min: ClusterHealth,
        timeout: Duration,
    ) -> Result<HealthReport, HealthError> {
        self.await_report(min, timeout, |r| r.status >= min).await
    }

    /// Wait until the status is at least `min` and nothing is in flight.
    pub async fn await_settled(
        &self,
        min: ClusterHealth,
        timeout: Duration,
    ) -> Result<HealthReport, HealthError> {
        self.await_report(min, timeout, |r| r.status >= min && r.is_settled())
            .await
    }

    async fn await_report(
        &self,
        wanted: ClusterHealth,
        timeout: Duration,
        done: impl Fn(&HealthReport) -> bool,
    ) -> Result<HealthReport, HealthError> {
        let deadline = Instant::now() + timeout;
        // Subscribe before the first read so no change slips in between.
        let mut changes = self.map.subscribe();
        loop {
            let report = self.report();
            if done(&report) {
                return Ok(report);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(HealthError::Closed(report.collection)),
                Err(_) => {
                    return Err(HealthError::Timeout {
                        collection: report.collection,
                        wanted,
                        last: report.status,
                    });
                }
            }
        }
    }

    /// Spawn a task that emits [`HealthChanged`] whenever the status moves.
    ///
    /// The task holds the map alive; abort the handle to stop it.
    pub fn spawn_reporter(&self, bus: EventBus) -> JoinHandle<()> {
        let monitor = self.clone();
        let mut changes = self.map.subscribe();
        tokio::spawn(async move {
            let mut last = monitor.status();
            debug!(collection = %monitor.map.collection(), status = %last, "health reporter started");
            while changes.changed().await.is_ok() {
                let report = monitor.report();
                if report.status == last {
                    continue;
                }
                info!(
                    collection = %report.collection,
                    from = %last,
                    to = %report.status,
                    active_primaries = report.active_primaries,
                    active_shards = report.active_shards,
                    unassigned = report.unassigned_shards,
                    "cluster health changed"
                );
                last = report.status;
                bus.emit(HealthChanged {
                    collection: report.collection,
                    status: last.to_string(),
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use reef_shardmap::Transition;
    use reef_types::{CollectionSettings, CopyId, NodeId, ShardId};

    use super::*;

    fn node(n: u8) -> NodeId {
        NodeId::from([n; 32])
    }

    fn map(shards: u32, replicas: u32) -> Arc<ShardMap> {
        ShardMap::new(
            CollectionId::new("test"),
            CollectionSettings { shards, replicas },
        )
    }

    fn start(map: &ShardMap, copy: CopyId, n: u8) {
        map.apply(copy.shard, Transition::Assign { copy, node: node(n) })
            .unwrap();
        map.apply_transition(copy, CopyState::Initializing, CopyState::Recovering)
            .unwrap();
        map.apply_transition(copy, CopyState::Recovering, CopyState::Started)
            .unwrap();
    }

    #[test]
    fn test_status_order() {
        assert!(ClusterHealth::Red < ClusterHealth::Yellow);
        assert!(ClusterHealth::Yellow < ClusterHealth::Green);
        assert_eq!(ClusterHealth::Yellow.to_string(), "YELLOW");
    }

    #[test]
    fn test_unassigned_collection_is_red() {
        let m = map(2, 1);
        let report = HealthReport::compute(&m.snapshot());
        assert_eq!(report.status, ClusterHealth::Red);
        assert_eq!(report.active_primaries, 0);
        assert_eq!(report.unassigned_shards, 4);
    }

    #[test]
    fn test_missing_replica_is_yellow() {
        let m = map(1, 1);
        start(&m, CopyId::new(ShardId(0), 0), 1);
        let report = HealthReport::compute(&m.snapshot());
        assert_eq!(report.status, ClusterHealth::Yellow);
        assert_eq!(report.active_primaries, 1);
        assert_eq!(report.active_shards, 1);
        assert_eq!(report.unassigned_shards, 1);
    }

    #[test]
    fn test_one_red_shard_makes_collection_red() {
        let m = map(2, 0);
        start(&m, CopyId::new(ShardId(0), 0), 1);
        assert_eq!(HealthReport::compute(&m.snapshot()).status, ClusterHealth::Red);
        start(&m, CopyId::new(ShardId(1), 0), 1);
        assert_eq!(HealthReport::compute(&m.snapshot()).status, ClusterHealth::Green);
    }

    #[test]
    fn test_all_started_is_green() {
        let m = map(1, 1);
        start(&m, CopyId::new(ShardId(0), 0), 1);
        start(&m, CopyId::new(ShardId(0), 1), 2);
        let report = HealthReport::compute(&m.snapshot());
        assert_eq!(report.status, ClusterHealth::Green);
        assert_eq!(report.active_replicas(), 1);
        assert!(report.is_settled());
    }

    #[test]
    fn test_relocation_counts_as_relocating_and_initializing() {
        let m = map(1, 0);
        let primary = CopyId::new(ShardId(0), 0);
        start(&m, primary, 1);
        m.apply(
            ShardId(0),
            Transition::Relocate {
                source: primary,
                node: node(2),
            },
        )
        .unwrap();

        let report = HealthReport::compute(&m.snapshot());
        // The source keeps serving until handoff.
        assert_eq!(report.status, ClusterHealth::Green);
        assert_eq!(report.relocating_shards, 1);
        assert_eq!(report.initializing_shards, 1);
        assert!(!report.is_settled());
    }

    #[test]
    fn test_lost_shard_counted() {
        let m = map(1, 0);
        m.set_lost(ShardId(0), true).unwrap();
        let report = HealthReport::compute(&m.snapshot());
        assert_eq!(report.status, ClusterHealth::Red);
        assert_eq!(report.lost_shards, 1);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn test_await_status_wakes_on_change() {
        let m = map(1, 1);
        let monitor = HealthMonitor::new(m.clone());

        let writer = m.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            start(&writer, CopyId::new(ShardId(0), 0), 1);
        });

        let report = monitor
            .await_status(ClusterHealth::Yellow, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(report.status, ClusterHealth::Yellow);
    }

    #[tokio::test]
    async fn test_await_status_already_satisfied() {
        let m = map(1, 0);
        start(&m, CopyId::new(ShardId(0), 0), 1);
        let monitor = HealthMonitor::new(m);
        let report = monitor
            .await_status(ClusterHealth::Green, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(report.status, ClusterHealth::Green);
    }

    #[tokio::test]
    async fn test_await_status_times_out() {
        let monitor = HealthMonitor::new(map(1, 1));
        let err = monitor
            .await_status(ClusterHealth::Green, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HealthError::Timeout {
                collection: CollectionId::new("test"),
                wanted: ClusterHealth::Green,
                last: ClusterHealth::Red,
            }
        );
    }

    #[tokio::test]
    async fn test_await_settled_waits_for_relocation() {
        let m = map(1, 0);
        let primary = CopyId::new(ShardId(0), 0);
        start(&m, primary, 1);
        let target = m
            .apply(
                ShardId(0),
                Transition::Relocate {
                    source: primary,
                    node: node(2),
                },
            )
            .unwrap()
            .id;
        let monitor = HealthMonitor::new(m.clone());

        assert!(
            monitor
                .await_settled(ClusterHealth::Green, Duration::from_millis(30))
                .await
                .is_err()
        );

        m.apply(ShardId(0), Transition::Remove { copy: target })
            .unwrap();
        let report = monitor
            .await_settled(ClusterHealth::Green, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(report.is_settled());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn test_reporter_emits_health_changed() {
        let m = map(1, 1);
        let bus = EventBus::new();
        let mut rx = bus.subscribe::<HealthChanged>();
        let handle = HealthMonitor::new(m.clone()).spawn_reporter(bus);
        tokio::task::yield_now().await;

        start(&m, CopyId::new(ShardId(0), 0), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, "YELLOW");

        start(&m, CopyId::new(ShardId(0), 1), 2);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, "GREEN");
        handle.abort();
    }
}
