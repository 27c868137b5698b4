//! Per-collection state owned by the coordinator.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use reef_health::HealthMonitor;
use reef_recovery::{RecoveryScope, ReplayRegistry, WriteFence};
use reef_routing::RoutingGate;
use reef_shardmap::ShardMap;
use reef_store::ShardKey;
use reef_types::events::EventBus;
use reef_types::{CollectionId, CollectionSettings, ShardId};
use tokio::task::JoinHandle;

/// Everything the coordinator keeps for one collection.
pub(crate) struct Collection {
    pub(crate) map: Arc<ShardMap>,
    pub(crate) scope: RecoveryScope,
    pub(crate) gate: RoutingGate,
    pub(crate) health: HealthMonitor,
    /// Last sequence number handed out per shard.
    seq: Vec<AtomicU64>,
    /// Emits `HealthChanged` events.
    reporter: JoinHandle<()>,
}

impl Collection {
    pub(crate) fn new(name: CollectionId, settings: CollectionSettings, bus: EventBus) -> Self {
        let map = ShardMap::new(name, settings);
        let health = HealthMonitor::new(map.clone());
        let reporter = health.spawn_reporter(bus);
        Self {
            scope: RecoveryScope {
                map: map.clone(),
                replay: ReplayRegistry::new(),
                fence: WriteFence::new(settings.shards),
            },
            gate: RoutingGate::new(map.clone()),
            health,
            seq: (0..settings.shards).map(|_| AtomicU64::new(0)).collect(),
            reporter,
            map,
        }
    }

    pub(crate) fn name(&self) -> &CollectionId {
        self.map.collection()
    }

    /// Storage key of a shard on every node.
    pub(crate) fn key(&self, shard: ShardId) -> ShardKey {
        ShardKey::new(self.name().clone(), shard)
    }

    /// The shard a document id lives in.
    pub(crate) fn shard_for(&self, id: &str) -> ShardId {
        ShardId::for_document(id, self.map.settings().shards)
    }

    /// Hand out the next write sequence number of a shard.
    pub(crate) fn next_seq(&self, shard: ShardId) -> u64 {
        self.seq[shard.index()].fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        self.reporter.abort();
    }
}
