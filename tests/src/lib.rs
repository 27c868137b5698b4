//! Shared test harness for Reef integration tests.
//!
//! Provides [`TestCluster`]: a coordinator over N in-process nodes with
//! helpers to start, kill and partition nodes and to check what every
//! STARTED copy serves.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reef_engine::{
    ClusterHealth, Coordinator, HealthReport, LocalTransport, ReadExecution, ReadPreference,
    ReefConfig, telemetry,
};
use reef_types::{CollectionId, CollectionSettings, NodeId, ShardCopy, ShardId};

/// Upper bound for any wait on cluster health.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Derive a node id from a seed byte; ids order like their seeds.
pub fn node_id(seed: u8) -> NodeId {
    NodeId::from([seed; 32])
}

/// Deterministic document body for document `i`.
pub fn doc_source(i: usize) -> String {
    format!(r#"{{"name":"test","n":{i}}}"#)
}

/// A simulated cluster of in-process nodes.
pub struct TestCluster {
    coordinator: Coordinator,
    transport: Arc<LocalTransport>,
    /// Every node ever started, by index.
    nodes: Mutex<Vec<NodeId>>,
}

impl TestCluster {
    /// Start `n` nodes with the default configuration.
    pub async fn new(n: usize) -> Self {
        Self::with_config(n, ReefConfig::default()).await
    }

    /// Start `n` nodes with `config`.
    pub async fn with_config(n: usize, config: ReefConfig) -> Self {
        telemetry::init(&config.log);
        let transport = LocalTransport::new();
        let coordinator = Coordinator::new(config, transport.clone());
        let cluster = Self {
            coordinator,
            transport,
            nodes: Mutex::new(Vec::new()),
        };
        for _ in 0..n {
            cluster.add_node().await;
        }
        cluster
    }

    /// The coordinator.
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// The node data plane.
    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    /// Id of node `i`.
    pub fn node_id(&self, i: usize) -> NodeId {
        self.nodes.lock().expect("node list lock poisoned")[i]
    }

    /// Index of a node id.
    pub fn index_of(&self, node: &NodeId) -> Option<usize> {
        self.nodes
            .lock()
            .expect("node list lock poisoned")
            .iter()
            .position(|n| n == node)
    }

    /// Nodes the coordinator considers live.
    pub fn live_nodes(&self) -> BTreeSet<NodeId> {
        self.coordinator.live_nodes()
    }

    /// Start a new node and announce it. Returns its index.
    pub async fn add_node(&self) -> usize {
        let (idx, id) = {
            let mut nodes = self.nodes.lock().expect("node list lock poisoned");
            let id = node_id(nodes.len() as u8 + 1);
            nodes.push(id);
            (nodes.len() - 1, id)
        };
        self.transport.add_node(id);
        let mut live = self.live_nodes();
        live.insert(id);
        self.coordinator.on_membership_changed(live).await.unwrap();
        idx
    }

    /// Stop node `i`, losing its data, and announce that it left.
    pub async fn kill_node(&self, i: usize) {
        let id = self.node_id(i);
        self.transport.remove_node(&id);
        let mut live = self.live_nodes();
        live.remove(&id);
        self.coordinator.on_membership_changed(live).await.unwrap();
    }

    /// Make node `i` unreachable without telling the coordinator.
    pub fn partition_node(&self, i: usize) {
        self.transport.set_down(self.node_id(i), true);
    }

    /// Make node `i` reachable again.
    pub fn heal_node(&self, i: usize) {
        self.transport.set_down(self.node_id(i), false);
    }

    /// Create a collection.
    pub async fn create(&self, name: &str, shards: u32, replicas: u32) -> CollectionId {
        self.coordinator
            .create_collection(name, CollectionSettings { shards, replicas })
            .await
            .unwrap();
        CollectionId::new(name)
    }

    /// Wait until `collection` is at least `min` with nothing in flight.
    pub async fn await_settled(&self, collection: &CollectionId, min: ClusterHealth) -> HealthReport {
        self.coordinator
            .await_settled(collection, min, SETTLE_TIMEOUT)
            .await
            .unwrap_or_else(|e| panic!("{collection} did not settle: {e}"))
    }

    /// Wait until no node holds more than one copy above any other live node.
    pub async fn await_balanced(&self, collection: &CollectionId) {
        let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
        loop {
            self.await_settled(collection, ClusterHealth::Green).await;
            let load = self.copies_per_node(collection);
            let high = load.values().max().copied().unwrap_or(0);
            let low = load.values().min().copied().unwrap_or(0);
            if high - low <= 1 {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{collection} never balanced: {load:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Copies held by each live node.
    pub fn copies_per_node(&self, collection: &CollectionId) -> BTreeMap<NodeId, usize> {
        let map = self.coordinator.get_shard_map(collection).unwrap();
        self.live_nodes()
            .into_iter()
            .map(|n| (n, map.node_load(&n)))
            .collect()
    }

    /// The STARTED primary of a shard.
    pub fn primary(&self, collection: &CollectionId, shard: ShardId) -> ShardCopy {
        let map = self.coordinator.get_shard_map(collection).unwrap();
        map.shard(shard)
            .and_then(|e| e.active_primary())
            .cloned()
            .unwrap_or_else(|| panic!("shard {shard} of {collection} has no STARTED primary"))
    }

    /// Every shard has exactly one STARTED primary.
    pub fn assert_one_primary_per_shard(&self, collection: &CollectionId) {
        let map = self.coordinator.get_shard_map(collection).unwrap();
        for entry in &map.shards {
            let primaries = entry.copies().filter(|c| c.is_active_primary()).count();
            assert_eq!(primaries, 1, "shard {} has {primaries} primaries", entry.shard());
        }
    }

    /// Index `docs` and refresh.
    pub async fn write_all(&self, collection: &CollectionId, docs: &[(String, String)]) {
        for (id, source) in docs {
            self.coordinator
                .index(collection, id, source.clone())
                .await
                .unwrap_or_else(|e| panic!("write of {id} failed: {e}"));
        }
        self.coordinator.refresh(collection).await.unwrap();
    }

    /// Read every document `rounds` times with each preference and
    /// execution mode and check the exact body comes back.
    pub async fn assert_reads(&self, collection: &CollectionId, docs: &[(String, String)], rounds: usize) {
        for (id, expected) in docs {
            let preferences = [
                ReadPreference::Sequential { key: None },
                ReadPreference::Sequential {
                    key: Some(format!("session-{id}")),
                },
                ReadPreference::Scatter,
            ];
            for preference in preferences {
                for execution in [ReadExecution::Inline, ReadExecution::Spawned] {
                    for round in 0..rounds {
                        let doc = self
                            .coordinator
                            .get(collection, id, preference.clone(), execution)
                            .await
                            .unwrap_or_else(|e| panic!("read of {id} failed: {e}"))
                            .unwrap_or_else(|| {
                                panic!("{id} missing ({preference:?}, {execution:?}, round {round})")
                            });
                        assert_eq!(
                            doc.source.as_ref(),
                            expected.as_bytes(),
                            "{id} mismatch ({preference:?}, {execution:?}, round {round})"
                        );
                    }
                }
            }
        }
    }
}

/// `count` documents with ids `{prefix}-{i}`.
pub fn make_docs(prefix: &str, count: usize) -> Vec<(String, String)> {
    (0..count)
        .map(|i| (format!("{prefix}-{i}"), doc_source(i)))
        .collect()
}
