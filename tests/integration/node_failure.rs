//! Integration test: node failure.
//!
//! Kill nodes holding primaries and replicas, verify promotion, re-recovery
//! and the handling of a shard whose every copy is gone.

use std::time::Duration;

use reef_engine::{ClusterHealth, EngineError};
use reef_health::HealthError;
use reef_integration_tests::{TestCluster, make_docs, node_id};
use reef_types::ShardId;
use reef_types::events::{PrimaryPromoted, RecoveryFailed};

/// 3 nodes, 2 shards with one replica. Killing the node with the primary of
/// shard 0 promotes its replica and rebuilds the lost copies elsewhere.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_kill_primary_node_promotes_replica() {
    let c = TestCluster::new(3).await;
    let mut promoted = c.coordinator().event_bus().subscribe::<PrimaryPromoted>();
    let coll = c.create("docs", 2, 1).await;
    c.await_settled(&coll, ClusterHealth::Green).await;

    let docs = make_docs("doc", 40);
    c.write_all(&coll, &docs).await;

    let victim = c.primary(&coll, ShardId(0)).node.unwrap();
    c.kill_node(c.index_of(&victim).unwrap()).await;

    let event = promoted.recv().await.unwrap();
    assert_eq!(event.copy.shard, ShardId(0));
    assert_ne!(event.node, victim);

    let report = c.await_settled(&coll, ClusterHealth::Green).await;
    assert_eq!(report.active_shards, 4);
    assert_eq!(report.lost_shards, 0);
    c.assert_one_primary_per_shard(&coll);
    assert!(c.copies_per_node(&coll).values().all(|&n| n == 2));
    c.assert_reads(&coll, &docs, 2).await;
}

/// Killing the node of a replica leaves the primary in place.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_kill_replica_node_keeps_primary() {
    let c = TestCluster::new(3).await;
    let coll = c.create("docs", 1, 1).await;
    c.await_settled(&coll, ClusterHealth::Green).await;
    let docs = make_docs("doc", 10);
    c.write_all(&coll, &docs).await;

    let primary = c.primary(&coll, ShardId(0));
    let map = c.coordinator().get_shard_map(&coll).unwrap();
    let replica_node = map
        .copies()
        .find(|copy| copy.id != primary.id)
        .and_then(|copy| copy.node)
        .unwrap();
    c.kill_node(c.index_of(&replica_node).unwrap()).await;

    c.await_settled(&coll, ClusterHealth::Green).await;
    assert_eq!(c.primary(&coll, ShardId(0)).id, primary.id);
    c.assert_reads(&coll, &docs, 2).await;
}

/// With no replica left, losing the primary's node leaves the shard RED
/// until a new primary is forced from the last flush.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_total_loss_needs_forced_primary() {
    let c = TestCluster::new(2).await;
    let coll = c.create("docs", 1, 0).await;
    c.await_settled(&coll, ClusterHealth::Green).await;

    let flushed = make_docs("flushed", 5);
    c.write_all(&coll, &flushed).await;
    c.coordinator().flush(&coll).await.unwrap();
    let unflushed = make_docs("unflushed", 5);
    c.write_all(&coll, &unflushed).await;

    let victim = c.primary(&coll, ShardId(0)).node.unwrap();
    c.kill_node(c.index_of(&victim).unwrap()).await;

    let report = c.coordinator().health(&coll).unwrap();
    assert_eq!(report.status, ClusterHealth::Red);
    assert_eq!(report.lost_shards, 1);

    let err = c
        .coordinator()
        .await_status(&coll, ClusterHealth::Yellow, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Health(HealthError::Timeout {
            last: ClusterHealth::Red,
            ..
        })
    ));

    c.coordinator()
        .force_allocate_primary(&coll, ShardId(0))
        .await
        .unwrap();
    let report = c.await_settled(&coll, ClusterHealth::Green).await;
    assert_eq!(report.lost_shards, 0);
    c.assert_reads(&coll, &flushed, 1).await;
    for (id, _) in &unflushed {
        let doc = c
            .coordinator()
            .get(&coll, id, Default::default(), Default::default())
            .await
            .unwrap();
        assert!(doc.is_none(), "{id} was never flushed");
    }
}

/// A joining node that cannot be reached fails its recovery; once it is
/// reachable the next plan recovers it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_unreachable_node_is_retried_after_failure() {
    let c = TestCluster::new(1).await;
    let mut failed = c.coordinator().event_bus().subscribe::<RecoveryFailed>();
    let coll = c.create("docs", 1, 1).await;
    c.await_settled(&coll, ClusterHealth::Yellow).await;
    let docs = make_docs("doc", 10);
    c.write_all(&coll, &docs).await;

    // The second node runs but every call to it fails.
    c.transport().add_node(node_id(2));
    c.transport().set_down(node_id(2), true);
    let idx = c.add_node().await;
    assert_eq!(c.node_id(idx), node_id(2));

    let event = failed.recv().await.unwrap();
    assert_eq!(event.collection, coll);
    assert_eq!(c.coordinator().health(&coll).unwrap().status, ClusterHealth::Yellow);

    c.heal_node(idx);
    c.await_settled(&coll, ClusterHealth::Green).await;
    c.assert_reads(&coll, &docs, 2).await;
}
