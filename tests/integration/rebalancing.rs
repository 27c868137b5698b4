//! Integration test: rebalancing.
//!
//! Start with a small cluster, add nodes, verify copies spread out and no
//! document is lost on the way.

use std::time::Duration;

use reef_engine::{ClusterHealth, ReefConfig};
use reef_integration_tests::{TestCluster, make_docs};

/// One node holds every copy; two more nodes join and receive a share.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_added_nodes_receive_copies() {
    let c = TestCluster::new(1).await;
    let coll = c.create("docs", 6, 0).await;
    c.await_settled(&coll, ClusterHealth::Green).await;
    let docs = make_docs("doc", 60);
    c.write_all(&coll, &docs).await;

    c.add_node().await;
    c.add_node().await;
    c.await_balanced(&coll).await;

    let load = c.copies_per_node(&coll);
    assert_eq!(load.len(), 3);
    assert!(load.values().all(|&n| n == 2), "unbalanced: {load:?}");
    c.assert_one_primary_per_shard(&coll);
    c.assert_reads(&coll, &docs, 1).await;
}

/// Replicas count towards the load; a shard never gets two copies on one
/// node while moving.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_rebalance_with_replicas() {
    let c = TestCluster::new(2).await;
    let coll = c.create("docs", 3, 1).await;
    c.await_settled(&coll, ClusterHealth::Green).await;
    let docs = make_docs("doc", 30);
    c.write_all(&coll, &docs).await;

    c.add_node().await;
    c.add_node().await;
    c.await_balanced(&coll).await;

    let map = c.coordinator().get_shard_map(&coll).unwrap();
    for entry in &map.shards {
        let nodes: Vec<_> = entry.copies().filter_map(|copy| copy.node).collect();
        let mut unique = nodes.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(nodes.len(), unique.len(), "shard {} doubled up", entry.shard());
    }
    c.assert_reads(&coll, &docs, 1).await;
}

/// With rebalancing off, joining nodes stay empty until something needs
/// placing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_rebalance_disabled_keeps_placement() {
    let config = ReefConfig::from_toml("[allocation]\nrebalance_enabled = false\n").unwrap();
    let c = TestCluster::with_config(1, config).await;
    let coll = c.create("docs", 4, 0).await;
    c.await_settled(&coll, ClusterHealth::Green).await;

    let joined = c.add_node().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let load = c.copies_per_node(&coll);
    assert_eq!(load[&c.node_id(0)], 4);
    assert_eq!(load[&c.node_id(joined)], 0);

    // A new replica still goes to the idle node.
    c.coordinator().update_replicas(&coll, 1).await.unwrap();
    c.await_settled(&coll, ClusterHealth::Green).await;
    assert_eq!(c.copies_per_node(&coll)[&c.node_id(joined)], 4);
}
