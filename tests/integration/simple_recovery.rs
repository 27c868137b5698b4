//! Integration test: simple recovery.
//!
//! One shard with one replica starts on a single node, gains a replica when
//! a second node joins, then moves its primary to a third node. Every
//! written document must stay readable from every STARTED copy.

use reef_engine::ClusterHealth;
use reef_integration_tests::TestCluster;
use reef_types::{CopyRole, CopyState, ShardId};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_simple_recovery() {
    let c = TestCluster::new(1).await;
    let coord = c.coordinator();
    let test = c.create("test", 1, 1).await;
    let report = c.await_settled(&test, ClusterHealth::Yellow).await;
    assert_eq!(report.unassigned_shards, 1);

    // Single node: only the primary takes part in flush and refresh.
    let first = (String::from("1"), String::from(r#"{"name":"test"}"#));
    coord.index(&test, &first.0, first.1.clone()).await.unwrap();
    let flush = coord.flush(&test).await.unwrap();
    assert_eq!(flush.total_shards, 2);
    assert_eq!(flush.successful_shards, 1);
    assert_eq!(flush.failed_shards, 0);

    let second = (String::from("2"), String::from(r#"{"name":"test2"}"#));
    coord.index(&test, &second.0, second.1.clone()).await.unwrap();
    let refresh = coord.refresh(&test).await.unwrap();
    assert_eq!(refresh.total_shards, 2);
    assert_eq!(refresh.successful_shards, 1);
    assert_eq!(refresh.failed_shards, 0);

    let docs = vec![first, second];
    c.assert_reads(&test, &docs, 5).await;

    // Second node: the replica recovers from the primary.
    c.add_node().await;
    let report = c.await_settled(&test, ClusterHealth::Green).await;
    assert_eq!(report.active_shards, 2);
    c.assert_one_primary_per_shard(&test);
    c.assert_reads(&test, &docs, 5).await;

    let refresh = coord.refresh(&test).await.unwrap();
    assert_eq!(refresh.successful_shards, 2);
    c.assert_reads(&test, &docs, 5).await;

    // Third node: hand the primary over to it.
    let third = c.add_node().await;
    let old_primary = c.primary(&test, ShardId(0));
    let target = coord
        .relocate(
            &test,
            ShardId(0),
            old_primary.node.unwrap(),
            c.node_id(third),
        )
        .await
        .unwrap();
    c.await_settled(&test, ClusterHealth::Green).await;

    let primary = c.primary(&test, ShardId(0));
    assert_eq!(primary.id, target);
    assert_eq!(primary.node, Some(c.node_id(third)));
    assert!(primary.version >= 2);

    let map = coord.get_shard_map(&test).unwrap();
    assert_eq!(map.copies().count(), 2);
    assert!(map.copies().all(|copy| copy.state == CopyState::Started));
    assert!(
        map.copies()
            .any(|copy| copy.role == CopyRole::Replica && copy.node != Some(c.node_id(third)))
    );
    c.assert_one_primary_per_shard(&test);
    c.assert_reads(&test, &docs, 5).await;
}
