//! Integration test: writes while copies recover or move.
//!
//! Snapshots are slowed down so writes land between the snapshot and the
//! moment the new copy starts serving. Every acknowledged write must end up
//! on every STARTED copy.

use std::sync::Arc;
use std::time::Duration;

use reef_engine::ClusterHealth;
use reef_integration_tests::{TestCluster, doc_source, make_docs};
use reef_store::DocumentStore;
use reef_types::{CollectionId, ShardId};

/// Index `count` documents with ids `{prefix}-{i}` one after another.
async fn write_stream(c: Arc<TestCluster>, coll: CollectionId, prefix: &'static str, count: usize) {
    for i in 0..count {
        c.coordinator()
            .index(&coll, &format!("{prefix}-{i}"), doc_source(i))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Check that every STARTED copy applied every document.
async fn assert_on_every_copy(c: &TestCluster, coll: &CollectionId, docs: &[(String, String)]) {
    let map = c.coordinator().get_shard_map(coll).unwrap();
    for entry in &map.shards {
        for copy in entry.started() {
            let store = c.transport().store(copy.node.unwrap()).unwrap();
            let key = reef_store::ShardKey::new(coll.clone(), entry.shard());
            for (id, source) in docs {
                if ShardId::for_document(id, map.settings.shards) != entry.shard() {
                    continue;
                }
                let doc = store
                    .get(&key, id)
                    .await
                    .unwrap()
                    .unwrap_or_else(|| panic!("{id} missing on copy {}", copy.id));
                assert_eq!(doc.source.as_ref(), source.as_bytes());
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_writes_during_replica_recovery() {
    let c = Arc::new(TestCluster::new(1).await);
    let coll = c.create("docs", 1, 1).await;
    c.await_settled(&coll, ClusterHealth::Yellow).await;
    let before = make_docs("before", 20);
    c.write_all(&coll, &before).await;

    c.transport().set_snapshot_delay(Duration::from_millis(150));
    let writer = tokio::spawn(write_stream(c.clone(), coll.clone(), "during", 40));
    c.add_node().await;
    writer.await.unwrap();
    c.transport().set_snapshot_delay(Duration::ZERO);

    c.await_settled(&coll, ClusterHealth::Green).await;
    c.coordinator().refresh(&coll).await.unwrap();

    let mut all = before;
    all.extend(make_docs("during", 40));
    assert_on_every_copy(&c, &coll, &all).await;
    c.assert_reads(&coll, &all, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_writes_during_primary_relocation() {
    let c = Arc::new(TestCluster::new(2).await);
    let coll = c.create("docs", 1, 1).await;
    c.await_settled(&coll, ClusterHealth::Green).await;
    let before = make_docs("before", 20);
    c.write_all(&coll, &before).await;
    let third = c.add_node().await;

    c.transport().set_snapshot_delay(Duration::from_millis(150));
    let writer = tokio::spawn(write_stream(c.clone(), coll.clone(), "during", 40));
    let from = c.primary(&coll, ShardId(0)).node.unwrap();
    let target = c
        .coordinator()
        .relocate(&coll, ShardId(0), from, c.node_id(third))
        .await
        .unwrap();
    writer.await.unwrap();
    c.transport().set_snapshot_delay(Duration::ZERO);

    c.await_settled(&coll, ClusterHealth::Green).await;
    assert_eq!(c.primary(&coll, ShardId(0)).id, target);
    c.coordinator().refresh(&coll).await.unwrap();

    let mut all = before;
    all.extend(make_docs("during", 40));
    assert_on_every_copy(&c, &coll, &all).await;
    c.assert_one_primary_per_shard(&coll);
    c.assert_reads(&coll, &all, 1).await;
}
