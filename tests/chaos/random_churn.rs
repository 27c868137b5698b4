//! Chaos test: seeded node churn.
//!
//! Nodes join and die in a random (but reproducible) order while documents
//! keep being written. One node changes at a time and the collection is
//! allowed to settle in between, so with one replica no shard ever loses
//! every copy. After each step every acknowledged document must be readable.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use reef_engine::ClusterHealth;
use reef_integration_tests::{TestCluster, doc_source};

const STEPS: usize = 12;
const MIN_LIVE: usize = 2;
const MAX_LIVE: usize = 5;

async fn churn(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let c = TestCluster::new(3).await;
    let coll = c.create("docs", 4, 1).await;
    c.await_settled(&coll, ClusterHealth::Green).await;

    let mut docs = Vec::new();
    for step in 0..STEPS {
        let batch: Vec<(String, String)> = (0..5)
            .map(|i| {
                let n = step * 5 + i;
                (format!("doc-{n}"), doc_source(n))
            })
            .collect();
        c.write_all(&coll, &batch).await;
        docs.extend(batch);

        let live: Vec<_> = c.live_nodes().into_iter().collect();
        let grow = live.len() <= MIN_LIVE || (live.len() < MAX_LIVE && rng.random_bool(0.5));
        if grow {
            let idx = c.add_node().await;
            tracing::info!(step, node = idx, "chaos: node added");
        } else {
            let victim = live[rng.random_range(0..live.len())];
            let idx = c.index_of(&victim).unwrap();
            c.kill_node(idx).await;
            tracing::info!(step, node = idx, "chaos: node killed");
        }

        let report = c.await_settled(&coll, ClusterHealth::Green).await;
        assert_eq!(report.lost_shards, 0, "step {step}");
        c.assert_one_primary_per_shard(&coll);
        c.coordinator().refresh(&coll).await.unwrap();
        c.assert_reads(&coll, &docs, 1).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(120000)]
async fn test_random_churn_no_data_loss() {
    churn(7).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(120000)]
async fn test_random_churn_other_seed() {
    churn(1234).await;
}
