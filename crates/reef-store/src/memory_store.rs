//! In-memory document storage backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use tracing::debug;

use crate::error::StoreError;
use crate::traits::{Document, DocumentStore, ShardKey, ShardSnapshot, WriteOp};

/// One shard's documents on this node.
#[derive(Debug, Default)]
struct ShardData {
    /// Every applied write, latest body per id.
    applied: BTreeMap<String, Document>,
    /// What reads see: `applied` as of the last refresh.
    visible: BTreeMap<String, Document>,
    max_seq: u64,
    committed_seq: u64,
}

impl ShardData {
    fn apply(&mut self, doc: Document) -> bool {
        if self.applied.get(&doc.id).is_some_and(|d| d.seq >= doc.seq) {
            return false;
        }
        self.max_seq = self.max_seq.max(doc.seq);
        self.applied.insert(doc.id.clone(), doc);
        true
    }

    fn refresh(&mut self) {
        self.visible = self.applied.clone();
    }
}

/// In-memory document store backed by a `RwLock<HashMap>`.
///
/// Used by every node in tests and by the local transport.
#[derive(Default)]
pub struct MemoryDocumentStore {
    shards: RwLock<HashMap<ShardKey, ShardData>>,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence number covered by the last flush.
    pub fn committed_version(&self, key: &ShardKey) -> Option<u64> {
        let map = self.shards.read().expect("lock poisoned");
        map.get(key).map(|s| s.committed_seq)
    }

    /// Number of applied (not necessarily visible) documents in a shard.
    pub fn applied_count(&self, key: &ShardKey) -> usize {
        let map = self.shards.read().expect("lock poisoned");
        map.get(key).map_or(0, |s| s.applied.len())
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn open(&self, key: &ShardKey) -> Result<(), StoreError> {
        let mut map = self.shards.write().expect("lock poisoned");
        map.entry(key.clone()).or_default();
        Ok(())
    }

    async fn apply(&self, key: &ShardKey, op: &WriteOp) -> Result<bool, StoreError> {
        let mut map = self.shards.write().expect("lock poisoned");
        let shard = map
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Ok(shard.apply(op.to_document()))
    }

    async fn get(&self, key: &ShardKey, id: &str) -> Result<Option<Document>, StoreError> {
        let map = self.shards.read().expect("lock poisoned");
        let shard = map
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Ok(shard.visible.get(id).cloned())
    }

    async fn refresh(&self, key: &ShardKey) -> Result<(), StoreError> {
        let mut map = self.shards.write().expect("lock poisoned");
        let shard = map
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        shard.refresh();
        Ok(())
    }

    async fn flush(&self, key: &ShardKey) -> Result<(), StoreError> {
        let mut map = self.shards.write().expect("lock poisoned");
        let shard = map
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        shard.refresh();
        shard.committed_seq = shard.max_seq;
        debug!(%key, seq = shard.committed_seq, "flushed shard");
        Ok(())
    }

    async fn snapshot(&self, key: &ShardKey, since: u64) -> Result<ShardSnapshot, StoreError> {
        let map = self.shards.read().expect("lock poisoned");
        let shard = map
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Ok(ShardSnapshot {
            documents: shard
                .applied
                .values()
                .filter(|d| d.seq > since)
                .cloned()
                .collect(),
            max_seq: shard.max_seq,
        })
    }

    async fn restore(&self, key: &ShardKey, snapshot: ShardSnapshot) -> Result<(), StoreError> {
        let mut map = self.shards.write().expect("lock poisoned");
        let shard = map.entry(key.clone()).or_default();
        let count = snapshot.documents.len();
        for doc in snapshot.documents {
            shard.apply(doc);
        }
        shard.max_seq = shard.max_seq.max(snapshot.max_seq);
        shard.refresh();
        debug!(%key, documents = count, max_seq = shard.max_seq, "restored snapshot");
        Ok(())
    }

    async fn version(&self, key: &ShardKey) -> Result<u64, StoreError> {
        let map = self.shards.read().expect("lock poisoned");
        map.get(key)
            .map(|s| s.max_seq)
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn contains(&self, key: &ShardKey) -> Result<bool, StoreError> {
        let map = self.shards.read().expect("lock poisoned");
        Ok(map.contains_key(key))
    }

    async fn drop_shard(&self, key: &ShardKey) -> Result<(), StoreError> {
        let mut map = self.shards.write().expect("lock poisoned");
        if map.remove(key).is_some() {
            debug!(%key, "dropped shard");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ShardKey>, StoreError> {
        let map = self.shards.read().expect("lock poisoned");
        Ok(map.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use reef_types::{CollectionId, ShardId};

    use super::*;

    fn key() -> ShardKey {
        ShardKey::new(CollectionId::new("test"), ShardId(0))
    }

    fn op(seq: u64, id: &str, body: &str) -> WriteOp {
        WriteOp {
            seq,
            id: id.to_string(),
            source: Bytes::from(body.to_string()),
        }
    }

    #[tokio::test]
    async fn test_writes_invisible_until_refresh() {
        let store = MemoryDocumentStore::new();
        store.open(&key()).await.unwrap();
        store.apply(&key(), &op(1, "a", "one")).await.unwrap();

        assert_eq!(store.get(&key(), "a").await.unwrap(), None);
        store.refresh(&key()).await.unwrap();
        let doc = store.get(&key(), "a").await.unwrap().unwrap();
        assert_eq!(doc.source, Bytes::from("one"));
        assert_eq!(doc.seq, 1);
    }

    #[tokio::test]
    async fn test_unrefreshed_update_returns_prior_version() {
        let store = MemoryDocumentStore::new();
        store.open(&key()).await.unwrap();
        store.apply(&key(), &op(1, "a", "v1")).await.unwrap();
        store.refresh(&key()).await.unwrap();
        store.apply(&key(), &op(2, "a", "v2")).await.unwrap();

        let doc = store.get(&key(), "a").await.unwrap().unwrap();
        assert_eq!(doc.source, Bytes::from("v1"));
    }

    #[tokio::test]
    async fn test_stale_apply_is_ignored() {
        let store = MemoryDocumentStore::new();
        store.open(&key()).await.unwrap();
        assert!(store.apply(&key(), &op(5, "a", "new")).await.unwrap());
        assert!(!store.apply(&key(), &op(3, "a", "old")).await.unwrap());
        assert!(!store.apply(&key(), &op(5, "a", "new")).await.unwrap());

        store.refresh(&key()).await.unwrap();
        let doc = store.get(&key(), "a").await.unwrap().unwrap();
        assert_eq!(doc.source, Bytes::from("new"));
        assert_eq!(store.version(&key()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_flush_commits_and_refreshes() {
        let store = MemoryDocumentStore::new();
        store.open(&key()).await.unwrap();
        store.apply(&key(), &op(1, "a", "one")).await.unwrap();
        store.flush(&key()).await.unwrap();

        assert_eq!(store.committed_version(&key()), Some(1));
        assert!(store.get(&key(), "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_snapshot_since_and_restore_merge() {
        let source = MemoryDocumentStore::new();
        source.open(&key()).await.unwrap();
        for (seq, id) in [(1, "a"), (2, "b"), (3, "c")] {
            source.apply(&key(), &op(seq, id, id)).await.unwrap();
        }

        let full = source.snapshot(&key(), 0).await.unwrap();
        assert_eq!(full.documents.len(), 3);
        assert_eq!(full.max_seq, 3);
        let delta = source.snapshot(&key(), 2).await.unwrap();
        assert_eq!(delta.documents.len(), 1);

        let target = MemoryDocumentStore::new();
        // A newer replayed write survives an older snapshot body.
        target.open(&key()).await.unwrap();
        target.apply(&key(), &op(4, "a", "replayed")).await.unwrap();
        target.restore(&key(), full).await.unwrap();

        assert_eq!(target.version(&key()).await.unwrap(), 4);
        let a = target.get(&key(), "a").await.unwrap().unwrap();
        assert_eq!(a.source, Bytes::from("replayed"));
        assert!(target.get(&key(), "c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_shard_errors() {
        let store = MemoryDocumentStore::new();
        assert_eq!(
            store.get(&key(), "a").await.unwrap_err(),
            StoreError::NotFound(key())
        );
        assert!(!store.contains(&key()).await.unwrap());
        assert!(store.apply(&key(), &op(1, "a", "x")).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_and_list() {
        let store = MemoryDocumentStore::new();
        let other = ShardKey::new(CollectionId::new("test"), ShardId(1));
        store.open(&key()).await.unwrap();
        store.open(&other).await.unwrap();

        let mut listed = store.list().await.unwrap();
        listed.sort();
        assert_eq!(listed, vec![key(), other.clone()]);

        store.drop_shard(&key()).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![other]);
        // Dropping twice is fine.
        store.drop_shard(&key()).await.unwrap();
    }
}
