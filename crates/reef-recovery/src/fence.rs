//! Per-shard write fence.
//!
//! Every write holds a shared guard on its shard while it is applied and
//! replicated. A recovery session takes the exclusive side while it
//! registers its replay log, so each write either finished before the
//! source snapshot or sees the log. A relocation that has just stopped its
//! source from serving takes it once more to wait out running writes.

use std::sync::Arc;

use reef_types::ShardId;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Shared/exclusive gate per shard.
#[derive(Debug)]
pub struct WriteFence {
    shards: Vec<Arc<RwLock<()>>>,
}

impl WriteFence {
    /// One gate per shard.
    pub fn new(shards: u32) -> Arc<Self> {
        Arc::new(Self {
            shards: (0..shards).map(|_| Arc::new(RwLock::new(()))).collect(),
        })
    }

    /// Enter the fence for a write. `None` for an unknown shard.
    pub async fn enter(&self, shard: ShardId) -> Option<OwnedRwLockReadGuard<()>> {
        let lock = self.shards.get(shard.index())?.clone();
        Some(lock.read_owned().await)
    }

    /// Keep writes out of the shard until the guard is dropped.
    pub async fn block(&self, shard: ShardId) -> Option<OwnedRwLockWriteGuard<()>> {
        let lock = self.shards.get(shard.index())?.clone();
        Some(lock.write_owned().await)
    }

    /// Wait until no write is inside the fence.
    pub async fn drain(&self, shard: ShardId) {
        drop(self.block(shard).await);
    }
}
