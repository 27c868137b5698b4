//! Document storage for the shard copies a node holds.
//!
//! This crate defines the [`DocumentStore`] trait the recovery and write
//! paths talk to, along with [`MemoryDocumentStore`], an in-memory backend
//! with refresh semantics: applied writes only become readable after the
//! shard is refreshed or flushed.

mod error;
mod memory_store;
mod traits;

pub use error::StoreError;
pub use memory_store::MemoryDocumentStore;
pub use traits::{Document, DocumentStore, ShardKey, ShardSnapshot, WriteOp};
