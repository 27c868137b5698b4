//! Shared types and identifiers for Reef.
//!
//! This crate defines the vocabulary used across the Reef workspace:
//! identifiers ([`NodeId`], [`ShardId`], [`CopyId`], [`CollectionId`]),
//! the copy model ([`ShardCopy`], [`CopyRole`], [`CopyState`]), collection
//! settings, tuning sections ([`config`]) and the typed event bus
//! ([`events`]).

pub mod config;
pub mod events;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use config::{AllocationConfig, RecoveryConfig};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Identifier for a cluster node.
///
/// Ordering is bytewise; the allocation planner breaks ties on the lowest
/// node id, so placement is reproducible across runs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Create an ID by hashing arbitrary data with BLAKE3.
    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex prefix, handy in log lines.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

/// Index of a shard within a collection (`0..shard_count`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl ShardId {
    /// Return the shard a document id routes to.
    ///
    /// Uses the first four bytes of `blake3(doc_id)` so every node agrees on
    /// the mapping without coordination.
    pub fn for_document(doc_id: &str, shard_count: u32) -> Self {
        let hash = blake3::hash(doc_id.as_bytes());
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&hash.as_bytes()[..4]);
        Self(u32::from_le_bytes(prefix) % shard_count.max(1))
    }

    /// Position of this shard in a per-collection vector.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of one copy of a shard.
///
/// Slots are handed out per shard from a counter and never reused, so a
/// copy keeps its id through promotion and demotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CopyId {
    /// The shard this copy belongs to.
    pub shard: ShardId,
    /// Slot number within the shard.
    pub slot: u32,
}

impl CopyId {
    /// Build a copy id.
    pub fn new(shard: ShardId, slot: u32) -> Self {
        Self { shard, slot }
    }
}

impl fmt::Display for CopyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.shard, self.slot)
    }
}

/// Name of a collection (an index in document-store terms).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CollectionId(String);

impl CollectionId {
    /// Create a collection id from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Return the collection name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CollectionId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Copy model
// ---------------------------------------------------------------------------

/// Whether a copy accepts writes first or follows the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyRole {
    /// Accepts writes first and assigns versions.
    Primary,
    /// Follows the primary for durability and read scaling.
    Replica,
}

impl fmt::Display for CopyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Replica => f.write_str("replica"),
        }
    }
}

/// Lifecycle state of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyState {
    /// No node holds this copy.
    Unassigned,
    /// Registered on its target node, no data yet.
    Initializing,
    /// Receiving data from its source.
    Recovering,
    /// Serving reads and writes.
    Started,
    /// Handing its role over to a relocation target; not serving.
    Relocating,
}

impl CopyState {
    /// Transition table for copy states.
    pub fn can_transition_to(self, to: CopyState) -> bool {
        use CopyState::*;
        matches!(
            (self, to),
            (Unassigned, Initializing)
                | (Initializing, Recovering)
                | (Initializing, Unassigned)
                | (Recovering, Started)
                | (Recovering, Unassigned)
                | (Started, Relocating)
                | (Relocating, Started)
                | (Started, Unassigned)
                | (Relocating, Unassigned)
        )
    }

    /// Legal read/write target.
    pub fn is_serving(self) -> bool {
        self == CopyState::Started
    }

    /// A recovery session owns this copy.
    pub fn is_in_flight(self) -> bool {
        matches!(self, CopyState::Initializing | CopyState::Recovering)
    }

    /// The copy holds a complete set of the shard's data.
    pub fn holds_data(self) -> bool {
        matches!(self, CopyState::Started | CopyState::Relocating)
    }
}

impl fmt::Display for CopyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unassigned => "UNASSIGNED",
            Self::Initializing => "INITIALIZING",
            Self::Recovering => "RECOVERING",
            Self::Started => "STARTED",
            Self::Relocating => "RELOCATING",
        };
        f.write_str(s)
    }
}

/// One instance of a shard's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCopy {
    /// Stable identity.
    pub id: CopyId,
    /// Primary or replica.
    pub role: CopyRole,
    /// Owning node, `None` while unassigned.
    pub node: Option<NodeId>,
    /// Lifecycle state.
    pub state: CopyState,
    /// Highest write sequence applied to this copy.
    pub version: u64,
    /// For relocation targets: the copy being replaced.
    pub relocation_source: Option<CopyId>,
}

impl ShardCopy {
    /// A fresh unassigned copy.
    pub fn unassigned(id: CopyId, role: CopyRole) -> Self {
        Self {
            id,
            role,
            node: None,
            state: CopyState::Unassigned,
            version: 0,
            relocation_source: None,
        }
    }

    /// Return the shard this copy belongs to.
    pub fn shard(&self) -> ShardId {
        self.id.shard
    }

    /// Is this a STARTED primary?
    pub fn is_active_primary(&self) -> bool {
        self.role == CopyRole::Primary && self.state == CopyState::Started
    }

    /// Is this copy the target of an in-progress relocation?
    pub fn is_relocation_target(&self) -> bool {
        self.relocation_source.is_some()
    }
}

/// Shard layout of a collection, fixed at creation except for replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSettings {
    /// Number of shards; immutable.
    pub shards: u32,
    /// Replicas per shard; may change at runtime.
    pub replicas: u32,
}

impl CollectionSettings {
    /// Copies per shard (primary plus replicas).
    pub fn copies_per_shard(&self) -> u32 {
        1 + self.replicas
    }

    /// Total number of copies across all shards.
    pub fn total_copies(&self) -> u32 {
        self.shards * self.copies_per_shard()
    }
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            shards: 1,
            replicas: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
