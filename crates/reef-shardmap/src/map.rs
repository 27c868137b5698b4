//! Shard map storage and the transition rules it enforces.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use reef_types::{
    CollectionId, CollectionSettings, CopyId, CopyRole, CopyState, NodeId, ShardCopy, ShardId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::MapError;

/// A mutation applied atomically to one shard's copy set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Compare-and-swap on a copy's state.
    ///
    /// Moving to `Unassigned` clears the node and the version.
    /// `Unassigned -> Initializing` needs a node and goes through
    /// [`Transition::Assign`].
    State {
        /// Copy to change.
        copy: CopyId,
        /// State the caller last observed.
        from: CopyState,
        /// Requested state.
        to: CopyState,
    },
    /// Place an unassigned copy on a node (`Unassigned -> Initializing`).
    Assign {
        /// Copy to place.
        copy: CopyId,
        /// Destination node.
        node: NodeId,
    },
    /// Register a new INITIALIZING copy that will replace a STARTED one.
    Relocate {
        /// Copy being moved.
        source: CopyId,
        /// Destination node.
        node: NodeId,
    },
    /// Turn a STARTED replica into the primary.
    Promote {
        /// Replica to promote.
        copy: CopyId,
    },
    /// Finish a relocation: the target takes the source's role and starts,
    /// the source record disappears.
    Handoff {
        /// The RELOCATING copy.
        source: CopyId,
        /// The RECOVERING relocation target.
        target: CopyId,
    },
    /// Delete a copy record (cancelled relocation target, surplus replica).
    Remove {
        /// Copy to delete.
        copy: CopyId,
    },
    /// Open a new unassigned replica slot.
    AddReplica,
    /// Record the highest write sequence a copy has applied.
    RecordVersion {
        /// Copy to update.
        copy: CopyId,
        /// New version; must not be lower than the current one.
        version: u64,
    },
}

/// One shard's copy set at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    shard: ShardId,
    copies: BTreeMap<u32, ShardCopy>,
    next_slot: u32,
    primary_started: bool,
    lost: bool,
}

impl ShardEntry {
    fn new(shard: ShardId, replicas: u32) -> Self {
        let mut copies = BTreeMap::new();
        copies.insert(0, ShardCopy::unassigned(CopyId::new(shard, 0), CopyRole::Primary));
        for slot in 1..=replicas {
            copies.insert(
                slot,
                ShardCopy::unassigned(CopyId::new(shard, slot), CopyRole::Replica),
            );
        }
        Self {
            shard,
            copies,
            next_slot: replicas + 1,
            primary_started: false,
            lost: false,
        }
    }

    /// The shard this entry describes.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// All copy records, in slot order.
    pub fn copies(&self) -> impl Iterator<Item = &ShardCopy> {
        self.copies.values()
    }

    /// Look up a copy by id.
    pub fn copy(&self, id: CopyId) -> Option<&ShardCopy> {
        if id.shard != self.shard {
            return None;
        }
        self.copies.get(&id.slot)
    }

    /// The copy holding the primary role (relocation targets excluded).
    pub fn primary(&self) -> Option<&ShardCopy> {
        self.copies
            .values()
            .find(|c| c.role == CopyRole::Primary && !c.is_relocation_target())
    }

    /// The STARTED primary, if any.
    pub fn active_primary(&self) -> Option<&ShardCopy> {
        self.copies.values().find(|c| c.is_active_primary())
    }

    /// Copies that may serve reads and writes.
    pub fn started(&self) -> impl Iterator<Item = &ShardCopy> {
        self.copies.values().filter(|c| c.state.is_serving())
    }

    /// Number of STARTED replicas.
    pub fn started_replicas(&self) -> usize {
        self.started().filter(|c| c.role == CopyRole::Replica).count()
    }

    /// Copies owned by a recovery session.
    pub fn in_flight(&self) -> impl Iterator<Item = &ShardCopy> {
        self.copies.values().filter(|c| c.state.is_in_flight())
    }

    /// The copy (if any) placed on `node`.
    pub fn copy_on(&self, node: &NodeId) -> Option<&ShardCopy> {
        self.copies.values().find(|c| c.node.as_ref() == Some(node))
    }

    /// Whether any copy of this shard lives on `node`.
    pub fn hosts(&self, node: &NodeId) -> bool {
        self.copy_on(node).is_some()
    }

    /// The relocation target replacing `source`, if one exists.
    pub fn relocation_target_of(&self, source: CopyId) -> Option<&ShardCopy> {
        self.copies
            .values()
            .find(|c| c.relocation_source == Some(source))
    }

    /// Whether this shard has ever had a STARTED primary.
    pub fn primary_ever_started(&self) -> bool {
        self.primary_started
    }

    /// Slot number the next new copy of this shard will receive.
    pub fn next_slot(&self) -> u32 {
        self.next_slot
    }

    /// Whether every data-holding copy of this shard has been lost.
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    fn copy_mut(&mut self, id: CopyId) -> Result<&mut ShardCopy, MapError> {
        if id.shard != self.shard {
            return Err(MapError::CopyNotFound(id));
        }
        self.copies.get_mut(&id.slot).ok_or(MapError::CopyNotFound(id))
    }

    fn get(&self, id: CopyId) -> Result<&ShardCopy, MapError> {
        self.copy(id).ok_or(MapError::CopyNotFound(id))
    }

    fn ensure_node_free(&self, node: &NodeId, except: Option<CopyId>) -> Result<(), MapError> {
        let occupied = self
            .copies
            .values()
            .any(|c| Some(c.id) != except && c.node.as_ref() == Some(node));
        if occupied {
            return Err(MapError::NodeOccupied {
                shard: self.shard,
                node: *node,
            });
        }
        Ok(())
    }

    fn expect_state(copy: &ShardCopy, expected: CopyState) -> Result<(), MapError> {
        if copy.state != expected {
            return Err(MapError::Conflict {
                copy: copy.id,
                expected,
                actual: copy.state,
            });
        }
        Ok(())
    }

    fn new_slot(&mut self) -> CopyId {
        let id = CopyId::new(self.shard, self.next_slot);
        self.next_slot += 1;
        id
    }

    fn apply(&mut self, transition: Transition, replicas: u32) -> Result<ShardCopy, MapError> {
        match transition {
            Transition::State { copy, from, to } => {
                let current = self.get(copy)?;
                Self::expect_state(current, from)?;
                let illegal = MapError::IllegalTransition { copy, from, to };
                if !from.can_transition_to(to) || to == CopyState::Initializing {
                    return Err(illegal);
                }
                if to == CopyState::Started {
                    if current.is_relocation_target() {
                        return Err(illegal);
                    }
                    match current.role {
                        CopyRole::Primary => {
                            if self.active_primary().is_some_and(|p| p.id != copy) {
                                return Err(MapError::DualPrimary(self.shard));
                            }
                            self.primary_started = true;
                        }
                        CopyRole::Replica => {
                            if self.started_replicas() >= replicas as usize {
                                return Err(MapError::ReplicaLimit {
                                    shard: self.shard,
                                    limit: replicas,
                                });
                            }
                        }
                    }
                }
                let c = self.copy_mut(copy)?;
                c.state = to;
                if to == CopyState::Unassigned {
                    c.node = None;
                    c.version = 0;
                }
                Ok(c.clone())
            }
            Transition::Assign { copy, node } => {
                Self::expect_state(self.get(copy)?, CopyState::Unassigned)?;
                self.ensure_node_free(&node, Some(copy))?;
                let c = self.copy_mut(copy)?;
                c.state = CopyState::Initializing;
                c.node = Some(node);
                Ok(c.clone())
            }
            Transition::Relocate { source, node } => {
                let src = self.get(source)?;
                Self::expect_state(src, CopyState::Started)?;
                let role = src.role;
                let version = src.version;
                if self.relocation_target_of(source).is_some() {
                    return Err(MapError::AlreadyRelocating(source));
                }
                self.ensure_node_free(&node, None)?;
                let id = self.new_slot();
                let target = ShardCopy {
                    id,
                    role,
                    node: Some(node),
                    state: CopyState::Initializing,
                    version,
                    relocation_source: Some(source),
                };
                self.copies.insert(id.slot, target.clone());
                Ok(target)
            }
            Transition::Promote { copy } => {
                let c = self.get(copy)?;
                Self::expect_state(c, CopyState::Started)?;
                if c.role != CopyRole::Replica || c.is_relocation_target() {
                    return Err(MapError::WrongRole(copy));
                }
                let primary_serving = self
                    .copies
                    .values()
                    .any(|p| p.role == CopyRole::Primary && p.state.holds_data());
                if primary_serving {
                    return Err(MapError::DualPrimary(self.shard));
                }
                for other in self.copies.values_mut() {
                    if other.role == CopyRole::Primary {
                        other.role = CopyRole::Replica;
                    }
                }
                let c = self.copy_mut(copy)?;
                c.role = CopyRole::Primary;
                self.primary_started = true;
                self.get(copy).cloned()
            }
            Transition::Handoff { source, target } => {
                let src = self.get(source)?;
                Self::expect_state(src, CopyState::Relocating)?;
                let (role, src_version) = (src.role, src.version);
                let tgt = self.get(target)?;
                Self::expect_state(tgt, CopyState::Recovering)?;
                if tgt.relocation_source != Some(source) {
                    return Err(MapError::WrongRole(target));
                }
                self.copies.remove(&source.slot);
                let c = self.copy_mut(target)?;
                c.state = CopyState::Started;
                c.role = role;
                c.relocation_source = None;
                c.version = c.version.max(src_version);
                if role == CopyRole::Primary {
                    self.primary_started = true;
                }
                self.get(target).cloned()
            }
            Transition::Remove { copy } => {
                if self.get(copy)?.is_active_primary() {
                    return Err(MapError::WrongRole(copy));
                }
                self.copies
                    .remove(&copy.slot)
                    .ok_or(MapError::CopyNotFound(copy))
            }
            Transition::AddReplica => {
                let id = self.new_slot();
                let copy = ShardCopy::unassigned(id, CopyRole::Replica);
                self.copies.insert(id.slot, copy.clone());
                Ok(copy)
            }
            Transition::RecordVersion { copy, version } => {
                let c = self.copy_mut(copy)?;
                if version < c.version {
                    return Err(MapError::VersionRegression {
                        copy,
                        current: c.version,
                        proposed: version,
                    });
                }
                c.version = version;
                Ok(c.clone())
            }
        }
    }
}

/// A consistent-per-shard view of a whole collection.
#[derive(Debug, Clone)]
pub struct ShardMapSnapshot {
    /// Collection the snapshot belongs to.
    pub collection: CollectionId,
    /// Shard count and replica count at snapshot time.
    pub settings: CollectionSettings,
    /// One entry per shard, indexed by shard number.
    pub shards: Vec<Arc<ShardEntry>>,
}

impl ShardMapSnapshot {
    /// Look up one shard.
    pub fn shard(&self, shard: ShardId) -> Option<&ShardEntry> {
        self.shards.get(shard.index()).map(|e| e.as_ref())
    }

    /// Every copy of every shard.
    pub fn copies(&self) -> impl Iterator<Item = &ShardCopy> {
        self.shards.iter().flat_map(|e| e.copies())
    }

    /// Copies assigned to (or recovering onto) `node`.
    pub fn node_load(&self, node: &NodeId) -> usize {
        self.copies()
            .filter(|c| c.node.as_ref() == Some(node))
            .count()
    }

    /// Number of copies currently owned by a recovery session.
    pub fn in_flight_count(&self) -> usize {
        self.copies().filter(|c| c.state.is_in_flight()).count()
    }
}

/// The authoritative shard map of one collection.
pub struct ShardMap {
    collection: CollectionId,
    shard_count: u32,
    replicas: AtomicU32,
    shards: Vec<RwLock<Arc<ShardEntry>>>,
    /// Bumped after every applied mutation.
    changes: watch::Sender<u64>,
}

impl ShardMap {
    /// Create a map with every copy unassigned.
    pub fn new(collection: CollectionId, settings: CollectionSettings) -> Arc<Self> {
        let shards = (0..settings.shards)
            .map(|i| RwLock::new(Arc::new(ShardEntry::new(ShardId(i), settings.replicas))))
            .collect();
        let (changes, _) = watch::channel(0);
        Arc::new(Self {
            collection,
            shard_count: settings.shards,
            replicas: AtomicU32::new(settings.replicas),
            shards,
            changes,
        })
    }

    /// The collection this map describes.
    pub fn collection(&self) -> &CollectionId {
        &self.collection
    }

    /// Current shard and replica counts.
    pub fn settings(&self) -> CollectionSettings {
        CollectionSettings {
            shards: self.shard_count,
            replicas: self.replicas.load(Ordering::Acquire),
        }
    }

    /// Change the configured replica count.
    ///
    /// Copy records are not touched; the planner adds or drops slots on its
    /// next pass.
    pub fn set_replicas(&self, replicas: u32) {
        self.replicas.store(replicas, Ordering::Release);
        self.changes.send_modify(|g| *g += 1);
    }

    /// The copy set of one shard.
    pub fn current_assignment(&self, shard: ShardId) -> Result<Arc<ShardEntry>, MapError> {
        let slot = self
            .shards
            .get(shard.index())
            .ok_or(MapError::ShardNotFound(shard))?;
        Ok(slot.read().expect("shard map lock poisoned").clone())
    }

    /// A snapshot of every shard.
    pub fn snapshot(&self) -> ShardMapSnapshot {
        ShardMapSnapshot {
            collection: self.collection.clone(),
            settings: self.settings(),
            shards: self
                .shards
                .iter()
                .map(|s| s.read().expect("shard map lock poisoned").clone())
                .collect(),
        }
    }

    /// Receive a notification after every applied mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Compare-and-swap a copy's state.
    pub fn apply_transition(
        &self,
        copy: CopyId,
        from: CopyState,
        to: CopyState,
    ) -> Result<ShardCopy, MapError> {
        self.apply(copy.shard, Transition::State { copy, from, to })
    }

    /// Apply a transition to one shard; returns the affected copy.
    pub fn apply(&self, shard: ShardId, transition: Transition) -> Result<ShardCopy, MapError> {
        let slot = self
            .shards
            .get(shard.index())
            .ok_or(MapError::ShardNotFound(shard))?;
        let replicas = self.replicas.load(Ordering::Acquire);

        let copy = {
            let mut guard = slot.write().expect("shard map lock poisoned");
            let mut entry = ShardEntry::clone(&guard);
            let copy = entry.apply(transition.clone(), replicas)?;
            *guard = Arc::new(entry);
            copy
        };

        debug!(
            collection = %self.collection,
            copy = %copy.id,
            state = %copy.state,
            role = %copy.role,
            ?transition,
            "shard map transition applied"
        );
        self.changes.send_modify(|g| *g += 1);
        Ok(copy)
    }

    /// Flag or clear total data loss for a shard.
    pub fn set_lost(&self, shard: ShardId, lost: bool) -> Result<(), MapError> {
        let slot = self
            .shards
            .get(shard.index())
            .ok_or(MapError::ShardNotFound(shard))?;
        {
            let mut guard = slot.write().expect("shard map lock poisoned");
            if guard.lost == lost {
                return Ok(());
            }
            let mut entry = ShardEntry::clone(&guard);
            entry.lost = lost;
            if !lost {
                entry.primary_started = false;
            }
            *guard = Arc::new(entry);
        }
        self.changes.send_modify(|g| *g += 1);
        Ok(())
    }
}

impl std::fmt::Debug for ShardMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardMap")
            .field("collection", &self.collection)
            .field("settings", &self.settings())
            .finish_non_exhaustive()
    }
}
