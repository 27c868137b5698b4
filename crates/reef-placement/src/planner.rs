//! The allocation planner.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use reef_shardmap::ShardMapSnapshot;
use reef_types::{AllocationConfig, CopyId, CopyRole, CopyState, NodeId, ShardCopy, ShardId};
use tracing::debug;

use crate::error::PlacementError;

/// One step of an allocation plan.
///
/// Decisions are listed in the order they must be applied. Ids of copies
/// created by the plan itself ([`Decision::AddReplica`],
/// [`Decision::Relocate`]) are predicted from the shard's slot counter, so a
/// later decision in the same plan may refer to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// A data-holding copy's node left: release the slot.
    Unassign {
        /// The released copy.
        copy: CopyId,
        /// Node that left.
        node: NodeId,
        /// State the copy was in.
        from: CopyState,
    },
    /// Abort the recovery session that owns an in-flight copy.
    ///
    /// Relocation targets are removed, other copies go back to UNASSIGNED.
    Cancel {
        /// The in-flight copy.
        copy: CopyId,
        /// Node the copy was recovering onto.
        node: NodeId,
        /// State the copy was in.
        state: CopyState,
        /// Delete the record instead of unassigning it.
        remove: bool,
    },
    /// A RELOCATING source lost its target: it serves again.
    RevertRelocation {
        /// The source copy.
        copy: CopyId,
    },
    /// Make a STARTED replica the primary.
    Promote {
        /// The replica to promote.
        copy: CopyId,
        /// Node hosting it.
        node: NodeId,
    },
    /// Every copy holding data is gone.
    MarkLost {
        /// The shard.
        shard: ShardId,
    },
    /// Open a replica slot to reach the configured replica count.
    AddReplica {
        /// Id the new slot will receive.
        copy: CopyId,
    },
    /// Delete a surplus replica.
    Drop {
        /// The replica.
        copy: CopyId,
        /// Node holding it, if assigned.
        node: Option<NodeId>,
        /// State it was in.
        state: CopyState,
    },
    /// Place an unassigned copy and start recovering it.
    Assign {
        /// The copy.
        copy: CopyId,
        /// Destination node.
        node: NodeId,
        /// Copy to recover from; `None` builds the primary from the durable
        /// log of a shard that never started.
        source: Option<CopyId>,
    },
    /// Move a STARTED copy to a less loaded node.
    Relocate {
        /// The copy being moved.
        source: CopyId,
        /// Id of the relocation target the move creates.
        target: CopyId,
        /// Destination node.
        node: NodeId,
    },
}

impl Decision {
    /// The shard this decision touches.
    pub fn shard(&self) -> ShardId {
        match self {
            Self::Unassign { copy, .. }
            | Self::Cancel { copy, .. }
            | Self::RevertRelocation { copy }
            | Self::Promote { copy, .. }
            | Self::AddReplica { copy }
            | Self::Drop { copy, .. }
            | Self::Assign { copy, .. } => copy.shard,
            Self::Relocate { source, .. } => source.shard,
            Self::MarkLost { shard } => *shard,
        }
    }

    /// Whether applying this decision starts a recovery session.
    pub fn starts_recovery(&self) -> bool {
        matches!(self, Self::Assign { .. } | Self::Relocate { .. })
    }
}

/// Ordered decisions produced by one planner pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationPlan {
    /// Decisions in application order.
    pub decisions: Vec<Decision>,
}

impl AllocationPlan {
    /// Nothing to do: the map already satisfies every constraint.
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    /// Number of decisions.
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    /// Iterate over the decisions in order.
    pub fn iter(&self) -> impl Iterator<Item = &Decision> {
        self.decisions.iter()
    }

    /// Number of recovery sessions the plan starts.
    pub fn recoveries(&self) -> usize {
        self.decisions.iter().filter(|d| d.starts_recovery()).count()
    }
}

impl IntoIterator for AllocationPlan {
    type Item = Decision;
    type IntoIter = std::vec::IntoIter<Decision>;

    fn into_iter(self) -> Self::IntoIter {
        self.decisions.into_iter()
    }
}

/// Computes allocation plans.
#[derive(Debug, Clone, Default)]
pub struct AllocationPlanner {
    config: AllocationConfig,
}

impl AllocationPlanner {
    /// Create a planner with the given allocation settings.
    pub fn new(config: AllocationConfig) -> Self {
        Self { config }
    }

    /// The allocation settings in use.
    pub fn config(&self) -> &AllocationConfig {
        &self.config
    }

    /// Compute the decisions that move `snapshot` towards a valid placement
    /// over the `live` nodes.
    ///
    /// Running the planner again on the map that results from applying the
    /// plan (with no recovery having finished in between) yields an empty plan.
    pub fn plan(&self, snapshot: &ShardMapSnapshot, live: &BTreeSet<NodeId>) -> AllocationPlan {
        let mut work = Work::new(snapshot, live);

        work.release_departed();
        work.promote();
        work.reconcile_replicas(snapshot.settings.replicas as usize);
        work.assign_primaries();
        work.assign_replicas();
        if self.config.rebalance_enabled && !work.has_in_flight() {
            work.rebalance(self.config.max_concurrent_rebalance);
        }

        let plan = AllocationPlan {
            decisions: work.decisions,
        };
        if !plan.is_empty() {
            debug!(
                collection = %snapshot.collection,
                decisions = plan.len(),
                recoveries = plan.recoveries(),
                live_nodes = live.len(),
                "allocation plan computed"
            );
        }
        plan
    }

    /// Check an explicit request to move the copy of `shard` on `from` to
    /// `to`; returns the copy to relocate.
    pub fn validate_relocation(
        &self,
        snapshot: &ShardMapSnapshot,
        live: &BTreeSet<NodeId>,
        shard: ShardId,
        from: NodeId,
        to: NodeId,
    ) -> Result<CopyId, PlacementError> {
        let entry = snapshot
            .shard(shard)
            .ok_or(PlacementError::ShardNotFound(shard))?;
        let copy = entry
            .copy_on(&from)
            .ok_or(PlacementError::NoCopyOnNode { shard, node: from })?;
        if copy.state != CopyState::Started || copy.is_relocation_target() {
            return Err(PlacementError::NotStarted(shard));
        }
        if entry.relocation_target_of(copy.id).is_some() {
            return Err(PlacementError::AlreadyRelocating(shard));
        }
        if !live.contains(&to) {
            return Err(PlacementError::NodeNotLive(to));
        }
        if entry.hosts(&to) {
            return Err(PlacementError::NodeOccupied { shard, node: to });
        }
        Ok(copy.id)
    }
}

/// Mutable model of one shard while a plan is being built.
struct WorkShard {
    shard: ShardId,
    copies: BTreeMap<u32, ShardCopy>,
    next_slot: u32,
    primary_started: bool,
    lost: bool,
}

impl WorkShard {
    fn hosts(&self, node: &NodeId) -> bool {
        self.copies.values().any(|c| c.node.as_ref() == Some(node))
    }

    fn active_primary(&self) -> Option<&ShardCopy> {
        self.copies.values().find(|c| c.is_active_primary())
    }

    fn primary_record(&self) -> Option<&ShardCopy> {
        self.copies
            .values()
            .find(|c| c.role == CopyRole::Primary && !c.is_relocation_target())
    }

    fn has_target(&self, source: CopyId) -> bool {
        self.copies
            .values()
            .any(|c| c.relocation_source == Some(source))
    }

    fn unassign(&mut self, id: CopyId) {
        if let Some(c) = self.copies.get_mut(&id.slot) {
            c.state = CopyState::Unassigned;
            c.node = None;
        }
    }

    fn new_slot(&mut self) -> CopyId {
        let id = CopyId::new(self.shard, self.next_slot);
        self.next_slot += 1;
        id
    }
}

/// Working state of one planner pass.
struct Work<'a> {
    live: &'a BTreeSet<NodeId>,
    shards: Vec<WorkShard>,
    decisions: Vec<Decision>,
}

impl<'a> Work<'a> {
    fn new(snapshot: &ShardMapSnapshot, live: &'a BTreeSet<NodeId>) -> Self {
        let shards = snapshot
            .shards
            .iter()
            .map(|entry| WorkShard {
                shard: entry.shard(),
                copies: entry.copies().map(|c| (c.id.slot, c.clone())).collect(),
                next_slot: entry.next_slot(),
                primary_started: entry.primary_ever_started(),
                lost: entry.is_lost(),
            })
            .collect();
        Self {
            live,
            shards,
            decisions: Vec::new(),
        }
    }

    fn is_live(&self, node: &Option<NodeId>) -> bool {
        node.as_ref().is_some_and(|n| self.live.contains(n))
    }

    /// Copies assigned to or recovering onto `node`.
    fn load(&self, node: &NodeId) -> usize {
        self.shards
            .iter()
            .flat_map(|s| s.copies.values())
            .filter(|c| c.node.as_ref() == Some(node))
            .count()
    }

    fn has_in_flight(&self) -> bool {
        self.shards
            .iter()
            .flat_map(|s| s.copies.values())
            .any(|c| c.state.is_in_flight())
    }

    /// Least loaded live node not hosting a copy of shard `idx`.
    fn choose_node(&self, idx: usize) -> Option<NodeId> {
        let shard = &self.shards[idx];
        self.live
            .iter()
            .filter(|n| !shard.hosts(n))
            .min_by_key(|n| (self.load(n), **n))
            .copied()
    }

    fn release_departed(&mut self) {
        for idx in 0..self.shards.len() {
            let departed: Vec<ShardCopy> = self.shards[idx]
                .copies
                .values()
                .filter(|c| c.node.is_some() && !self.is_live(&c.node))
                .cloned()
                .collect();

            let primary_left = departed.iter().any(|c| {
                c.role == CopyRole::Primary && !c.is_relocation_target() && c.state.holds_data()
            });

            let shard = &mut self.shards[idx];
            for c in departed {
                let Some(node) = c.node else { continue };
                if c.state.is_in_flight() {
                    let remove = c.is_relocation_target();
                    self.decisions.push(Decision::Cancel {
                        copy: c.id,
                        node,
                        state: c.state,
                        remove,
                    });
                    if remove {
                        shard.copies.remove(&c.id.slot);
                    } else {
                        shard.unassign(c.id);
                    }
                } else if c.state.holds_data() {
                    self.decisions.push(Decision::Unassign {
                        copy: c.id,
                        node,
                        from: c.state,
                    });
                    shard.unassign(c.id);
                }
            }

            // Relocation targets whose source stopped holding data, and
            // replica recoveries fed by a primary that just left.
            let orphans: Vec<ShardCopy> = shard
                .copies
                .values()
                .filter(|c| c.state.is_in_flight())
                .filter(|c| match c.relocation_source {
                    Some(src) => !shard
                        .copies
                        .get(&src.slot)
                        .is_some_and(|s| s.state.holds_data()),
                    None => primary_left && c.role == CopyRole::Replica,
                })
                .cloned()
                .collect();
            for c in orphans {
                let Some(node) = c.node else { continue };
                let remove = c.is_relocation_target();
                self.decisions.push(Decision::Cancel {
                    copy: c.id,
                    node,
                    state: c.state,
                    remove,
                });
                if remove {
                    shard.copies.remove(&c.id.slot);
                } else {
                    shard.unassign(c.id);
                }
            }

            let stranded: Vec<CopyId> = shard
                .copies
                .values()
                .filter(|c| c.state == CopyState::Relocating && !shard.has_target(c.id))
                .map(|c| c.id)
                .collect();
            for id in stranded {
                self.decisions.push(Decision::RevertRelocation { copy: id });
                if let Some(c) = shard.copies.get_mut(&id.slot) {
                    c.state = CopyState::Started;
                }
            }
        }
    }

    fn promote(&mut self) {
        for shard in &mut self.shards {
            if shard.lost {
                continue;
            }
            let has_primary = shard.copies.values().any(|c| {
                c.role == CopyRole::Primary
                    && !c.is_relocation_target()
                    && (c.state.holds_data() || c.state.is_in_flight())
            });
            if has_primary {
                continue;
            }

            let candidate = shard
                .copies
                .values()
                .filter(|c| {
                    c.role == CopyRole::Replica
                        && c.state == CopyState::Started
                        && !c.is_relocation_target()
                })
                .max_by_key(|c| (c.version, Reverse(c.node)))
                .map(|c| (c.id, c.node));

            match candidate {
                Some((id, Some(node))) => {
                    self.decisions.push(Decision::Promote { copy: id, node });
                    for c in shard.copies.values_mut() {
                        c.role = if c.id == id {
                            CopyRole::Primary
                        } else {
                            CopyRole::Replica
                        };
                    }
                    shard.primary_started = true;
                }
                _ if shard.primary_started
                    && !shard.copies.values().any(|c| c.state.holds_data()) =>
                {
                    self.decisions.push(Decision::MarkLost { shard: shard.shard });
                    shard.lost = true;
                }
                _ => {}
            }
        }
    }

    fn reconcile_replicas(&mut self, desired: usize) {
        for idx in 0..self.shards.len() {
            if self.shards[idx].lost {
                continue;
            }
            let replicas: Vec<ShardCopy> = self.shards[idx]
                .copies
                .values()
                .filter(|c| c.role == CopyRole::Replica && !c.is_relocation_target())
                .cloned()
                .collect();

            if replicas.len() < desired {
                let shard = &mut self.shards[idx];
                for _ in replicas.len()..desired {
                    let id = shard.new_slot();
                    self.decisions.push(Decision::AddReplica { copy: id });
                    shard
                        .copies
                        .insert(id.slot, ShardCopy::unassigned(id, CopyRole::Replica));
                }
                continue;
            }

            // Drop the cheapest copies first: unassigned, then in-flight,
            // then STARTED ones on the busiest nodes.
            let mut surplus: Vec<(u8, Reverse<usize>, Reverse<u32>, ShardCopy)> = replicas
                .into_iter()
                .filter(|c| c.state != CopyState::Relocating && !self.shards[idx].has_target(c.id))
                .map(|c| {
                    let rank = match c.state {
                        CopyState::Unassigned => 0,
                        CopyState::Initializing => 1,
                        CopyState::Recovering => 2,
                        _ => 3,
                    };
                    let load = c.node.as_ref().map(|n| self.load(n)).unwrap_or(0);
                    (rank, Reverse(load), Reverse(c.id.slot), c)
                })
                .collect();
            let excess = self.shards[idx]
                .copies
                .values()
                .filter(|c| c.role == CopyRole::Replica && !c.is_relocation_target())
                .count()
                .saturating_sub(desired);
            surplus.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

            let shard = &mut self.shards[idx];
            for (_, _, _, c) in surplus.into_iter().take(excess) {
                self.decisions.push(Decision::Drop {
                    copy: c.id,
                    node: c.node,
                    state: c.state,
                });
                shard.copies.remove(&c.id.slot);
            }
        }
    }

    fn assign_primaries(&mut self) {
        for idx in 0..self.shards.len() {
            let shard = &self.shards[idx];
            if shard.lost || shard.primary_started {
                continue;
            }
            let Some(primary) = shard.primary_record() else {
                continue;
            };
            if primary.state != CopyState::Unassigned {
                continue;
            }
            let id = primary.id;
            let Some(node) = self.choose_node(idx) else {
                continue;
            };
            self.place(idx, id, node, None);
        }
    }

    fn assign_replicas(&mut self) {
        for idx in 0..self.shards.len() {
            let shard = &self.shards[idx];
            if shard.lost {
                continue;
            }
            let Some(primary) = shard.active_primary().map(|p| p.id) else {
                continue;
            };
            let waiting: Vec<CopyId> = shard
                .copies
                .values()
                .filter(|c| c.role == CopyRole::Replica && c.state == CopyState::Unassigned)
                .map(|c| c.id)
                .collect();
            for id in waiting {
                let Some(node) = self.choose_node(idx) else {
                    break;
                };
                self.place(idx, id, node, Some(primary));
            }
        }
    }

    fn place(&mut self, idx: usize, copy: CopyId, node: NodeId, source: Option<CopyId>) {
        self.decisions.push(Decision::Assign { copy, node, source });
        if let Some(c) = self.shards[idx].copies.get_mut(&copy.slot) {
            c.state = CopyState::Initializing;
            c.node = Some(node);
        }
    }

    fn rebalance(&mut self, budget: usize) {
        let mut load: BTreeMap<NodeId, usize> =
            self.live.iter().map(|n| (*n, self.load(n))).collect();

        for _ in 0..budget {
            let Some((&busiest, &high)) = load
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            else {
                return;
            };
            let Some((&idlest, &low)) = load.iter().min_by_key(|(n, l)| (**l, **n)) else {
                return;
            };
            if high - low <= 1 {
                return;
            }

            let Some((idx, source)) = self.movable_copy(&busiest, &idlest) else {
                return;
            };
            let shard = &mut self.shards[idx];
            let target = shard.new_slot();
            let mut copy = shard.copies[&source.slot].clone();
            copy.id = target;
            copy.node = Some(idlest);
            copy.state = CopyState::Initializing;
            copy.relocation_source = Some(source);
            shard.copies.insert(target.slot, copy);
            self.decisions.push(Decision::Relocate {
                source,
                target,
                node: idlest,
            });

            *load.entry(busiest).or_default() -= 1;
            *load.entry(idlest).or_default() += 1;
        }
    }

    /// A STARTED copy on `from` whose shard has no copy on `to`; replicas
    /// are moved before primaries.
    fn movable_copy(&self, from: &NodeId, to: &NodeId) -> Option<(usize, CopyId)> {
        for role in [CopyRole::Replica, CopyRole::Primary] {
            for (idx, shard) in self.shards.iter().enumerate() {
                if shard.lost || shard.hosts(to) {
                    continue;
                }
                let found = shard.copies.values().find(|c| {
                    c.node.as_ref() == Some(from)
                        && c.role == role
                        && c.state == CopyState::Started
                        && !c.is_relocation_target()
                        && !shard.has_target(c.id)
                });
                if let Some(c) = found {
                    return Some((idx, c.id));
                }
            }
        }
        None
    }
}
