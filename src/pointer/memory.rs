//! Memory objects and the solver's memory store.
//!
//! A [`MemoryObject`] models the contents of one abstract allocation as a
//! map from offset to points-to set. The store keeps either one object per
//! allocation site (flow-insensitive) or a memory map per program point
//! (flow-sensitive). Flow-sensitive maps are shared along single-successor
//! chains and materialised only at nodes that can change memory (stores,
//! memcpy, invalidations) and at join points.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::offset::Offset;
use crate::pointer::graph::PsNodeId;
use crate::pointer::{Pointer, PointsToSet};

/// Index of a memory object owned by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryObjectId(pub u32);

impl MemoryObjectId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-allocation map from offset to the pointers possibly stored there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryObject {
    /// The allocation site this object models.
    pub target: PsNodeId,
    points_to: BTreeMap<Offset, PointsToSet>,
}

impl MemoryObject {
    pub fn new(target: PsNodeId) -> MemoryObject {
        MemoryObject {
            target,
            points_to: BTreeMap::new(),
        }
    }

    pub fn at(&self, offset: Offset) -> Option<&PointsToSet> {
        self.points_to.get(&offset)
    }

    pub fn entries(&self) -> impl Iterator<Item = (Offset, &PointsToSet)> {
        self.points_to.iter().map(|(&off, set)| (off, set))
    }

    pub fn offsets(&self) -> Vec<Offset> {
        self.points_to.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.points_to.is_empty()
    }

    pub fn add_pointer(&mut self, offset: Offset, ptr: Pointer) -> bool {
        self.points_to.entry(offset).or_default().add(ptr)
    }

    pub fn add_points_to(&mut self, offset: Offset, set: &PointsToSet) -> bool {
        self.points_to.entry(offset).or_default().merge(set)
    }

    pub fn set_points_to(&mut self, offset: Offset, set: PointsToSet) {
        self.points_to.insert(offset, set);
    }
}

/// A flow-sensitive memory map: visible memory objects per pointer value.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryMap {
    entries: BTreeMap<Pointer, BTreeSet<MemoryObjectId>>,
}

impl MemoryMap {
    fn objects_of_target(&self, target: PsNodeId) -> Vec<MemoryObjectId> {
        let lo = Pointer::new(target, Offset::ZERO);
        let hi = Pointer::new(target, Offset::UNKNOWN);
        self.entries
            .range(lo..=hi)
            .flat_map(|(_, objs)| objs.iter().copied())
            .collect()
    }

    fn all_objects(&self) -> Vec<MemoryObjectId> {
        let mut out: Vec<MemoryObjectId> =
            self.entries.values().flatten().copied().collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// Result of merging predecessor maps into a node's map.
#[derive(Debug, Default)]
pub(crate) struct MergeOutcome {
    pub changed: bool,
    /// Allocation targets for which new entries became visible.
    pub new_targets: Vec<PsNodeId>,
}

/// Owns every memory object and memory map of one analysis run.
#[derive(Debug)]
pub(crate) struct MemoryStore {
    flow_sensitive: bool,
    objects: Vec<MemoryObject>,
    /// Flow-insensitive: the one object per allocation site.
    by_target: FxHashMap<PsNodeId, MemoryObjectId>,
    /// Flow-sensitive: all maps; nodes refer to them by index so a map can
    /// be shared by a whole single-successor chain.
    maps: Vec<MemoryMap>,
    node_map: Vec<Option<u32>>,
    /// Nodes that read each allocation target; re-enqueued when the
    /// target's memory changes.
    readers: FxHashMap<PsNodeId, FxHashSet<PsNodeId>>,
}

impl MemoryStore {
    pub fn new(flow_sensitive: bool, node_count: usize) -> MemoryStore {
        MemoryStore {
            flow_sensitive,
            objects: Vec::new(),
            by_target: FxHashMap::default(),
            maps: Vec::new(),
            node_map: vec![None; node_count],
            readers: FxHashMap::default(),
        }
    }

    pub fn is_flow_sensitive(&self) -> bool {
        self.flow_sensitive
    }

    /// Grow per-node tables after the function-pointer callback extended
    /// the graph.
    pub fn ensure_node_capacity(&mut self, node_count: usize) {
        if self.node_map.len() < node_count {
            self.node_map.resize(node_count, None);
        }
    }

    pub fn object(&self, id: MemoryObjectId) -> &MemoryObject {
        &self.objects[id.index()]
    }

    pub fn object_mut(&mut self, id: MemoryObjectId) -> &mut MemoryObject {
        &mut self.objects[id.index()]
    }

    pub fn all_objects(&self) -> impl Iterator<Item = &MemoryObject> {
        self.objects.iter()
    }

    pub fn readers_of(&self, target: PsNodeId) -> impl Iterator<Item = PsNodeId> + '_ {
        self.readers.get(&target).into_iter().flatten().copied()
    }

    fn new_object(&mut self, target: PsNodeId) -> MemoryObjectId {
        let id = MemoryObjectId(self.objects.len() as u32);
        self.objects.push(MemoryObject::new(target));
        id
    }

    /// The memory objects holding `ptr`'s target as seen from `at`.
    ///
    /// Registers `at` as a reader of the target so it is re-enqueued when
    /// that memory changes.
    pub fn objects_at(&mut self, at: PsNodeId, ptr: Pointer) -> Vec<MemoryObjectId> {
        self.readers.entry(ptr.target).or_default().insert(at);
        if !self.flow_sensitive {
            return vec![self.flow_insensitive_object(ptr.target)];
        }
        match self.node_map[at.0 as usize] {
            Some(map) => self.maps[map as usize].objects_of_target(ptr.target),
            None => Vec::new(),
        }
    }

    /// Read-only variant of [`MemoryStore::objects_at`]: no reader
    /// registration, no object creation.
    pub fn peek_objects(&self, at: PsNodeId, ptr: Pointer) -> Vec<MemoryObjectId> {
        if !self.flow_sensitive {
            return self.by_target.get(&ptr.target).copied().into_iter().collect();
        }
        match self.node_map.get(at.0 as usize).copied().flatten() {
            Some(map) => self.maps[map as usize].objects_of_target(ptr.target),
            None => Vec::new(),
        }
    }

    /// Every object visible at `at` (flow-sensitive), or every object at
    /// all (flow-insensitive).
    pub fn visible_objects(&self, at: PsNodeId) -> Vec<MemoryObjectId> {
        if !self.flow_sensitive {
            return (0..self.objects.len() as u32).map(MemoryObjectId).collect();
        }
        match self.node_map[at.0 as usize] {
            Some(map) => self.maps[map as usize].all_objects(),
            None => Vec::new(),
        }
    }

    fn flow_insensitive_object(&mut self, target: PsNodeId) -> MemoryObjectId {
        if let Some(&id) = self.by_target.get(&target) {
            return id;
        }
        let id = self.new_object(target);
        self.by_target.insert(target, id);
        id
    }

    /// Flow-sensitive pre-step: make sure `node` has a memory map.
    ///
    /// `fresh_targets` is the destination pointer set of store-like nodes;
    /// each of its valid pointers gets an own (initially empty) object in
    /// the node's map so the transfer function has something to write into.
    pub fn fs_prepare(
        &mut self,
        node: PsNodeId,
        preds: &[PsNodeId],
        fresh_targets: Option<&PointsToSet>,
        force_own: bool,
    ) {
        debug_assert!(self.flow_sensitive);
        let idx = node.0 as usize;

        if self.node_map[idx].is_none() {
            let owns_map = force_own || fresh_targets.is_some() || preds.len() != 1;
            if owns_map {
                let map = self.maps.len() as u32;
                self.maps.push(MemoryMap::default());
                self.node_map[idx] = Some(map);
            } else {
                // share the single predecessor's map (creating it if the
                // predecessor has not been processed yet)
                let pred = preds[0].0 as usize;
                if self.node_map[pred].is_none() {
                    let map = self.maps.len() as u32;
                    self.maps.push(MemoryMap::default());
                    self.node_map[pred] = Some(map);
                }
                self.node_map[idx] = self.node_map[pred];
            }
        }

        // The destination set can grow between visits; top up own objects.
        if let Some(targets) = fresh_targets {
            let map = self.node_map[idx].unwrap() as usize;
            let missing: Vec<Pointer> = targets
                .iter()
                .filter(|ptr| ptr.is_valid())
                .filter(|ptr| !self.maps[map].entries.contains_key(ptr))
                .collect();
            for ptr in missing {
                let obj = self.new_object(ptr.target);
                self.maps[map].entries.entry(ptr).or_default().insert(obj);
            }
        }
    }

    /// Flow-sensitive post-step: merge predecessor maps into the node's
    /// own map, skipping the strongly updated pointer if any.
    pub fn fs_merge_preds(
        &mut self,
        node: PsNodeId,
        preds: &[PsNodeId],
        strong_update: Option<Pointer>,
    ) -> MergeOutcome {
        debug_assert!(self.flow_sensitive);
        let mut outcome = MergeOutcome::default();
        let own = match self.node_map[node.0 as usize] {
            Some(m) => m as usize,
            None => return outcome,
        };

        for &pred in preds {
            let pm = match self.node_map[pred.0 as usize] {
                Some(m) => m as usize,
                None => continue,
            };
            if pm == own {
                continue;
            }
            // collect first: the two maps live in the same vector
            let entries: Vec<(Pointer, Vec<MemoryObjectId>)> = self.maps[pm]
                .entries
                .iter()
                .map(|(&ptr, objs)| (ptr, objs.iter().copied().collect()))
                .collect();
            for (ptr, objs) in entries {
                if strong_update == Some(ptr) {
                    continue;
                }
                let slot = self.maps[own].entries.entry(ptr).or_default();
                let before = slot.len();
                slot.extend(objs);
                if slot.len() != before {
                    outcome.changed = true;
                    outcome.new_targets.push(ptr.target);
                }
            }
        }
        outcome.new_targets.sort_unstable();
        outcome.new_targets.dedup();
        outcome
    }
}
