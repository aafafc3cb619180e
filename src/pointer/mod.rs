//! Pointer analysis: the pointer subgraph IR and its solver.
//!
//! The pointer subgraph ([`graph::PointerGraph`]) represents the value flow
//! of pointers; the solver ([`solver::PointerAnalysis`]) runs a worklist
//! fixpoint over it and answers `points_to` queries. Memory objects
//! ([`memory::MemoryObject`]) hold the per-allocation offset maps.

pub mod graph;
pub mod memory;
pub mod solver;

pub use graph::{AllocInfo, PointerGraph, PsNode, PsNodeId, PsNodeKind, PsSubgraph, PsSubgraphId};
pub use memory::{MemoryObject, MemoryObjectId};
pub use solver::{FunctionPointerCallback, PointerAnalysis};

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use crate::offset::Offset;

/// A pointer: an allocation site plus an offset into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pointer {
    pub target: PsNodeId,
    pub offset: Offset,
}

impl Pointer {
    pub fn new(target: PsNodeId, offset: Offset) -> Pointer {
        Pointer { target, offset }
    }

    /// The null pointer.
    pub fn null() -> Pointer {
        Pointer::new(PsNodeId::NULL_ADDR, Offset::ZERO)
    }

    /// The pointer to unknown memory at unknown offset.
    pub fn unknown() -> Pointer {
        Pointer::new(PsNodeId::UNKNOWN_MEMORY, Offset::UNKNOWN)
    }

    pub fn invalidated() -> Pointer {
        Pointer::new(PsNodeId::INVALIDATED, Offset::UNKNOWN)
    }

    pub fn is_null(self) -> bool {
        self.target == PsNodeId::NULL_ADDR
    }

    pub fn is_unknown(self) -> bool {
        self.target == PsNodeId::UNKNOWN_MEMORY
    }

    pub fn is_invalidated(self) -> bool {
        self.target == PsNodeId::INVALIDATED
    }

    /// Neither null, unknown, nor invalidated.
    pub fn is_valid(self) -> bool {
        !self.is_null() && !self.is_unknown() && !self.is_invalidated()
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.target.0, self.offset)
    }
}

/// The set of offsets a target is pointed to at.
///
/// Invariant: if the unknown offset is present it is the only element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetSet {
    offsets: BTreeSet<Offset>,
}

impl OffsetSet {
    fn add(&mut self, offset: Offset) -> bool {
        if self.offsets.contains(&Offset::UNKNOWN) {
            return false;
        }
        if offset.is_unknown() {
            // unknown absorbs every concrete offset
            self.offsets.clear();
            self.offsets.insert(Offset::UNKNOWN);
            return true;
        }
        self.offsets.insert(offset)
    }

    fn merge(&mut self, other: &OffsetSet) -> bool {
        let mut changed = false;
        for &off in &other.offsets {
            changed |= self.add(off);
        }
        changed
    }

    pub fn contains(&self, offset: Offset) -> bool {
        self.offsets.contains(&offset)
    }

    pub fn has_unknown(&self) -> bool {
        self.offsets.contains(&Offset::UNKNOWN)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Offset> + '_ {
        self.offsets.iter().copied()
    }
}

/// A compact points-to set: target node to set of offsets, with the
/// absorbing-unknown-offset invariant maintained per target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointsToSet {
    pointers: BTreeMap<PsNodeId, OffsetSet>,
}

impl PointsToSet {
    pub fn new() -> PointsToSet {
        PointsToSet::default()
    }

    pub fn singleton(ptr: Pointer) -> PointsToSet {
        let mut set = PointsToSet::new();
        set.add(ptr);
        set
    }

    /// Insert a pointer; returns whether the set changed.
    pub fn add(&mut self, ptr: Pointer) -> bool {
        self.pointers.entry(ptr.target).or_default().add(ptr.offset)
    }

    /// Union `other` into `self`; returns whether the set changed.
    pub fn merge(&mut self, other: &PointsToSet) -> bool {
        let mut changed = false;
        for (&target, offsets) in &other.pointers {
            changed |= self.pointers.entry(target).or_default().merge(offsets);
        }
        changed
    }

    pub fn contains(&self, ptr: Pointer) -> bool {
        self.pointers
            .get(&ptr.target)
            .is_some_and(|s| s.contains(ptr.offset))
    }

    pub fn contains_target(&self, target: PsNodeId) -> bool {
        self.pointers.contains_key(&target)
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    /// Number of pointers in the flattened view.
    pub fn len(&self) -> usize {
        self.pointers.values().map(OffsetSet::len).sum()
    }

    /// The only pointer in the set, if the set is a singleton.
    pub fn single_pointer(&self) -> Option<Pointer> {
        if self.len() != 1 {
            return None;
        }
        self.iter().next()
    }

    /// Flat iteration in (target, offset) order.
    pub fn iter(&self) -> impl Iterator<Item = Pointer> + '_ {
        self.pointers.iter().flat_map(|(&target, offsets)| {
            offsets.iter().map(move |off| Pointer::new(target, off))
        })
    }

    pub fn targets(&self) -> impl Iterator<Item = PsNodeId> + '_ {
        self.pointers.keys().copied()
    }

    pub fn offsets_of(&self, target: PsNodeId) -> Option<&OffsetSet> {
        self.pointers.get(&target)
    }
}

impl FromIterator<Pointer> for PointsToSet {
    fn from_iter<I: IntoIterator<Item = Pointer>>(iter: I) -> PointsToSet {
        let mut set = PointsToSet::new();
        for ptr in iter {
            set.add(ptr);
        }
        set
    }
}

impl fmt::Display for PointsToSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, ptr) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{ptr}")?;
        }
        write!(f, "}}")
    }
}
