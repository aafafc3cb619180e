//! The pointer subgraph: an arena of typed nodes representing pointer
//! value flow.
//!
//! Nodes live in one `Vec` indexed by [`PsNodeId`]; all cross references
//! (operands, control-flow edges, paired nodes) are ids. The three
//! distinguished locations (null, unknown memory, invalidated) occupy the
//! reserved ids 0, 1 and 2 of every graph, so no global state is needed.

use serde::{Deserialize, Serialize};

use crate::diagnostics::AnalysisResult;
use crate::malformed;
use crate::offset::Offset;
use crate::pointer::{Pointer, PointsToSet};

/// Index of a node in a [`PointerGraph`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PsNodeId(pub u32);

impl PsNodeId {
    /// The null address singleton.
    pub const NULL_ADDR: PsNodeId = PsNodeId(0);
    /// The unknown-memory singleton.
    pub const UNKNOWN_MEMORY: PsNodeId = PsNodeId(1);
    /// The invalidated-memory singleton.
    pub const INVALIDATED: PsNodeId = PsNodeId(2);

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a subgraph (one per function) in a [`PointerGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PsSubgraphId(pub u32);

impl PsSubgraphId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Attributes of an allocation site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocInfo {
    /// Size in bytes; unknown when not statically known.
    pub size: Offset,
    /// Summarises potentially many runtime objects; disqualifies strong
    /// updates.
    pub is_heap: bool,
    pub is_global: bool,
    pub zero_initialized: bool,
}

impl AllocInfo {
    pub fn stack(size: Offset) -> AllocInfo {
        AllocInfo {
            size,
            is_heap: false,
            is_global: false,
            zero_initialized: false,
        }
    }

    pub fn global(size: Offset) -> AllocInfo {
        AllocInfo {
            size,
            is_heap: false,
            is_global: true,
            zero_initialized: false,
        }
    }

    pub fn heap(size: Offset, zero_initialized: bool) -> AllocInfo {
        AllocInfo {
            size,
            is_heap: true,
            is_global: false,
            zero_initialized,
        }
    }

    pub fn zeroed(mut self) -> AllocInfo {
        self.zero_initialized = true;
        self
    }
}

/// The closed set of pointer-subgraph node kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum PsNodeKind {
    /// Reserved singleton: the null address.
    NullAddr,
    /// Reserved singleton: unknown memory.
    UnknownMemory,
    /// Reserved singleton: invalidated memory.
    Invalidated,
    /// Stack or global allocation site.
    Alloc(AllocInfo),
    /// Heap allocation site.
    DynAlloc(AllocInfo),
    /// Allocation-like placeholder for a function symbol.
    Function,
    /// Dereference of operand 0.
    Load,
    /// Write operand 0 into the memory pointed to by operand 1.
    Store,
    /// Pointer arithmetic on operand 0.
    Gep { offset: Offset },
    /// Identity on points-to; distinct node for provenance.
    Cast,
    /// Join of all operands.
    Phi,
    /// Call marker, paired with a `CallReturn`.
    Call,
    /// Indirect call through the pointer in operand 0.
    CallFuncPtr,
    /// Rendezvous point after a call; operands are callee return nodes.
    CallReturn,
    /// Subgraph entry.
    Entry,
    /// Unified subgraph exit; operands are the returned pointers.
    Return,
    Noop,
    /// Carries an immutable points-to set fixed at construction.
    Constant,
    /// Copy a byte range of operand 0's memory into operand 1's memory.
    Memcpy { src_offset: Offset, len: Offset },
    /// Invalidate the targets of operand 0.
    Free,
    /// At function exit, invalidate the stack allocations of the exiting
    /// subgraph (operand 0 is its return node).
    InvalidateLocals,
    /// Explicit lifetime end of the object pointed to by operand 0.
    InvalidateObject,
}

/// A node of the pointer subgraph.
#[derive(Debug)]
pub struct PsNode {
    pub kind: PsNodeKind,
    operands: Vec<PsNodeId>,
    successors: Vec<PsNodeId>,
    predecessors: Vec<PsNodeId>,
    /// The points-to set computed by the solver.
    pub points_to: PointsToSet,
    paired: Option<PsNodeId>,
    parent: Option<PsSubgraphId>,
    /// Opaque frontend tag; the core never interprets it.
    pub user_data: usize,
}

impl PsNode {
    fn new(kind: PsNodeKind) -> PsNode {
        PsNode {
            kind,
            operands: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
            points_to: PointsToSet::new(),
            paired: None,
            parent: None,
            user_data: 0,
        }
    }

    pub fn operands(&self) -> &[PsNodeId] {
        &self.operands
    }

    pub fn operand(&self, i: usize) -> Option<PsNodeId> {
        self.operands.get(i).copied()
    }

    pub fn successors(&self) -> &[PsNodeId] {
        &self.successors
    }

    pub fn predecessors(&self) -> &[PsNodeId] {
        &self.predecessors
    }

    pub fn single_successor(&self) -> Option<PsNodeId> {
        match self.successors.as_slice() {
            [s] => Some(*s),
            _ => None,
        }
    }

    pub fn single_predecessor(&self) -> Option<PsNodeId> {
        match self.predecessors.as_slice() {
            [p] => Some(*p),
            _ => None,
        }
    }

    pub fn paired(&self) -> Option<PsNodeId> {
        self.paired
    }

    pub fn parent(&self) -> Option<PsSubgraphId> {
        self.parent
    }

    pub fn alloc_info(&self) -> Option<&AllocInfo> {
        match &self.kind {
            PsNodeKind::Alloc(info) | PsNodeKind::DynAlloc(info) => Some(info),
            _ => None,
        }
    }

    /// Allocation sites act as abstract memory locations.
    pub fn is_allocation(&self) -> bool {
        matches!(
            self.kind,
            PsNodeKind::Alloc(_) | PsNodeKind::DynAlloc(_) | PsNodeKind::Function
        )
    }

    pub fn is_heap_allocation(&self) -> bool {
        self.alloc_info().is_some_and(|info| info.is_heap)
    }

    pub fn zero_initialized(&self) -> bool {
        self.alloc_info().is_some_and(|info| info.zero_initialized)
    }
}

/// One function's slice of the pointer subgraph.
#[derive(Debug)]
pub struct PsSubgraph {
    pub name: String,
    entry: Option<PsNodeId>,
    ret: Option<PsNodeId>,
}

impl PsSubgraph {
    pub fn entry(&self) -> Option<PsNodeId> {
        self.entry
    }

    pub fn ret(&self) -> Option<PsNodeId> {
        self.ret
    }
}

/// Arena container owning all pointer-subgraph nodes and subgraphs.
///
/// Move-only: node ids stay stable for the container's lifetime.
#[derive(Debug)]
pub struct PointerGraph {
    nodes: Vec<PsNode>,
    subgraphs: Vec<PsSubgraph>,
    entry: Option<PsSubgraphId>,
}

impl Default for PointerGraph {
    fn default() -> PointerGraph {
        PointerGraph::new()
    }
}

impl PointerGraph {
    pub fn new() -> PointerGraph {
        let nodes = vec![
            PsNode::new(PsNodeKind::NullAddr),
            PsNode::new(PsNodeKind::UnknownMemory),
            PsNode::new(PsNodeKind::Invalidated),
        ];
        PointerGraph {
            nodes,
            subgraphs: Vec::new(),
            entry: None,
        }
    }

    /// Create a node. Allocation nodes point to themselves at offset 0 by
    /// construction.
    pub fn add_node(&mut self, kind: PsNodeKind) -> PsNodeId {
        let id = PsNodeId(self.nodes.len() as u32);
        let mut node = PsNode::new(kind);
        if node.is_allocation() {
            node.points_to.add(Pointer::new(id, Offset::ZERO));
        }
        self.nodes.push(node);
        id
    }

    /// Create a node owned by `subgraph`.
    pub fn add_node_in(&mut self, kind: PsNodeKind, subgraph: PsSubgraphId) -> PsNodeId {
        let id = self.add_node(kind);
        self.nodes[id.index()].parent = Some(subgraph);
        id
    }

    pub fn add_subgraph(&mut self, name: impl Into<String>) -> PsSubgraphId {
        let id = PsSubgraphId(self.subgraphs.len() as u32);
        self.subgraphs.push(PsSubgraph {
            name: name.into(),
            entry: None,
            ret: None,
        });
        id
    }

    pub fn set_entry(&mut self, subgraph: PsSubgraphId) {
        self.entry = Some(subgraph);
    }

    pub fn entry(&self) -> Option<PsSubgraphId> {
        self.entry
    }

    pub fn set_subgraph_entry(&mut self, subgraph: PsSubgraphId, node: PsNodeId) {
        self.subgraphs[subgraph.index()].entry = Some(node);
    }

    pub fn set_subgraph_return(&mut self, subgraph: PsSubgraphId, node: PsNodeId) {
        self.subgraphs[subgraph.index()].ret = Some(node);
    }

    pub fn node(&self, id: PsNodeId) -> &PsNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: PsNodeId) -> &mut PsNode {
        &mut self.nodes[id.index()]
    }

    pub fn subgraph(&self, id: PsSubgraphId) -> &PsSubgraph {
        &self.subgraphs[id.index()]
    }

    pub fn subgraph_ids(&self) -> impl Iterator<Item = PsSubgraphId> {
        (0..self.subgraphs.len() as u32).map(PsSubgraphId)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = PsNodeId> {
        (0..self.nodes.len() as u32).map(PsNodeId)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn add_operand(&mut self, node: PsNodeId, operand: PsNodeId) {
        self.nodes[node.index()].operands.push(operand);
    }

    /// Add a control-flow edge; keeps the predecessor list in sync.
    pub fn add_successor(&mut self, from: PsNodeId, to: PsNodeId) {
        if !self.nodes[from.index()].successors.contains(&to) {
            self.nodes[from.index()].successors.push(to);
            self.nodes[to.index()].predecessors.push(from);
        }
    }

    /// Pair a call with its call-return node (both directions).
    pub fn pair(&mut self, call: PsNodeId, call_return: PsNodeId) {
        self.nodes[call.index()].paired = Some(call_return);
        self.nodes[call_return.index()].paired = Some(call);
    }

    /// Initialise the immutable points-to of a `Constant` node.
    pub fn set_constant_points_to(&mut self, node: PsNodeId, ptr: Pointer) {
        debug_assert!(matches!(self.nodes[node.index()].kind, PsNodeKind::Constant));
        self.nodes[node.index()].points_to.add(ptr);
    }

    /// Reject graphs the solver must not run on.
    pub fn validate(&self) -> AnalysisResult<()> {
        let entry = match self.entry {
            Some(e) => e,
            None => malformed!("pointer graph has no entry subgraph"),
        };
        if self.subgraph(entry).entry.is_none() {
            malformed!("entry subgraph '{}' has no entry node", self.subgraph(entry).name);
        }
        for sg in self.subgraph_ids() {
            if self.subgraph(sg).entry.is_none() {
                malformed!("subgraph '{}' has no entry node", self.subgraph(sg).name);
            }
        }
        for id in self.node_ids() {
            let node = self.node(id);
            let required = match node.kind {
                PsNodeKind::Load
                | PsNodeKind::Gep { .. }
                | PsNodeKind::Cast
                | PsNodeKind::Free
                | PsNodeKind::InvalidateObject
                | PsNodeKind::InvalidateLocals
                | PsNodeKind::CallFuncPtr => 1,
                PsNodeKind::Store | PsNodeKind::Memcpy { .. } => 2,
                _ => 0,
            };
            if node.operands.len() < required {
                malformed!(
                    "node {} ({:?}) has {} operands, needs {}",
                    id.0,
                    node.kind,
                    node.operands.len(),
                    required
                );
            }
            for &op in node.operands() {
                if op.index() >= self.nodes.len() {
                    malformed!("node {} references missing operand {}", id.0, op.0);
                }
            }
            if matches!(node.kind, PsNodeKind::Constant) && node.points_to.is_empty() {
                malformed!("constant node {} has no points-to", id.0);
            }
        }
        Ok(())
    }
}
