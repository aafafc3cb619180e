//! The read–write graph: per-function control-flow graphs of read/write
//! effects over abstract memory.
//!
//! The frontend builds the skeleton (subgraphs, blocks, nodes linked to
//! their pointer-analysis counterparts); [`builder::annotate`] then fills
//! in the def-sites from a finished pointer analysis. The reaching
//! definitions and memory-SSA engines both run over this graph.
//!
//! Like the pointer subgraph, all nodes live in one arena and reference
//! each other by id. Id 0 is reserved for the unknown-memory node, the
//! target of conservative def-sites.

pub mod builder;

use std::collections::BTreeSet;
use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::diagnostics::AnalysisResult;
use crate::malformed;
use crate::offset::Offset;
use crate::pointer::PsNodeId;

/// Index of a node in a [`ReadWriteGraph`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RwNodeId(pub u32);

impl RwNodeId {
    /// The artificial unknown-memory location.
    pub const UNKNOWN_MEMORY: RwNodeId = RwNodeId(0);

    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RwBlockId(pub u32);

impl RwBlockId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RwSubgraphId(pub u32);

impl RwSubgraphId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A (possibly partial) read or write of an abstract memory object:
/// `len` bytes of `target` starting at `offset`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DefSite {
    pub target: RwNodeId,
    pub offset: Offset,
    pub len: Offset,
}

impl DefSite {
    pub fn new(target: RwNodeId, offset: Offset, len: Offset) -> DefSite {
        DefSite {
            target,
            offset,
            len,
        }
    }

    /// The sentinel def-site: unknown memory, unknown offset and length.
    pub fn unknown_memory() -> DefSite {
        DefSite::new(RwNodeId::UNKNOWN_MEMORY, Offset::UNKNOWN, Offset::UNKNOWN)
    }

    pub fn is_unknown_memory(&self) -> bool {
        self.target == RwNodeId::UNKNOWN_MEMORY
    }

    /// Whether the byte ranges of two sites may overlap; conservative on
    /// unknown offsets or lengths, and across unknown-memory targets.
    pub fn overlaps(&self, other: &DefSite) -> bool {
        if self.target != other.target
            && !self.is_unknown_memory()
            && !other.is_unknown_memory()
        {
            return false;
        }
        ranges_overlap(self.offset, self.len, other.offset, other.len)
    }

    /// Whether this site covers every byte `other` touches (same target,
    /// enclosing concrete range).
    pub fn covers(&self, other: &DefSite) -> bool {
        if self.target != other.target {
            return false;
        }
        match (
            self.offset.value(),
            self.len.value(),
            other.offset.value(),
            other.len.value(),
        ) {
            (Some(a), Some(al), Some(b), Some(bl)) => {
                a <= b && b.saturating_add(bl) <= a.saturating_add(al)
            }
            // a fully unknown range covers everything for the target;
            // any other unknown combination cannot guarantee coverage
            _ => self.offset.is_unknown() && self.len.is_unknown(),
        }
    }
}

fn ranges_overlap(off_a: Offset, len_a: Offset, off_b: Offset, len_b: Offset) -> bool {
    match (off_a.value(), len_a.value(), off_b.value(), len_b.value()) {
        (Some(a), Some(al), Some(b), Some(bl)) => {
            a < b.saturating_add(bl) && b < a.saturating_add(al)
        }
        // one range is open-ended: they overlap unless it starts past the
        // other's end
        (Some(a), None, Some(b), Some(bl)) => a < b.saturating_add(bl),
        (Some(a), Some(al), Some(b), None) => b < a.saturating_add(al),
        _ => true,
    }
}

impl fmt::Display for DefSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} + {} : {}]", self.target.0, self.offset, self.len)
    }
}

/// Allocation attributes the data-dependence analyses care about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RwAllocInfo {
    pub is_heap: bool,
    pub is_global: bool,
}

/// Link from a memory-touching node back to the pointer analysis: the
/// pointer operand's PS node and the declared access size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    pub pointer: Option<PsNodeId>,
    pub length: Offset,
}

impl MemAccess {
    pub fn new(pointer: PsNodeId, length: Offset) -> MemAccess {
        MemAccess {
            pointer: Some(pointer),
            length,
        }
    }

    /// For nodes annotated directly by the frontend, with no PS link.
    pub fn unresolved() -> MemAccess {
        MemAccess {
            pointer: None,
            length: Offset::UNKNOWN,
        }
    }
}

/// One positional call argument; the constant value (when statically
/// known) feeds function-model operand references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallArg {
    pub pointer: Option<PsNodeId>,
    pub constant: Option<u64>,
}

impl CallArg {
    pub fn pointer(ps: PsNodeId) -> CallArg {
        CallArg {
            pointer: Some(ps),
            constant: None,
        }
    }

    pub fn constant(value: u64) -> CallArg {
        CallArg {
            pointer: None,
            constant: Some(value),
        }
    }
}

/// Payload of a call node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallInfo {
    /// Subgraphs of callees with a body; empty for declared functions.
    pub callees: Vec<RwSubgraphId>,
    /// Name used to look up a function model for declared callees.
    pub callee_name: Option<String>,
    pub args: Vec<CallArg>,
}

/// The closed set of read–write graph node kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum RwNodeKind {
    /// Reserved id 0: the unknown-memory location.
    UnknownMemory,
    /// Stack or global allocation site (an abstract memory object).
    Alloc(RwAllocInfo),
    /// Heap allocation site.
    DynAlloc(RwAllocInfo),
    Store(MemAccess),
    Load(MemAccess),
    /// Artificial use, e.g. a query probe.
    Mu(MemAccess),
    /// Join of definitions, synthesised by the SSA engine.
    Phi,
    Call(CallInfo),
    CallReturn,
    Return,
    Fork,
    Join,
    Noop,
}

/// A node of the read–write graph.
#[derive(Debug)]
pub struct RwNode {
    pub kind: RwNodeKind,
    /// Weak definitions.
    pub defs: BTreeSet<DefSite>,
    /// Strong definitions (must-kill).
    pub overwrites: BTreeSet<DefSite>,
    /// Memory read by this node.
    pub uses: BTreeSet<DefSite>,
    block: Option<RwBlockId>,
    paired: Option<RwNodeId>,
    /// The producing pointer-analysis node, when there is one.
    pub origin: Option<PsNodeId>,
    /// Def-use edges resolved by an engine: the definers of this node's
    /// uses.
    pub(crate) defuse: Vec<RwNodeId>,
}

impl RwNode {
    fn new(kind: RwNodeKind) -> RwNode {
        RwNode {
            kind,
            defs: BTreeSet::new(),
            overwrites: BTreeSet::new(),
            uses: BTreeSet::new(),
            block: None,
            paired: None,
            origin: None,
            defuse: Vec::new(),
        }
    }

    pub fn block(&self) -> Option<RwBlockId> {
        self.block
    }

    pub fn paired(&self) -> Option<RwNodeId> {
        self.paired
    }

    pub fn add_def(&mut self, site: DefSite, strong: bool) {
        if strong {
            self.overwrites.insert(site);
        } else {
            self.defs.insert(site);
        }
    }

    pub fn add_use(&mut self, site: DefSite) {
        self.uses.insert(site);
    }

    pub fn is_use(&self) -> bool {
        !self.uses.is_empty()
    }

    pub fn defines_memory(&self) -> bool {
        !self.defs.is_empty() || !self.overwrites.is_empty()
    }

    /// Weak and strong definitions together.
    pub fn all_defs(&self) -> impl Iterator<Item = &DefSite> {
        self.defs.iter().chain(self.overwrites.iter())
    }

    pub fn call_info(&self) -> Option<&CallInfo> {
        match &self.kind {
            RwNodeKind::Call(info) => Some(info),
            _ => None,
        }
    }

    pub fn mem_access(&self) -> Option<&MemAccess> {
        match &self.kind {
            RwNodeKind::Store(m) | RwNodeKind::Load(m) | RwNodeKind::Mu(m) => Some(m),
            _ => None,
        }
    }

    pub fn alloc_info(&self) -> Option<&RwAllocInfo> {
        match &self.kind {
            RwNodeKind::Alloc(info) | RwNodeKind::DynAlloc(info) => Some(info),
            _ => None,
        }
    }

    pub fn is_allocation(&self) -> bool {
        matches!(
            self.kind,
            RwNodeKind::Alloc(_) | RwNodeKind::DynAlloc(_) | RwNodeKind::UnknownMemory
        )
    }

    pub fn is_heap_allocation(&self) -> bool {
        matches!(&self.kind, RwNodeKind::DynAlloc(_))
            || self.alloc_info().is_some_and(|info| info.is_heap)
    }

    /// The definers of this node's uses, as resolved by the last engine
    /// that ran.
    pub fn defuse(&self) -> &[RwNodeId] {
        &self.defuse
    }
}

/// A basic block: an ordered node sequence plus CFG edges.
#[derive(Debug)]
pub struct RwBlock {
    nodes: Vec<RwNodeId>,
    successors: Vec<RwBlockId>,
    predecessors: Vec<RwBlockId>,
    subgraph: RwSubgraphId,
}

impl RwBlock {
    pub fn nodes(&self) -> &[RwNodeId] {
        &self.nodes
    }

    pub fn successors(&self) -> &[RwBlockId] {
        &self.successors
    }

    pub fn predecessors(&self) -> &[RwBlockId] {
        &self.predecessors
    }

    pub fn subgraph(&self) -> RwSubgraphId {
        self.subgraph
    }

    pub fn first(&self) -> Option<RwNodeId> {
        self.nodes.first().copied()
    }

    pub fn last(&self) -> Option<RwNodeId> {
        self.nodes.last().copied()
    }
}

/// One function's slice of the read–write graph.
#[derive(Debug)]
pub struct RwSubgraph {
    pub name: String,
    blocks: Vec<RwBlockId>,
    entry: Option<RwBlockId>,
}

impl RwSubgraph {
    pub fn blocks(&self) -> &[RwBlockId] {
        &self.blocks
    }

    pub fn entry(&self) -> Option<RwBlockId> {
        self.entry
    }
}

/// Arena container owning all read–write nodes, blocks and subgraphs.
///
/// Move-only: ids stay stable for the container's lifetime.
#[derive(Debug)]
pub struct ReadWriteGraph {
    nodes: Vec<RwNode>,
    blocks: Vec<RwBlock>,
    subgraphs: Vec<RwSubgraph>,
    entry: Option<RwSubgraphId>,
    /// Pointer-analysis allocation node to its RWG counterpart.
    alloc_map: FxHashMap<PsNodeId, RwNodeId>,
}

impl Default for ReadWriteGraph {
    fn default() -> ReadWriteGraph {
        ReadWriteGraph::new()
    }
}

impl ReadWriteGraph {
    pub fn new() -> ReadWriteGraph {
        ReadWriteGraph {
            nodes: vec![RwNode::new(RwNodeKind::UnknownMemory)],
            blocks: Vec::new(),
            subgraphs: Vec::new(),
            entry: None,
            alloc_map: FxHashMap::default(),
        }
    }

    pub fn add_node(&mut self, kind: RwNodeKind) -> RwNodeId {
        let id = RwNodeId(self.nodes.len() as u32);
        self.nodes.push(RwNode::new(kind));
        id
    }

    pub fn add_subgraph(&mut self, name: impl Into<String>) -> RwSubgraphId {
        let id = RwSubgraphId(self.subgraphs.len() as u32);
        self.subgraphs.push(RwSubgraph {
            name: name.into(),
            blocks: Vec::new(),
            entry: None,
        });
        id
    }

    pub fn add_block(&mut self, subgraph: RwSubgraphId) -> RwBlockId {
        let id = RwBlockId(self.blocks.len() as u32);
        self.blocks.push(RwBlock {
            nodes: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
            subgraph,
        });
        self.subgraphs[subgraph.index()].blocks.push(id);
        if self.subgraphs[subgraph.index()].entry.is_none() {
            self.subgraphs[subgraph.index()].entry = Some(id);
        }
        id
    }

    /// Append a node at the end of a block.
    pub fn append(&mut self, block: RwBlockId, node: RwNodeId) {
        self.blocks[block.index()].nodes.push(node);
        self.nodes[node.index()].block = Some(block);
    }

    /// Insert a node at the head of a block, after any phis already there.
    pub(crate) fn insert_at_head(&mut self, block: RwBlockId, node: RwNodeId) {
        let pos = self.blocks[block.index()]
            .nodes
            .iter()
            .take_while(|&&n| matches!(self.nodes[n.index()].kind, RwNodeKind::Phi))
            .count();
        self.blocks[block.index()].nodes.insert(pos, node);
        self.nodes[node.index()].block = Some(block);
    }

    /// Insert `node` immediately before `before` in its block.
    pub(crate) fn insert_before(&mut self, node: RwNodeId, before: RwNodeId) {
        let block = self.nodes[before.index()].block.expect("node outside a block");
        let pos = self.blocks[block.index()]
            .nodes
            .iter()
            .position(|&n| n == before)
            .expect("block does not list its node");
        self.blocks[block.index()].nodes.insert(pos, node);
        self.nodes[node.index()].block = Some(block);
    }

    /// Unlink a node from its block (the arena entry stays valid).
    pub(crate) fn remove_node_from_block(&mut self, node: RwNodeId) {
        if let Some(block) = self.nodes[node.index()].block {
            self.blocks[block.index()].nodes.retain(|&n| n != node);
            self.nodes[node.index()].block = None;
        }
    }

    /// Add a CFG edge; keeps the predecessor list in sync.
    pub fn add_block_edge(&mut self, from: RwBlockId, to: RwBlockId) {
        if !self.blocks[from.index()].successors.contains(&to) {
            self.blocks[from.index()].successors.push(to);
            self.blocks[to.index()].predecessors.push(from);
        }
    }

    pub fn pair(&mut self, call: RwNodeId, call_return: RwNodeId) {
        self.nodes[call.index()].paired = Some(call_return);
        self.nodes[call_return.index()].paired = Some(call);
    }

    pub fn set_entry(&mut self, subgraph: RwSubgraphId) {
        self.entry = Some(subgraph);
    }

    pub fn entry(&self) -> Option<RwSubgraphId> {
        self.entry
    }

    /// Pick the entry subgraph by function name, when the frontend did
    /// not set one explicitly.
    pub fn select_entry_by_name(&mut self, name: &str) {
        if let Some(sg) = self
            .subgraph_ids()
            .find(|&sg| self.subgraph(sg).name == name)
        {
            self.entry = Some(sg);
        }
    }

    pub fn set_subgraph_entry(&mut self, subgraph: RwSubgraphId, block: RwBlockId) {
        self.subgraphs[subgraph.index()].entry = Some(block);
    }

    /// Register the RWG counterpart of a pointer-analysis allocation.
    /// Also records the PS node as the allocation's origin.
    pub fn map_allocation(&mut self, ps: PsNodeId, rw: RwNodeId) {
        self.alloc_map.insert(ps, rw);
        self.nodes[rw.index()].origin = Some(ps);
    }

    /// The RWG memory object standing for a pointer-analysis target;
    /// unknown memory when the target was never registered.
    pub fn rw_target(&self, ps: PsNodeId) -> RwNodeId {
        self.alloc_map
            .get(&ps)
            .copied()
            .unwrap_or(RwNodeId::UNKNOWN_MEMORY)
    }

    pub fn node(&self, id: RwNodeId) -> &RwNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: RwNodeId) -> &mut RwNode {
        &mut self.nodes[id.index()]
    }

    pub fn block(&self, id: RwBlockId) -> &RwBlock {
        &self.blocks[id.index()]
    }

    pub fn subgraph(&self, id: RwSubgraphId) -> &RwSubgraph {
        &self.subgraphs[id.index()]
    }

    pub fn node_ids(&self) -> impl Iterator<Item = RwNodeId> {
        (0..self.nodes.len() as u32).map(RwNodeId)
    }

    pub fn block_ids(&self) -> impl Iterator<Item = RwBlockId> {
        (0..self.blocks.len() as u32).map(RwBlockId)
    }

    pub fn subgraph_ids(&self) -> impl Iterator<Item = RwSubgraphId> {
        (0..self.subgraphs.len() as u32).map(RwSubgraphId)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Blocks of a subgraph ending in a return node.
    pub fn return_blocks(&self, subgraph: RwSubgraphId) -> Vec<RwBlockId> {
        self.subgraph(subgraph)
            .blocks()
            .iter()
            .copied()
            .filter(|&b| {
                self.block(b)
                    .last()
                    .is_some_and(|n| matches!(self.node(n).kind, RwNodeKind::Return))
            })
            .collect()
    }

    /// CFG predecessors at node granularity: the previous node in the
    /// block, or the last nodes of (transitive, possibly empty)
    /// predecessor blocks.
    pub fn node_predecessors(&self, id: RwNodeId) -> Vec<RwNodeId> {
        let Some(block) = self.nodes[id.index()].block else {
            return Vec::new();
        };
        let nodes = &self.blocks[block.index()].nodes;
        let pos = nodes.iter().position(|&n| n == id);
        if let Some(pos) = pos {
            if pos > 0 {
                return vec![nodes[pos - 1]];
            }
        }
        self.last_nodes_before(block)
    }

    /// Last nodes of the predecessor closure of `block`, skipping empty
    /// blocks.
    fn last_nodes_before(&self, block: RwBlockId) -> Vec<RwNodeId> {
        let mut result = Vec::new();
        let mut visited = FxHashSet::default();
        let mut stack: Vec<RwBlockId> =
            self.blocks[block.index()].predecessors.clone();
        while let Some(pred) = stack.pop() {
            if !visited.insert(pred) {
                continue;
            }
            match self.blocks[pred.index()].last() {
                Some(last) => result.push(last),
                None => stack.extend(self.blocks[pred.index()].predecessors.iter().copied()),
            }
        }
        result.sort_unstable();
        result
    }

    /// CFG successors at node granularity.
    pub fn node_successors(&self, id: RwNodeId) -> Vec<RwNodeId> {
        let Some(block) = self.nodes[id.index()].block else {
            return Vec::new();
        };
        let nodes = &self.blocks[block.index()].nodes;
        let pos = nodes.iter().position(|&n| n == id);
        if let Some(pos) = pos {
            if pos + 1 < nodes.len() {
                return vec![nodes[pos + 1]];
            }
        }
        let mut result = Vec::new();
        let mut visited = FxHashSet::default();
        let mut stack: Vec<RwBlockId> = self.blocks[block.index()].successors.clone();
        while let Some(succ) = stack.pop() {
            if !visited.insert(succ) {
                continue;
            }
            match self.blocks[succ.index()].first() {
                Some(first) => result.push(first),
                None => stack.extend(self.blocks[succ.index()].successors.iter().copied()),
            }
        }
        result.sort_unstable();
        result
    }

    /// Drop no-op nodes that carry no def/use annotations from the block
    /// sequences. The arena entries stay; ids remain valid.
    pub fn remove_useless_nodes(&mut self) {
        let useless: FxHashSet<RwNodeId> = self
            .node_ids()
            .filter(|&id| {
                let node = self.node(id);
                matches!(node.kind, RwNodeKind::Noop)
                    && !node.defines_memory()
                    && !node.is_use()
            })
            .collect();
        if useless.is_empty() {
            return;
        }
        for block in &mut self.blocks {
            block.nodes.retain(|n| !useless.contains(n));
        }
    }

    /// Reject graphs the analyses must not run on.
    pub fn validate(&self) -> AnalysisResult<()> {
        let entry = match self.entry {
            Some(e) => e,
            None => malformed!("read-write graph has no entry subgraph"),
        };
        if self.subgraph(entry).entry.is_none() {
            malformed!(
                "entry subgraph '{}' has no entry block",
                self.subgraph(entry).name
            );
        }
        for sg in self.subgraph_ids() {
            if self.subgraph(sg).entry.is_none() {
                malformed!("subgraph '{}' has no entry block", self.subgraph(sg).name);
            }
        }
        for id in self.node_ids() {
            let node = self.node(id);
            if let Some(info) = node.call_info() {
                if !info.callees.is_empty() && node.paired.is_none() {
                    malformed!("call node {} with callees has no call-return", id.0);
                }
                for &callee in &info.callees {
                    if callee.index() >= self.subgraphs.len() {
                        malformed!("call node {} references missing subgraph", id.0);
                    }
                }
            }
            for site in node.all_defs().chain(node.uses.iter()) {
                if site.target.index() >= self.nodes.len() {
                    malformed!("node {} references missing def-site target", id.0);
                }
            }
        }
        Ok(())
    }
}
