//! The pointer analysis solver: a worklist fixpoint over the pointer
//! subgraph.
//!
//! ## Algorithm overview
//!
//! A FIFO worklist is seeded with every node. Processing a node applies its
//! transfer function; when a points-to set or a memory object changes, the
//! nodes that consume the changed state are re-enqueued:
//!
//! - value changes re-enqueue the nodes using this node as an operand,
//! - memory changes re-enqueue the registered readers of the touched
//!   allocation targets,
//! - flow-sensitive map changes re-enqueue control-flow successors.
//!
//! Points-to sets only grow and the abstract domain is finite, so the
//! fixpoint terminates.

use std::collections::{BTreeSet, VecDeque};

use crate::diagnostics::{AnalysisResult, DiagnosticSink, ErrorKind, LogSink, OnceReporter};
use crate::offset::Offset;
use crate::options::PointerAnalysisOptions;
use crate::pointer::graph::{PointerGraph, PsNodeId, PsNodeKind, PsSubgraphId};
use crate::pointer::memory::{MemoryObject, MemoryObjectId, MemoryStore};
use crate::pointer::{Pointer, PointsToSet};

/// Invoked when an indirect call resolves to a new function target; may
/// extend the graph (returning true) to connect the callee.
pub type FunctionPointerCallback =
    Box<dyn FnMut(&mut PointerGraph, PsNodeId, PsNodeId) -> bool>;

#[derive(Debug, Default)]
struct Effects {
    value_changed: bool,
    /// Allocation targets whose memory objects were written.
    touched_memory: Vec<PsNodeId>,
    /// The node's flow-sensitive map gained entries.
    map_changed: bool,
    graph_extended: bool,
}

/// Flow- and field-sensitive inclusion-based pointer analysis.
pub struct PointerAnalysis {
    graph: PointerGraph,
    opts: PointerAnalysisOptions,
    mem: MemoryStore,
    queue: VecDeque<PsNodeId>,
    queued: Vec<bool>,
    /// Reverse operand index: node -> nodes using it as an operand.
    users: Vec<Vec<PsNodeId>>,
    sink: Box<dyn DiagnosticSink>,
    reported: OnceReporter,
    on_funcptr: Option<FunctionPointerCallback>,
}

impl std::fmt::Debug for PointerAnalysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointerAnalysis")
            .field("graph", &self.graph)
            .field("opts", &self.opts)
            .field("mem", &self.mem)
            .field("queue", &self.queue)
            .field("queued", &self.queued)
            .field("users", &self.users)
            .field("reported", &self.reported)
            .finish_non_exhaustive()
    }
}

impl PointerAnalysis {
    /// Validates the graph and prepares the solver. Malformed graphs are
    /// refused here; `run` itself cannot fail.
    pub fn new(graph: PointerGraph, opts: PointerAnalysisOptions) -> AnalysisResult<PointerAnalysis> {
        graph.validate()?;
        let node_count = graph.node_count();
        let mem = MemoryStore::new(opts.is_flow_sensitive(), node_count);
        let mut analysis = PointerAnalysis {
            graph,
            opts,
            mem,
            queue: VecDeque::new(),
            queued: vec![false; node_count],
            users: Vec::new(),
            sink: Box::new(LogSink),
            reported: OnceReporter::default(),
            on_funcptr: None,
        };
        analysis.rebuild_users();
        Ok(analysis)
    }

    pub fn with_sink(mut self, sink: Box<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_function_pointer_callback(mut self, callback: FunctionPointerCallback) -> Self {
        self.on_funcptr = Some(callback);
        self
    }

    pub fn graph(&self) -> &PointerGraph {
        &self.graph
    }

    pub fn options(&self) -> &PointerAnalysisOptions {
        &self.opts
    }

    /// The points-to set computed for `node`.
    pub fn points_to(&self, node: PsNodeId) -> &PointsToSet {
        &self.graph.node(node).points_to
    }

    /// Memory objects visible for `ptr` at `at` (read-only query).
    pub fn memory_objects(&self, at: PsNodeId, ptr: Pointer) -> Vec<&MemoryObject> {
        self.mem
            .peek_objects(at, ptr)
            .into_iter()
            .map(|id| self.mem.object(id))
            .collect()
    }

    /// Allocation sites whose address is stored somewhere in memory.
    ///
    /// Used by downstream consumers to decide which locals may escape the
    /// function that allocated them.
    pub fn escaped_allocations(&self) -> BTreeSet<PsNodeId> {
        let mut escaped = BTreeSet::new();
        for obj in self.mem.all_objects() {
            for (_, set) in obj.entries() {
                for ptr in set.iter() {
                    if ptr.is_valid() && self.graph.node(ptr.target).is_allocation() {
                        escaped.insert(ptr.target);
                    }
                }
            }
        }
        escaped
    }

    /// All allocation targets transitively reachable by loading from the
    /// given roots.
    pub fn pointed_memory_closure(
        &self,
        roots: impl IntoIterator<Item = PsNodeId>,
    ) -> BTreeSet<PsNodeId> {
        let mut closure: BTreeSet<PsNodeId> = BTreeSet::new();
        let mut worklist: Vec<PsNodeId> = roots.into_iter().collect();
        while let Some(target) = worklist.pop() {
            if !closure.insert(target) {
                continue;
            }
            for obj in self.mem.all_objects().filter(|o| o.target == target) {
                for (_, set) in obj.entries() {
                    for ptr in set.iter() {
                        if ptr.is_valid() && !closure.contains(&ptr.target) {
                            worklist.push(ptr.target);
                        }
                    }
                }
            }
        }
        closure
    }

    /// Run the worklist to fixpoint.
    pub fn run(&mut self) {
        for id in self.graph.node_ids().collect::<Vec<_>>() {
            self.enqueue(id);
        }
        while let Some(n) = self.queue.pop_front() {
            self.queued[n.0 as usize] = false;
            let effects = self.process(n);
            self.apply_effects(n, effects);
        }
    }

    fn enqueue(&mut self, n: PsNodeId) {
        let idx = n.0 as usize;
        if !self.queued[idx] {
            self.queued[idx] = true;
            self.queue.push_back(n);
        }
    }

    fn apply_effects(&mut self, n: PsNodeId, effects: Effects) {
        if effects.graph_extended {
            self.grow_tables();
        }
        if effects.value_changed {
            let users = self.users[n.0 as usize].clone();
            for u in users {
                self.enqueue(u);
            }
            // the paired call-return re-reads an indirect call's pointers
            if let Some(paired) = self.graph.node(n).paired() {
                self.enqueue(paired);
            }
        }
        if !effects.touched_memory.is_empty() || effects.map_changed {
            for target in &effects.touched_memory {
                let readers: Vec<PsNodeId> = self.mem.readers_of(*target).collect();
                for r in readers {
                    self.enqueue(r);
                }
            }
            let succs = self.graph.node(n).successors().to_vec();
            for s in succs {
                self.enqueue(s);
            }
        }
        // a transfer that reads the node's own map must observe the merge
        if effects.map_changed {
            self.enqueue(n);
        }
    }

    fn grow_tables(&mut self) {
        let count = self.graph.node_count();
        self.mem.ensure_node_capacity(count);
        while self.queued.len() < count {
            let id = PsNodeId(self.queued.len() as u32);
            self.queued.push(false);
            self.enqueue(id);
        }
        self.rebuild_users();
    }

    fn rebuild_users(&mut self) {
        let count = self.graph.node_count();
        let mut users = vec![Vec::new(); count];
        for id in self.graph.node_ids() {
            for &op in self.graph.node(id).operands() {
                users[op.0 as usize].push(id);
            }
        }
        self.users = users;
    }

    fn points_to_of_operand(&self, n: PsNodeId, i: usize) -> PointsToSet {
        match self.graph.node(n).operand(i) {
            Some(op) => self.graph.node(op).points_to.clone(),
            None => PointsToSet::new(),
        }
    }

    fn process(&mut self, n: PsNodeId) -> Effects {
        let mut effects = Effects::default();
        let kind = self.graph.node(n).kind.clone();

        if self.mem.is_flow_sensitive() {
            self.flow_sensitive_prepare(n, &kind);
        }

        match kind {
            PsNodeKind::Load => self.process_load(n, &mut effects),
            PsNodeKind::Store => self.process_store(n, &mut effects),
            PsNodeKind::Gep { offset } => self.process_gep(n, offset, &mut effects),
            PsNodeKind::Cast => {
                let pts = self.points_to_of_operand(n, 0);
                effects.value_changed |= self.graph.node_mut(n).points_to.merge(&pts);
            }
            PsNodeKind::Phi | PsNodeKind::Return => {
                self.merge_operands(n, &mut effects);
            }
            PsNodeKind::CallReturn => {
                if self.opts.track_invalidations {
                    self.invalidate_returned_locals(n, &mut effects);
                }
                self.merge_operands(n, &mut effects);
            }
            PsNodeKind::CallFuncPtr => self.process_funcptr_call(n, &mut effects),
            PsNodeKind::Memcpy { src_offset, len } => {
                self.process_memcpy(n, src_offset, len, &mut effects);
            }
            PsNodeKind::Free | PsNodeKind::InvalidateObject => {
                if self.opts.track_invalidations {
                    self.process_free(n, &mut effects);
                }
            }
            PsNodeKind::InvalidateLocals => {
                if self.opts.track_invalidations {
                    self.process_invalidate_locals(n, &mut effects);
                }
            }
            // allocations point to themselves by construction; constants
            // are initialised at construction; the rest carry no transfer
            PsNodeKind::Alloc(_)
            | PsNodeKind::DynAlloc(_)
            | PsNodeKind::Function
            | PsNodeKind::Constant
            | PsNodeKind::Call
            | PsNodeKind::Entry
            | PsNodeKind::Noop
            | PsNodeKind::NullAddr
            | PsNodeKind::UnknownMemory
            | PsNodeKind::Invalidated => {}
        }

        if self.mem.is_flow_sensitive() {
            self.flow_sensitive_finish(n, &kind, &mut effects);
        }

        effects
    }

    fn flow_sensitive_prepare(&mut self, n: PsNodeId, kind: &PsNodeKind) {
        let preds = self.graph.node(n).predecessors().to_vec();
        let fresh_targets = match kind {
            PsNodeKind::Store | PsNodeKind::Memcpy { .. } => {
                Some(self.points_to_of_operand(n, 1))
            }
            _ => None,
        };
        let force_own = self.opts.track_invalidations
            && matches!(
                kind,
                PsNodeKind::Free | PsNodeKind::InvalidateObject | PsNodeKind::InvalidateLocals
            );
        self.mem.fs_prepare(n, &preds, fresh_targets.as_ref(), force_own);
    }

    fn flow_sensitive_finish(&mut self, n: PsNodeId, kind: &PsNodeKind, effects: &mut Effects) {
        let preds = self.graph.node(n).predecessors().to_vec();
        // Strong update: only a store through a must pointer to a non-heap
        // target may shadow the incoming state for that pointer.
        let strong_update = match kind {
            PsNodeKind::Store => self.strong_update_pointer(n),
            _ => None,
        };
        let outcome = self.mem.fs_merge_preds(n, &preds, strong_update);
        if outcome.changed {
            effects.map_changed = true;
            effects.touched_memory.extend(outcome.new_targets);
        }
    }

    fn strong_update_pointer(&self, store: PsNodeId) -> Option<Pointer> {
        let dst = self.graph.node(store).operand(1)?;
        let ptr = self.graph.node(dst).points_to.single_pointer()?;
        if !ptr.is_valid() || self.graph.node(ptr.target).is_heap_allocation() {
            return None;
        }
        Some(ptr)
    }

    fn merge_operands(&mut self, n: PsNodeId, effects: &mut Effects) {
        let ops = self.graph.node(n).operands().to_vec();
        let mut gathered = PointsToSet::new();
        for op in ops {
            gathered.merge(&self.graph.node(op).points_to);
        }
        effects.value_changed |= self.graph.node_mut(n).points_to.merge(&gathered);
    }

    /// With invalidations enabled, a callee returning the address of its own
    /// stack memory yields an invalidated pointer at the call return.
    fn invalidate_returned_locals(&mut self, n: PsNodeId, effects: &mut Effects) {
        let ops = self.graph.node(n).operands().to_vec();
        let mut add_invalidated = false;
        for op in ops {
            let op_parent = self.graph.node(op).parent();
            for ptr in self.graph.node(op).points_to.iter() {
                if !ptr.is_valid() {
                    continue;
                }
                let target = self.graph.node(ptr.target);
                if let Some(info) = target.alloc_info() {
                    if !info.is_heap && !info.is_global && target.parent() == op_parent {
                        add_invalidated = true;
                    }
                }
            }
        }
        if add_invalidated {
            effects.value_changed |= self
                .graph
                .node_mut(n)
                .points_to
                .add(Pointer::invalidated());
        }
    }

    fn process_load(&mut self, n: PsNodeId, effects: &mut Effects) {
        let operand_pts = self.points_to_of_operand(n, 0);
        if operand_pts.is_empty() {
            self.report_once(n, ErrorKind::UnsoundFallback, "load from empty points-to set");
            effects.value_changed |= self.graph.node_mut(n).points_to.add(Pointer::unknown());
            return;
        }

        let mut gathered = PointsToSet::new();
        for ptr in operand_pts.iter() {
            if ptr.is_null() {
                continue;
            }
            if ptr.is_unknown() {
                gathered.add(Pointer::unknown());
                continue;
            }
            if ptr.is_invalidated() {
                self.report_once(n, ErrorKind::UnsoundFallback, "load from invalidated memory");
                gathered.add(Pointer::unknown());
                continue;
            }

            let zeroed = self.graph.node(ptr.target).zero_initialized();
            let objects = self.mem.objects_at(n, ptr);
            if objects.is_empty() {
                self.load_fallback(n, zeroed, &mut gathered);
                continue;
            }
            for obj_id in objects {
                self.read_object(n, obj_id, ptr.offset, zeroed, &mut gathered);
            }
        }
        effects.value_changed |= self.graph.node_mut(n).points_to.merge(&gathered);
    }

    fn read_object(
        &mut self,
        n: PsNodeId,
        obj_id: MemoryObjectId,
        offset: Offset,
        zeroed: bool,
        gathered: &mut PointsToSet,
    ) {
        let obj = self.mem.object(obj_id);
        if offset.is_unknown() {
            // any offset can be referenced
            if obj.is_empty() {
                let fallback = if zeroed {
                    Pointer::null()
                } else {
                    Pointer::unknown()
                };
                gathered.add(fallback);
                if !zeroed {
                    self.report_once(n, ErrorKind::UnsoundFallback, "load from empty memory");
                }
                return;
            }
            let sets: Vec<PointsToSet> = obj.entries().map(|(_, s)| s.clone()).collect();
            for set in sets {
                gathered.merge(&set);
            }
            return;
        }

        let at_offset = obj.at(offset).cloned();
        let at_unknown = obj.at(Offset::UNKNOWN).cloned();
        match at_offset {
            Some(set) => {
                gathered.merge(&set);
            }
            None => {
                if zeroed {
                    gathered.add(Pointer::null());
                } else if at_unknown.is_none() {
                    self.report_once(n, ErrorKind::UnsoundFallback, "load from undefined offset");
                    gathered.add(Pointer::unknown());
                }
            }
        }
        // pointers stored at the unknown offset can always be what we read
        if let Some(set) = at_unknown {
            gathered.merge(&set);
        }
    }

    fn load_fallback(&mut self, n: PsNodeId, zeroed: bool, gathered: &mut PointsToSet) {
        if zeroed {
            gathered.add(Pointer::null());
        } else {
            self.report_once(n, ErrorKind::UnsoundFallback, "load found no memory objects");
            gathered.add(Pointer::unknown());
        }
    }

    fn process_store(&mut self, n: PsNodeId, effects: &mut Effects) {
        let value_pts = self.points_to_of_operand(n, 0);
        let dst_pts = self.points_to_of_operand(n, 1);
        if dst_pts.contains_target(PsNodeId::UNKNOWN_MEMORY) {
            self.report_once(n, ErrorKind::UnsoundFallback, "store through unknown pointer");
        }
        for ptr in dst_pts.iter() {
            if !ptr.is_valid() {
                continue;
            }
            for obj_id in self.mem.objects_at(n, ptr) {
                if self.mem.object_mut(obj_id).add_points_to(ptr.offset, &value_pts) {
                    effects.touched_memory.push(ptr.target);
                }
            }
        }
    }

    fn process_gep(&mut self, n: PsNodeId, delta: Offset, effects: &mut Effects) {
        let src_pts = self.points_to_of_operand(n, 0);
        let mut gathered = PointsToSet::new();
        for ptr in src_pts.iter() {
            let mut new_offset = ptr.offset.saturating_add(delta);
            if let (Some(value), Some(cap)) = (new_offset.value(), self.opts.max_offset.value()) {
                if value >= cap {
                    new_offset = Offset::UNKNOWN;
                }
            }
            // past-the-end arithmetic on a known-size allocation degrades
            // to the unknown offset (offset 0 always stays precise)
            if let Some(info) = self.graph.node(ptr.target).alloc_info() {
                if let (Some(value), Some(size)) = (new_offset.value(), info.size.value()) {
                    if value != 0 && value >= size {
                        new_offset = Offset::UNKNOWN;
                    }
                }
            }
            gathered.add(Pointer::new(ptr.target, new_offset));
        }
        effects.value_changed |= self.graph.node_mut(n).points_to.merge(&gathered);
    }

    fn process_funcptr_call(&mut self, n: PsNodeId, effects: &mut Effects) {
        let operand_pts = self.points_to_of_operand(n, 0);
        for ptr in operand_pts.iter() {
            if !self.graph.node_mut(n).points_to.add(ptr) {
                continue;
            }
            effects.value_changed = true;
            if !ptr.is_valid() {
                self.report_once(n, ErrorKind::UnsoundFallback, "calling an invalid pointer");
                continue;
            }
            if !matches!(self.graph.node(ptr.target).kind, PsNodeKind::Function) {
                self.report_once(
                    n,
                    ErrorKind::UnsupportedConstruct,
                    "indirect call to a non-function target",
                );
                continue;
            }
            if let Some(callback) = self.on_funcptr.as_mut() {
                if callback(&mut self.graph, n, ptr.target) {
                    effects.graph_extended = true;
                }
            }
        }
    }

    fn process_memcpy(&mut self, n: PsNodeId, src_offset: Offset, len: Offset, effects: &mut Effects) {
        let src_pts = self.points_to_of_operand(n, 0);
        let dst_pts = self.points_to_of_operand(n, 1);

        let mut src_objects = Vec::new();
        for ptr in src_pts.iter() {
            if ptr.is_valid() {
                src_objects.extend(self.mem.objects_at(n, ptr));
            }
        }
        let mut dst_objects = Vec::new();
        for ptr in dst_pts.iter() {
            if ptr.is_valid() {
                dst_objects.extend(self.mem.objects_at(n, ptr).into_iter().map(|o| (o, ptr.target)));
            }
        }
        if src_objects.is_empty() && !src_pts.is_empty() {
            self.report_once(n, ErrorKind::UnsoundFallback, "memcpy source has no memory");
        }

        let end = src_offset.saturating_add(len);
        for src in src_objects {
            let entries: Vec<(Offset, PointsToSet)> = self
                .mem
                .object(src)
                .entries()
                .map(|(off, set)| (off, set.clone()))
                .collect();
            for (off, set) in entries {
                let copied = if off.is_unknown() || src_offset.is_unknown() {
                    true
                } else if len.is_unknown() {
                    off >= src_offset
                } else {
                    off.in_range(src_offset, end)
                };
                if !copied {
                    continue;
                }
                for &(dst, target) in &dst_objects {
                    if self.mem.object_mut(dst).add_points_to(off, &set) {
                        effects.touched_memory.push(target);
                    }
                }
            }
        }
    }

    fn process_free(&mut self, n: PsNodeId, effects: &mut Effects) {
        let operand_pts = self.points_to_of_operand(n, 0);
        for ptr in operand_pts.iter() {
            if !ptr.is_valid() {
                continue;
            }
            for obj_id in self.mem.objects_at(n, ptr) {
                if self
                    .mem
                    .object_mut(obj_id)
                    .add_pointer(Offset::UNKNOWN, Pointer::invalidated())
                {
                    effects.touched_memory.push(ptr.target);
                }
            }
        }
    }

    /// Replace pointers to the exiting subgraph's stack allocations with
    /// the invalidated singleton, in every memory object visible here.
    fn process_invalidate_locals(&mut self, n: PsNodeId, effects: &mut Effects) {
        let exiting: Option<PsSubgraphId> = self
            .graph
            .node(n)
            .operand(0)
            .and_then(|ret| self.graph.node(ret).parent());
        let Some(exiting) = exiting else {
            self.report_once(
                n,
                ErrorKind::UnsupportedConstruct,
                "invalidate-locals without an owning subgraph",
            );
            return;
        };

        for obj_id in self.mem.visible_objects(n) {
            let rewrites: Vec<(Offset, PointsToSet)> = {
                let obj = self.mem.object(obj_id);
                obj.entries()
                    .filter(|(_, set)| {
                        set.iter().any(|ptr| self.is_local_pointer(ptr, exiting))
                    })
                    .map(|(off, set)| {
                        let mut rewritten = PointsToSet::new();
                        for ptr in set.iter() {
                            if self.is_local_pointer(ptr, exiting) {
                                rewritten.add(Pointer::invalidated());
                            } else {
                                rewritten.add(ptr);
                            }
                        }
                        (off, rewritten)
                    })
                    .collect()
            };
            if rewrites.is_empty() {
                continue;
            }
            let target = self.mem.object(obj_id).target;
            for (off, set) in rewrites {
                self.mem.object_mut(obj_id).set_points_to(off, set);
            }
            effects.touched_memory.push(target);
        }
    }

    fn is_local_pointer(&self, ptr: Pointer, subgraph: PsSubgraphId) -> bool {
        if !ptr.is_valid() {
            return false;
        }
        let node = self.graph.node(ptr.target);
        match node.alloc_info() {
            Some(info) => {
                !info.is_heap && !info.is_global && node.parent() == Some(subgraph)
            }
            None => false,
        }
    }

    fn report_once(&mut self, node: PsNodeId, kind: ErrorKind, message: &str) {
        self.reported
            .report(self.sink.as_mut(), kind, node.0, &format!("node {}: {message}", node.0));
    }
}
