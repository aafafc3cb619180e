//! Memory-SSA scenarios over hand-annotated read–write graphs.

use crate::analysis_tests::init_logging;
use crate::offset::Offset;
use crate::options::DataDependenceOptions;
use crate::rwgraph::{
    DefSite, MemAccess, ReadWriteGraph, RwAllocInfo, RwBlockId, RwNodeId, RwNodeKind,
    RwSubgraphId,
};
use crate::ssa::MemorySsa;

/// A read–write graph under construction with direct def-site annotation.
pub(crate) struct RwProgram {
    pub graph: ReadWriteGraph,
    pub sg: RwSubgraphId,
}

impl RwProgram {
    pub fn new() -> (RwProgram, RwBlockId) {
        let mut graph = ReadWriteGraph::new();
        let sg = graph.add_subgraph("main");
        let block = graph.add_block(sg);
        graph.set_entry(sg);
        (RwProgram { graph, sg }, block)
    }

    pub fn block(&mut self) -> RwBlockId {
        self.graph.add_block(self.sg)
    }

    pub fn alloc(&mut self, block: RwBlockId) -> RwNodeId {
        let id = self.graph.add_node(RwNodeKind::Alloc(RwAllocInfo::default()));
        self.graph.append(block, id);
        id
    }

    pub fn heap_alloc(&mut self, block: RwBlockId) -> RwNodeId {
        let id = self.graph.add_node(RwNodeKind::DynAlloc(RwAllocInfo {
            is_heap: true,
            is_global: false,
        }));
        self.graph.append(block, id);
        id
    }

    pub fn store(
        &mut self,
        block: RwBlockId,
        target: RwNodeId,
        off: u64,
        len: u64,
        strong: bool,
    ) -> RwNodeId {
        let id = self.graph.add_node(RwNodeKind::Store(MemAccess {
            pointer: None,
            length: Offset(len),
        }));
        self.graph
            .node_mut(id)
            .add_def(DefSite::new(target, Offset(off), Offset(len)), strong);
        self.graph.append(block, id);
        id
    }

    pub fn load(&mut self, block: RwBlockId, target: RwNodeId, off: u64, len: u64) -> RwNodeId {
        let id = self.graph.add_node(RwNodeKind::Load(MemAccess {
            pointer: None,
            length: Offset(len),
        }));
        self.graph
            .node_mut(id)
            .add_use(DefSite::new(target, Offset(off), Offset(len)));
        self.graph.append(block, id);
        id
    }

    pub fn ssa(self, opts: DataDependenceOptions) -> MemorySsa {
        let mut ssa = MemorySsa::new(self.graph, opts).unwrap();
        ssa.run();
        ssa
    }
}

#[test]
fn strong_update_hides_unrelated_targets() {
    init_logging();
    // a = alloc; b = alloc; *a = 1; *b = 2; r = *a
    let (mut p, b0) = RwProgram::new();
    let a = p.alloc(b0);
    let b = p.alloc(b0);
    let store_a = p.store(b0, a, 0, 4, true);
    let _store_b = p.store(b0, b, 0, 4, true);
    let r = p.load(b0, a, 0, 4);

    let mut ssa = p.ssa(DataDependenceOptions::default());
    assert_eq!(ssa.definitions_of(r), vec![store_a]);
}

#[test]
fn heap_writes_accumulate_weakly() {
    init_logging();
    // both pointers alias one summarised heap site; neither store kills
    let (mut p, b0) = RwProgram::new();
    let h = p.heap_alloc(b0);
    let s1 = p.store(b0, h, 0, 4, false);
    let s2 = p.store(b0, h, 0, 4, false);
    let r = p.load(b0, h, 0, 4);

    let mut ssa = p.ssa(DataDependenceOptions::default());
    assert_eq!(ssa.definitions_of(r), vec![s1, s2]);
}

#[test]
fn diamond_join_synthesises_a_phi() {
    init_logging();
    let (mut p, b0) = RwProgram::new();
    let g = p.alloc(b0);
    let _s0 = p.store(b0, g, 0, 4, true);
    let b1 = p.block();
    let b2 = p.block();
    let b3 = p.block();
    p.graph.add_block_edge(b0, b1);
    p.graph.add_block_edge(b0, b2);
    p.graph.add_block_edge(b1, b3);
    p.graph.add_block_edge(b2, b3);
    let s1 = p.store(b1, g, 0, 4, true);
    let s2 = p.store(b2, g, 0, 4, true);
    let r = p.load(b3, g, 0, 4);

    let mut ssa = p.ssa(DataDependenceOptions::default());
    let defs = ssa.definitions_of(r);
    assert_eq!(defs.len(), 1);
    let phi = defs[0];
    assert!(matches!(ssa.graph().node(phi).kind, RwNodeKind::Phi));
    assert_eq!(ssa.graph().node(phi).defuse(), &[s1, s2]);
    // the phi lives at the head of the join block
    assert_eq!(ssa.graph().block(b3).first(), Some(phi));

    // idempotence: a second query returns the same set
    assert_eq!(ssa.definitions_of(r), defs);
}

#[test]
fn single_definer_joins_elide_the_phi() {
    init_logging();
    // both branches are empty, the only definer is above the split
    let (mut p, b0) = RwProgram::new();
    let g = p.alloc(b0);
    let s0 = p.store(b0, g, 0, 4, true);
    let b1 = p.block();
    let b2 = p.block();
    let b3 = p.block();
    p.graph.add_block_edge(b0, b1);
    p.graph.add_block_edge(b0, b2);
    p.graph.add_block_edge(b1, b3);
    p.graph.add_block_edge(b2, b3);
    let r = p.load(b3, g, 0, 4);

    let mut ssa = p.ssa(DataDependenceOptions::default());
    assert_eq!(ssa.definitions_of(r), vec![s0]);
    assert!(ssa.phis().is_empty());
}

#[test]
fn loop_phi_joins_preloop_and_body_definers() {
    init_logging();
    // b0 -> b1 <-> b2, b1 -> b3; the load in the body sees the phi
    let (mut p, b0) = RwProgram::new();
    let g = p.alloc(b0);
    let s0 = p.store(b0, g, 0, 4, true);
    let b1 = p.block();
    let b2 = p.block();
    let b3 = p.block();
    p.graph.add_block_edge(b0, b1);
    p.graph.add_block_edge(b1, b2);
    p.graph.add_block_edge(b2, b1);
    p.graph.add_block_edge(b1, b3);
    let r = p.load(b2, g, 0, 4);
    let s2 = p.store(b2, g, 0, 4, false);

    let mut ssa = p.ssa(DataDependenceOptions::default());
    let defs = ssa.definitions_of(r);
    assert_eq!(defs.len(), 1);
    let phi = defs[0];
    assert!(matches!(ssa.graph().node(phi).kind, RwNodeKind::Phi));
    assert_eq!(ssa.graph().node(phi).defuse(), &[s0, s2]);
}

#[test]
fn partial_overwrite_splits_the_interval() {
    init_logging();
    // wide weak write, then a strong write of the middle bytes
    let (mut p, b0) = RwProgram::new();
    let g = p.alloc(b0);
    let wide = p.store(b0, g, 0, 16, false);
    let mid = p.store(b0, g, 4, 4, true);
    let r_mid = p.load(b0, g, 4, 4);
    let r_head = p.load(b0, g, 0, 4);
    let r_all = p.load(b0, g, 0, 16);

    let mut ssa = p.ssa(DataDependenceOptions::default());
    assert_eq!(ssa.definitions_of(r_mid), vec![mid]);
    assert_eq!(ssa.definitions_of(r_head), vec![wide]);
    assert_eq!(ssa.definitions_of(r_all), vec![wide, mid]);
}

#[test]
fn mutually_recursive_callees_summarise_to_a_closure() {
    init_logging();
    let mut graph = ReadWriteGraph::new();
    let main = graph.add_subgraph("main");
    let f = graph.add_subgraph("f");
    let g = graph.add_subgraph("g");
    graph.set_entry(main);

    let bm = graph.add_block(main);
    let global = graph.add_node(RwNodeKind::Alloc(RwAllocInfo {
        is_heap: false,
        is_global: true,
    }));
    graph.append(bm, global);

    // f: store, call g, return
    let bf = graph.add_block(f);
    let store_f = graph.add_node(RwNodeKind::Store(MemAccess {
        pointer: None,
        length: Offset(4),
    }));
    graph
        .node_mut(store_f)
        .add_def(DefSite::new(global, Offset(0), Offset(4)), true);
    graph.append(bf, store_f);
    let call_g = graph.add_node(RwNodeKind::Call(crate::rwgraph::CallInfo {
        callees: vec![g],
        callee_name: None,
        args: Vec::new(),
    }));
    let call_g_ret = graph.add_node(RwNodeKind::CallReturn);
    graph.pair(call_g, call_g_ret);
    graph.append(bf, call_g);
    graph.append(bf, call_g_ret);
    let ret_f = graph.add_node(RwNodeKind::Return);
    graph.append(bf, ret_f);

    // g: store, call f, return
    let bg = graph.add_block(g);
    let store_g = graph.add_node(RwNodeKind::Store(MemAccess {
        pointer: None,
        length: Offset(4),
    }));
    graph
        .node_mut(store_g)
        .add_def(DefSite::new(global, Offset(0), Offset(4)), true);
    graph.append(bg, store_g);
    let call_f_inner = graph.add_node(RwNodeKind::Call(crate::rwgraph::CallInfo {
        callees: vec![f],
        callee_name: None,
        args: Vec::new(),
    }));
    let call_f_inner_ret = graph.add_node(RwNodeKind::CallReturn);
    graph.pair(call_f_inner, call_f_inner_ret);
    graph.append(bg, call_f_inner);
    graph.append(bg, call_f_inner_ret);
    let ret_g = graph.add_node(RwNodeKind::Return);
    graph.append(bg, ret_g);

    // main: call f, then read the global
    let call_f = graph.add_node(RwNodeKind::Call(crate::rwgraph::CallInfo {
        callees: vec![f],
        callee_name: None,
        args: Vec::new(),
    }));
    let call_f_ret = graph.add_node(RwNodeKind::CallReturn);
    graph.pair(call_f, call_f_ret);
    graph.append(bm, call_f);
    graph.append(bm, call_f_ret);
    let r = graph.add_node(RwNodeKind::Load(MemAccess {
        pointer: None,
        length: Offset(4),
    }));
    graph
        .node_mut(r)
        .add_use(DefSite::new(global, Offset(0), Offset(4)));
    graph.append(bm, r);

    let mut ssa = MemorySsa::new(graph, DataDependenceOptions::default()).unwrap();
    ssa.run();
    assert_eq!(ssa.definitions_of(r), vec![store_f, store_g]);
}

#[test]
fn definer_sets_collapse_at_the_cap() {
    init_logging();
    let (mut p, b0) = RwProgram::new();
    let h = p.heap_alloc(b0);
    p.store(b0, h, 0, 4, false);
    p.store(b0, h, 0, 4, false);
    let r = p.load(b0, h, 0, 4);

    let mut ssa = p.ssa(DataDependenceOptions::default().with_max_set_size(Offset(1)));
    assert_eq!(ssa.definitions_of(r), vec![RwNodeId::UNKNOWN_MEMORY]);
}

#[test]
fn field_insensitive_queries_widen_to_unknown_offsets() {
    init_logging();
    let (mut p, b0) = RwProgram::new();
    let g = p.alloc(b0);
    let s = p.store(b0, g, 0, 4, true);
    let r = p.load(b0, g, 8, 4); // disjoint bytes

    let mut ssa = p.ssa(DataDependenceOptions::default().with_field_insensitive(true));
    // the widened probe overlaps the store despite the disjoint ranges
    let defs = ssa.definitions_at(r, g, Offset(8), Offset(4));
    assert!(defs.contains(&s));
}

#[test]
fn reads_of_uninitialised_memory_reach_unknown_memory() {
    init_logging();
    let (mut p, b0) = RwProgram::new();
    let g = p.alloc(b0);
    let r = p.load(b0, g, 0, 4);

    let mut ssa = p.ssa(DataDependenceOptions::default());
    assert_eq!(ssa.definitions_of(r), vec![RwNodeId::UNKNOWN_MEMORY]);
}

#[test]
fn unknown_memory_uses_gather_every_reaching_definition() {
    init_logging();
    let (mut p, b0) = RwProgram::new();
    let a = p.alloc(b0);
    let b = p.alloc(b0);
    let s1 = p.store(b0, a, 0, 4, true);
    let s2 = p.store(b0, b, 0, 4, true);
    let r = {
        let id = p.graph.add_node(RwNodeKind::Load(MemAccess {
            pointer: None,
            length: Offset::UNKNOWN,
        }));
        p.graph.node_mut(id).add_use(DefSite::unknown_memory());
        p.graph.append(b0, id);
        id
    };

    let mut ssa = p.ssa(DataDependenceOptions::default());
    let defs = ssa.definitions_of(r);
    assert!(defs.contains(&s1));
    assert!(defs.contains(&s2));
}

#[test]
fn the_entry_subgraph_can_be_selected_by_name() {
    init_logging();
    let mut graph = ReadWriteGraph::new();
    let sg = graph.add_subgraph("start");
    graph.add_block(sg);
    // no explicit entry and no subgraph called "main"
    assert!(MemorySsa::new(graph, DataDependenceOptions::default()).is_err());

    let mut graph = ReadWriteGraph::new();
    let sg = graph.add_subgraph("start");
    graph.add_block(sg);
    let ssa = MemorySsa::new(
        graph,
        DataDependenceOptions::default().with_entry_function("start"),
    )
    .unwrap();
    assert_eq!(ssa.graph().entry(), Some(sg));
}

#[test]
fn definitions_at_probes_without_disturbing_results() {
    init_logging();
    let (mut p, b0) = RwProgram::new();
    let g = p.alloc(b0);
    let s = p.store(b0, g, 0, 4, true);
    let r = p.load(b0, g, 0, 4);

    let mut ssa = p.ssa(DataDependenceOptions::default());
    assert_eq!(ssa.definitions_at(r, g, Offset(0), Offset(4)), vec![s]);
    // the probe is cached and the real use still resolves identically
    assert_eq!(ssa.definitions_at(r, g, Offset(0), Offset(4)), vec![s]);
    assert_eq!(ssa.definitions_of(r), vec![s]);
}
