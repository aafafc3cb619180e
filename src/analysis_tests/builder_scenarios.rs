//! End-to-end pipeline scenarios: pointer subgraph -> pointer analysis ->
//! read-write graph annotation -> data-dependence queries.

use crate::analysis_tests::init_logging;
use crate::diagnostics::CollectingSink;
use crate::offset::Offset;
use crate::options::{DataDependenceEngine, DataDependenceOptions, FunctionModel};
use crate::pointer::{AllocInfo, PointerAnalysis, PointerGraph, PsNodeId, PsNodeKind, PsSubgraphId};
use crate::rwgraph::builder::annotate;
use crate::rwgraph::{
    CallArg, CallInfo, DefSite, MemAccess, ReadWriteGraph, RwAllocInfo, RwNodeId, RwNodeKind,
};
use crate::ssa::MemorySsa;

/// One function with straight-line pointer and read-write graphs built in
/// lockstep.
struct Pipeline {
    ps: PointerGraph,
    sg: PsSubgraphId,
    last: PsNodeId,
    rw: ReadWriteGraph,
    rw_block: crate::rwgraph::RwBlockId,
}

impl Pipeline {
    fn new() -> Pipeline {
        let mut ps = PointerGraph::new();
        let sg = ps.add_subgraph("main");
        let entry = ps.add_node_in(PsNodeKind::Entry, sg);
        ps.set_subgraph_entry(sg, entry);
        ps.set_entry(sg);

        let mut rw = ReadWriteGraph::new();
        let rw_sg = rw.add_subgraph("main");
        let rw_block = rw.add_block(rw_sg);
        rw.set_entry(rw_sg);

        Pipeline {
            ps,
            sg,
            last: entry,
            rw,
            rw_block,
        }
    }

    fn ps_push(&mut self, kind: PsNodeKind) -> PsNodeId {
        let node = self.ps.add_node_in(kind, self.sg);
        self.ps.add_successor(self.last, node);
        self.last = node;
        node
    }

    /// A stack allocation present in both graphs.
    fn alloc(&mut self, size: u64) -> (PsNodeId, RwNodeId) {
        let ps = self.ps_push(PsNodeKind::Alloc(AllocInfo::stack(Offset(size))));
        let rw = self.rw.add_node(RwNodeKind::Alloc(RwAllocInfo::default()));
        self.rw.append(self.rw_block, rw);
        self.rw.map_allocation(ps, rw);
        (ps, rw)
    }

    fn store(&mut self, value: PsNodeId, pointer: PsNodeId, len: u64) -> (PsNodeId, RwNodeId) {
        let ps = self.ps_push(PsNodeKind::Store);
        self.ps.add_operand(ps, value);
        self.ps.add_operand(ps, pointer);
        let rw = self
            .rw
            .add_node(RwNodeKind::Store(MemAccess::new(pointer, Offset(len))));
        self.rw.node_mut(rw).origin = Some(ps);
        self.rw.append(self.rw_block, rw);
        (ps, rw)
    }

    fn load(&mut self, pointer: PsNodeId, len: u64) -> (PsNodeId, RwNodeId) {
        let ps = self.ps_push(PsNodeKind::Load);
        self.ps.add_operand(ps, pointer);
        let rw = self
            .rw
            .add_node(RwNodeKind::Load(MemAccess::new(pointer, Offset(len))));
        self.rw.node_mut(rw).origin = Some(ps);
        self.rw.append(self.rw_block, rw);
        (ps, rw)
    }

    fn run(self, opts: DataDependenceOptions) -> (PointerAnalysis, ReadWriteGraph) {
        let mut pa = PointerAnalysis::new(self.ps, Default::default()).unwrap();
        pa.run();
        let mut rw = self.rw;
        let mut sink = CollectingSink::default();
        annotate(&mut rw, &pa, &opts, &mut sink).unwrap();
        (pa, rw)
    }
}

#[test]
fn the_full_pipeline_resolves_a_store_load_pair() {
    init_logging();
    // p = alloc; store &x into p; q = load p
    let mut pl = Pipeline::new();
    let (p, rw_p) = pl.alloc(8);
    let (x, _rw_x) = pl.alloc(8);
    let (_ps_store, rw_store) = pl.store(x, p, 8);
    let (_ps_load, rw_load) = pl.load(p, 8);

    let (_pa, rw) = pl.run(DataDependenceOptions::default());

    // singleton concrete non-heap pointer: the store is an overwrite
    let store = rw.node(rw_store);
    assert!(store.defs.is_empty());
    assert_eq!(
        store.overwrites.iter().copied().collect::<Vec<_>>(),
        vec![DefSite::new(rw_p, Offset(0), Offset(8))]
    );
    assert_eq!(
        rw.node(rw_load).uses.iter().copied().collect::<Vec<_>>(),
        vec![DefSite::new(rw_p, Offset(0), Offset(8))]
    );

    let mut ssa = MemorySsa::new(rw, DataDependenceOptions::default()).unwrap();
    ssa.run();
    assert_eq!(ssa.definitions_of(rw_load), vec![rw_store]);
}

#[test]
fn modelled_memcpy_defines_the_destination_range() {
    init_logging();
    // store into src+4; memcpy(dst, src, 16); r = load dst+4
    let mut pl = Pipeline::new();
    let (src, rw_src) = pl.alloc(16);
    let (dst, rw_dst) = pl.alloc(16);
    let (x, _) = pl.alloc(8);

    let src4 = pl.ps_push(PsNodeKind::Gep { offset: Offset(4) });
    pl.ps.add_operand(src4, src);
    let (_, rw_store_src) = pl.store(x, src4, 8);

    // the call exists only in the read-write graph; its pointer operands
    // reference the pointer analysis
    let call = pl.rw.add_node(RwNodeKind::Call(CallInfo {
        callees: Vec::new(),
        callee_name: Some("memcpy".to_string()),
        args: vec![
            CallArg::pointer(dst),
            CallArg::pointer(src),
            CallArg::constant(16),
        ],
    }));
    pl.rw.append(pl.rw_block, call);

    let dst4 = pl.ps_push(PsNodeKind::Gep { offset: Offset(4) });
    pl.ps.add_operand(dst4, dst);
    let (_, rw_load) = pl.load(dst4, 8);

    let opts = DataDependenceOptions {
        function_models: FunctionModel::builtin_models(),
        ..Default::default()
    };
    let (_pa, rw) = pl.run(opts.clone());

    let call_node = rw.node(call);
    assert!(call_node
        .defs
        .contains(&DefSite::new(rw_dst, Offset(0), Offset(16))));
    assert!(call_node
        .uses
        .contains(&DefSite::new(rw_src, Offset(0), Offset(16))));

    // the copy is the definer of the read; its own use resolves to the
    // last write into the source before it
    let mut ssa = MemorySsa::new(rw, opts).unwrap();
    ssa.run();
    assert_eq!(ssa.definitions_of(rw_load), vec![call]);
    // the copy's own use leads back to the write into the source
    assert!(ssa.definitions_of(call).contains(&rw_store_src));
}

#[test]
fn unmodeled_calls_default_to_worst_case() {
    init_logging();
    let mut pl = Pipeline::new();
    let (p, rw_p) = pl.alloc(8);
    let call = pl.rw.add_node(RwNodeKind::Call(CallInfo {
        callees: Vec::new(),
        callee_name: Some("mystery".to_string()),
        args: vec![CallArg::pointer(p)],
    }));
    pl.rw.append(pl.rw_block, call);

    let (_pa, rw) = pl.run(DataDependenceOptions::default());
    let node = rw.node(call);
    assert!(node
        .defs
        .contains(&DefSite::new(rw_p, Offset::UNKNOWN, Offset::UNKNOWN)));
    assert!(node.defs.contains(&DefSite::unknown_memory()));
    assert!(node.uses.contains(&DefSite::unknown_memory()));
}

#[test]
fn pure_undefined_calls_have_no_effect() {
    init_logging();
    let mut pl = Pipeline::new();
    let (p, _) = pl.alloc(8);
    let call = pl.rw.add_node(RwNodeKind::Call(CallInfo {
        callees: Vec::new(),
        callee_name: Some("mystery".to_string()),
        args: vec![CallArg::pointer(p)],
    }));
    pl.rw.append(pl.rw_block, call);

    let (_pa, rw) = pl.run(DataDependenceOptions::default().with_undefined_are_pure(true));
    let node = rw.node(call);
    assert!(node.defs.is_empty() && node.uses.is_empty());
}

#[test]
fn field_insensitive_annotation_widens_every_site() {
    init_logging();
    let mut pl = Pipeline::new();
    let (p, rw_p) = pl.alloc(16);
    let p8 = pl.ps_push(PsNodeKind::Gep { offset: Offset(8) });
    pl.ps.add_operand(p8, p);
    let (x, _) = pl.alloc(8);
    let (_, rw_store) = pl.store(x, p8, 4);
    let (_, rw_load) = pl.load(p8, 4);

    let (_pa, rw) = pl.run(DataDependenceOptions::default().with_field_insensitive(true));
    for site in rw.node(rw_store).all_defs().chain(rw.node(rw_load).uses.iter()) {
        assert!(site.offset.is_unknown());
    }
    // widened sites are never strong
    assert!(rw.node(rw_store).overwrites.is_empty());
    let _ = rw_p;
}

#[test]
fn locals_die_at_function_exit() {
    init_logging();
    // callee writes a local and a global; only the global outlives it
    let mut ps = PointerGraph::new();
    let main_sg = ps.add_subgraph("main");
    let f_sg = ps.add_subgraph("f");
    let main_entry = ps.add_node_in(PsNodeKind::Entry, main_sg);
    ps.set_subgraph_entry(main_sg, main_entry);
    ps.set_entry(main_sg);
    let f_entry = ps.add_node_in(PsNodeKind::Entry, f_sg);
    ps.set_subgraph_entry(f_sg, f_entry);

    let global = ps.add_node_in(PsNodeKind::Alloc(AllocInfo::global(Offset(8))), main_sg);
    let local = ps.add_node_in(PsNodeKind::Alloc(AllocInfo::stack(Offset(8))), f_sg);

    let mut rw = ReadWriteGraph::new();
    let rw_main = rw.add_subgraph("main");
    let rw_f = rw.add_subgraph("f");
    rw.set_entry(rw_main);
    let bm = rw.add_block(rw_main);
    let bf = rw.add_block(rw_f);

    let rw_global = rw.add_node(RwNodeKind::Alloc(RwAllocInfo {
        is_heap: false,
        is_global: true,
    }));
    rw.append(bm, rw_global);
    rw.map_allocation(global, rw_global);
    let rw_local = rw.add_node(RwNodeKind::Alloc(RwAllocInfo::default()));
    rw.append(bf, rw_local);
    rw.map_allocation(local, rw_local);

    let store_local = rw.add_node(RwNodeKind::Store(MemAccess::new(local, Offset(4))));
    rw.append(bf, store_local);
    let store_global = rw.add_node(RwNodeKind::Store(MemAccess::new(global, Offset(4))));
    rw.append(bf, store_global);
    let ret = rw.add_node(RwNodeKind::Return);
    rw.append(bf, ret);

    let call = rw.add_node(RwNodeKind::Call(CallInfo {
        callees: vec![rw_f],
        callee_name: None,
        args: Vec::new(),
    }));
    let call_ret = rw.add_node(RwNodeKind::CallReturn);
    rw.pair(call, call_ret);
    rw.append(bm, call);
    rw.append(bm, call_ret);

    let mut pa = PointerAnalysis::new(ps, Default::default()).unwrap();
    pa.run();
    let opts = DataDependenceOptions::default().with_engine(DataDependenceEngine::Rd);
    let mut sink = CollectingSink::default();
    annotate(&mut rw, &pa, &opts, &mut sink).unwrap();

    // the return node kills the local wholesale
    assert!(rw
        .node(ret)
        .overwrites
        .contains(&DefSite::new(rw_local, Offset::UNKNOWN, Offset::UNKNOWN)));

    // dense engine: the call's materialised effect keeps the global,
    // drops the local
    let defs = &rw.node(call).defs;
    assert!(defs.iter().any(|s| s.target == rw_global));
    assert!(!defs.iter().any(|s| s.target == rw_local));
}
