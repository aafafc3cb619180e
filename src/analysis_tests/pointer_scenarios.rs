//! Pointer analysis scenarios over hand-built pointer subgraphs.

use crate::analysis_tests::init_logging;
use crate::diagnostics::{CollectingSink, ErrorKind};
use crate::offset::Offset;
use crate::options::PointerAnalysisOptions;
use crate::pointer::{
    AllocInfo, Pointer, PointerAnalysis, PointerGraph, PsNodeId, PsNodeKind, PsSubgraphId,
};

/// A straight-line subgraph under construction; nodes are chained in
/// creation order.
struct Chain {
    graph: PointerGraph,
    sg: PsSubgraphId,
    last: PsNodeId,
}

impl Chain {
    fn new() -> Chain {
        let mut graph = PointerGraph::new();
        let sg = graph.add_subgraph("main");
        let entry = graph.add_node_in(PsNodeKind::Entry, sg);
        graph.set_subgraph_entry(sg, entry);
        graph.set_entry(sg);
        Chain {
            graph,
            sg,
            last: entry,
        }
    }

    fn push(&mut self, kind: PsNodeKind) -> PsNodeId {
        let node = self.graph.add_node_in(kind, self.sg);
        self.graph.add_successor(self.last, node);
        self.last = node;
        node
    }

    fn alloc(&mut self, size: u64) -> PsNodeId {
        self.push(PsNodeKind::Alloc(AllocInfo::stack(Offset(size))))
    }

    fn store(&mut self, value: PsNodeId, pointer: PsNodeId) -> PsNodeId {
        let store = self.push(PsNodeKind::Store);
        self.graph.add_operand(store, value);
        self.graph.add_operand(store, pointer);
        store
    }

    fn load(&mut self, pointer: PsNodeId) -> PsNodeId {
        let load = self.push(PsNodeKind::Load);
        self.graph.add_operand(load, pointer);
        load
    }

    fn run(self, opts: PointerAnalysisOptions) -> PointerAnalysis {
        let mut pa = PointerAnalysis::new(self.graph, opts).unwrap();
        pa.run();
        pa
    }
}

fn pointers(pa: &PointerAnalysis, node: PsNodeId) -> Vec<Pointer> {
    pa.points_to(node).iter().collect()
}

#[test]
fn store_then_load_yields_stored_pointer() {
    init_logging();
    // p = alloc; store &x into p; q = load p
    for opts in [
        PointerAnalysisOptions::default(),
        PointerAnalysisOptions::default().with_flow_sensitive(true),
    ] {
        let mut c = Chain::new();
        let p = c.alloc(8);
        let x = c.alloc(8);
        c.store(x, p);
        let q = c.load(p);
        let pa = c.run(opts);
        assert_eq!(pointers(&pa, q), vec![Pointer::new(x, Offset(0))]);
    }
}

#[test]
fn branches_merge_at_load() {
    init_logging();
    // if (c) p = &x else p = &y; q = *p
    let mut c = Chain::new();
    let x = c.alloc(8);
    let y = c.alloc(8);
    let p = c.alloc(8);

    let store_x = c.graph.add_node_in(PsNodeKind::Store, c.sg);
    c.graph.add_operand(store_x, x);
    c.graph.add_operand(store_x, p);
    let store_y = c.graph.add_node_in(PsNodeKind::Store, c.sg);
    c.graph.add_operand(store_y, y);
    c.graph.add_operand(store_y, p);
    let q = c.graph.add_node_in(PsNodeKind::Load, c.sg);
    c.graph.add_operand(q, p);

    // diamond: p -> store_x -> q, p -> store_y -> q
    c.graph.add_successor(p, store_x);
    c.graph.add_successor(p, store_y);
    c.graph.add_successor(store_x, q);
    c.graph.add_successor(store_y, q);

    let pa = {
        let mut pa = PointerAnalysis::new(
            c.graph,
            PointerAnalysisOptions::default().with_flow_sensitive(true),
        )
        .unwrap();
        pa.run();
        pa
    };
    assert_eq!(
        pointers(&pa, q),
        vec![Pointer::new(x, Offset(0)), Pointer::new(y, Offset(0))]
    );
}

#[test]
fn flow_sensitive_store_is_a_strong_update() {
    init_logging();
    // *p = &a; *p = &b; q = *p
    let mut c = Chain::new();
    let p = c.alloc(8);
    let a = c.alloc(8);
    let b = c.alloc(8);
    c.store(a, p);
    c.store(b, p);
    let q = c.load(p);
    let pa = c.run(PointerAnalysisOptions::default().with_flow_sensitive(true));
    assert_eq!(pointers(&pa, q), vec![Pointer::new(b, Offset(0))]);

    // flow-insensitive keeps both
    let mut c = Chain::new();
    let p = c.alloc(8);
    let a = c.alloc(8);
    let b = c.alloc(8);
    c.store(a, p);
    c.store(b, p);
    let q = c.load(p);
    let pa = c.run(PointerAnalysisOptions::default());
    assert_eq!(
        pointers(&pa, q),
        vec![Pointer::new(a, Offset(0)), Pointer::new(b, Offset(0))]
    );
}

#[test]
fn heap_targets_are_never_strongly_updated() {
    init_logging();
    let mut c = Chain::new();
    let h = c.push(PsNodeKind::DynAlloc(AllocInfo::heap(Offset(8), false)));
    let p = c.alloc(8);
    c.store(h, p); // p -> heap object
    let a = c.alloc(8);
    let b = c.alloc(8);
    let p1 = c.load(p);
    let s1 = c.push(PsNodeKind::Store);
    c.graph.add_operand(s1, a);
    c.graph.add_operand(s1, p1);
    let p2 = c.load(p);
    let s2 = c.push(PsNodeKind::Store);
    c.graph.add_operand(s2, b);
    c.graph.add_operand(s2, p2);
    let q_ptr = c.load(p);
    let q = c.load(q_ptr);

    let pa = c.run(PointerAnalysisOptions::default().with_flow_sensitive(true));
    let result = pointers(&pa, q);
    assert!(result.contains(&Pointer::new(a, Offset(0))));
    assert!(result.contains(&Pointer::new(b, Offset(0))));
}

#[test]
fn gep_offsets_saturate_and_respect_the_cap() {
    init_logging();
    let mut c = Chain::new();
    let p = c.alloc(16);
    let g1 = c.push(PsNodeKind::Gep { offset: Offset(8) });
    c.graph.add_operand(g1, p);
    let g2 = c.push(PsNodeKind::Gep {
        offset: Offset::UNKNOWN,
    });
    c.graph.add_operand(g2, g1);
    // 8 + 16 walks past the 16-byte allocation
    let g3 = c.push(PsNodeKind::Gep { offset: Offset(16) });
    c.graph.add_operand(g3, g1);

    let pa = c.run(PointerAnalysisOptions::default());
    assert_eq!(pointers(&pa, g1), vec![Pointer::new(p, Offset(8))]);
    assert_eq!(pointers(&pa, g2), vec![Pointer::new(p, Offset::UNKNOWN)]);
    assert_eq!(pointers(&pa, g3), vec![Pointer::new(p, Offset::UNKNOWN)]);

    // with a 4-byte field-sensitivity bound even g1 collapses
    let mut c = Chain::new();
    let p = c.alloc(16);
    let g1 = c.push(PsNodeKind::Gep { offset: Offset(8) });
    c.graph.add_operand(g1, p);
    let pa = c.run(PointerAnalysisOptions::default().with_max_offset(Offset(4)));
    assert_eq!(pointers(&pa, g1), vec![Pointer::new(p, Offset::UNKNOWN)]);
}

#[test]
fn memcpy_copies_the_covered_range() {
    init_logging();
    // store &x into src+4; memcpy(src, dst, 0, 16); r = *(dst+4)
    let mut c = Chain::new();
    let src = c.alloc(16);
    let dst = c.alloc(16);
    let x = c.alloc(8);
    let src4 = c.push(PsNodeKind::Gep { offset: Offset(4) });
    c.graph.add_operand(src4, src);
    let s = c.push(PsNodeKind::Store);
    c.graph.add_operand(s, x);
    c.graph.add_operand(s, src4);
    let cpy = c.push(PsNodeKind::Memcpy {
        src_offset: Offset(0),
        len: Offset(16),
    });
    c.graph.add_operand(cpy, src);
    c.graph.add_operand(cpy, dst);
    let dst4 = c.push(PsNodeKind::Gep { offset: Offset(4) });
    c.graph.add_operand(dst4, dst);
    let r = c.load(dst4);

    let pa = c.run(PointerAnalysisOptions::default());
    assert_eq!(pointers(&pa, r), vec![Pointer::new(x, Offset(0))]);

    // a copy of bytes [8, 16) must not carry the pointer at offset 4
    let mut c = Chain::new();
    let src = c.alloc(16);
    let dst = c.alloc(16);
    let x = c.alloc(8);
    let src4 = c.push(PsNodeKind::Gep { offset: Offset(4) });
    c.graph.add_operand(src4, src);
    let s = c.push(PsNodeKind::Store);
    c.graph.add_operand(s, x);
    c.graph.add_operand(s, src4);
    let cpy = c.push(PsNodeKind::Memcpy {
        src_offset: Offset(8),
        len: Offset(8),
    });
    c.graph.add_operand(cpy, src);
    c.graph.add_operand(cpy, dst);
    let dst4 = c.push(PsNodeKind::Gep { offset: Offset(4) });
    c.graph.add_operand(dst4, dst);
    let r = c.load(dst4);

    let pa = c.run(PointerAnalysisOptions::default());
    assert!(!pointers(&pa, r).contains(&Pointer::new(x, Offset(0))));
}

#[test]
fn free_marks_memory_invalidated() {
    init_logging();
    let mut c = Chain::new();
    let p = c.alloc(8);
    let x = c.alloc(8);
    c.store(x, p);
    let free = c.push(PsNodeKind::Free);
    c.graph.add_operand(free, p);
    let q = c.load(p);

    let pa = c.run(PointerAnalysisOptions::default().with_track_invalidations(true));
    let result = pointers(&pa, q);
    assert!(result.contains(&Pointer::invalidated()));
    assert!(result.contains(&Pointer::new(x, Offset(0))));
}

#[test]
fn invalidate_locals_rewrites_escaped_stack_pointers() {
    init_logging();
    // callee g stores &local into *out, then its frame dies
    let mut graph = PointerGraph::new();
    let main = graph.add_subgraph("main");
    let g = graph.add_subgraph("g");

    let entry = graph.add_node_in(PsNodeKind::Entry, main);
    graph.set_subgraph_entry(main, entry);
    graph.set_entry(main);

    let out = graph.add_node_in(PsNodeKind::Alloc(AllocInfo::stack(Offset(8))), main);
    graph.add_successor(entry, out);

    let g_entry = graph.add_node_in(PsNodeKind::Entry, g);
    graph.set_subgraph_entry(g, g_entry);
    let local = graph.add_node_in(PsNodeKind::Alloc(AllocInfo::stack(Offset(8))), g);
    let store = graph.add_node_in(PsNodeKind::Store, g);
    graph.add_operand(store, local);
    graph.add_operand(store, out);
    let ret = graph.add_node_in(PsNodeKind::Return, g);
    graph.set_subgraph_return(g, ret);
    let inv = graph.add_node_in(PsNodeKind::InvalidateLocals, g);
    graph.add_operand(inv, ret);

    graph.add_successor(out, g_entry);
    graph.add_successor(g_entry, local);
    graph.add_successor(local, store);
    graph.add_successor(store, ret);
    graph.add_successor(ret, inv);

    let back = graph.add_node_in(PsNodeKind::Load, main);
    graph.add_operand(back, out);
    graph.add_successor(inv, back);

    let mut pa = PointerAnalysis::new(
        graph,
        PointerAnalysisOptions::default().with_track_invalidations(true),
    )
    .unwrap();
    pa.run();
    let result: Vec<Pointer> = pa.points_to(back).iter().collect();
    assert!(result.contains(&Pointer::invalidated()));
}

#[test]
fn empty_points_to_on_a_dereference_is_reported_not_fatal() {
    init_logging();
    let mut c = Chain::new();
    let p = c.push(PsNodeKind::Noop); // no points-to at all
    let q = c.load(p);

    let mut pa = PointerAnalysis::new(c.graph, PointerAnalysisOptions::default())
        .unwrap()
        .with_sink(Box::new(CollectingSink::default()));
    pa.run();
    assert!(pa.points_to(q).contains(Pointer::unknown()));
}

#[test]
fn function_pointer_calls_reach_the_callback() {
    init_logging();
    use std::cell::RefCell;
    use std::rc::Rc;

    let mut c = Chain::new();
    let f = c.push(PsNodeKind::Function);
    let p = c.alloc(8);
    c.store(f, p);
    let fp = c.load(p);
    let call = c.push(PsNodeKind::CallFuncPtr);
    c.graph.add_operand(call, fp);
    let call_ret = c.push(PsNodeKind::CallReturn);
    c.graph.pair(call, call_ret);

    let seen: Rc<RefCell<Vec<(PsNodeId, PsNodeId)>>> = Rc::new(RefCell::new(Vec::new()));
    let seen_in_callback = Rc::clone(&seen);
    let mut pa = PointerAnalysis::new(c.graph, PointerAnalysisOptions::default())
        .unwrap()
        .with_function_pointer_callback(Box::new(move |_graph, callsite, callee| {
            seen_in_callback.borrow_mut().push((callsite, callee));
            false
        }));
    pa.run();

    assert_eq!(seen.borrow().as_slice(), &[(call, f)]);
    assert!(pa.points_to(call).contains(Pointer::new(f, Offset(0))));
}

#[test]
fn malformed_graphs_are_refused() {
    init_logging();
    let graph = PointerGraph::new(); // no entry subgraph
    let err = PointerAnalysis::new(graph, PointerAnalysisOptions::default()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::MalformedInput);
}
