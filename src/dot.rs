//! Graphviz dumps of the two graphs. Debug utilities, not a contract.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use crate::pointer::{PointerGraph, PsNodeKind};
use crate::rwgraph::{ReadWriteGraph, RwNodeKind};

/// Render a pointer subgraph with the computed points-to sets.
pub fn pointer_graph_dot(graph: &PointerGraph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph pointer_graph {{");
    let _ = writeln!(out, "  node [shape=box, fontname=\"monospace\"];");
    for id in graph.node_ids() {
        let node = graph.node(id);
        let mut label = format!("{}: {}", id.0, kind_name(&node.kind));
        if !node.points_to.is_empty() {
            let _ = write!(label, "\\n{}", node.points_to);
        }
        let _ = writeln!(out, "  n{} [label=\"{}\"];", id.0, label);
    }
    for id in graph.node_ids() {
        let node = graph.node(id);
        for &op in node.operands() {
            let _ = writeln!(out, "  n{} -> n{} [style=dashed];", op.0, id.0);
        }
        for &succ in node.successors() {
            let _ = writeln!(out, "  n{} -> n{};", id.0, succ.0);
        }
    }
    let _ = writeln!(out, "}}");
    out
}

/// Render a read–write graph with def/use annotations, one cluster per
/// subgraph.
pub fn read_write_graph_dot(graph: &ReadWriteGraph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph read_write_graph {{");
    let _ = writeln!(out, "  node [shape=box, fontname=\"monospace\"];");
    for sg in graph.subgraph_ids() {
        let subgraph = graph.subgraph(sg);
        let _ = writeln!(out, "  subgraph cluster_{} {{", sg.0);
        let _ = writeln!(out, "    label=\"{}\";", subgraph.name);
        for &block in subgraph.blocks() {
            for &id in graph.block(block).nodes() {
                let node = graph.node(id);
                let mut label = format!("{}: {}", id.0, rw_kind_name(&node.kind));
                for site in &node.overwrites {
                    let _ = write!(label, "\\nW! {site}");
                }
                for site in &node.defs {
                    let _ = write!(label, "\\nW {site}");
                }
                for site in &node.uses {
                    let _ = write!(label, "\\nR {site}");
                }
                let _ = writeln!(out, "    n{} [label=\"{}\"];", id.0, label);
            }
            // order within the block
            for pair in graph.block(block).nodes().windows(2) {
                let _ = writeln!(out, "    n{} -> n{};", pair[0].0, pair[1].0);
            }
        }
        let _ = writeln!(out, "  }}");
    }
    for block in graph.block_ids() {
        let Some(from) = graph.block(block).last() else {
            continue;
        };
        for &succ in graph.block(block).successors() {
            if let Some(to) = graph.block(succ).first() {
                let _ = writeln!(out, "  n{} -> n{} [style=bold];", from.0, to.0);
            }
        }
    }
    let _ = writeln!(out, "}}");
    out
}

/// Write a rendered graph to a file.
pub fn write_dot(path: impl AsRef<Path>, dot: &str) -> io::Result<()> {
    fs::write(path, dot)
}

fn kind_name(kind: &PsNodeKind) -> &'static str {
    match kind {
        PsNodeKind::NullAddr => "null",
        PsNodeKind::UnknownMemory => "unknown-mem",
        PsNodeKind::Invalidated => "invalidated",
        PsNodeKind::Alloc(_) => "alloc",
        PsNodeKind::DynAlloc(_) => "dyn-alloc",
        PsNodeKind::Function => "function",
        PsNodeKind::Load => "load",
        PsNodeKind::Store => "store",
        PsNodeKind::Gep { .. } => "gep",
        PsNodeKind::Cast => "cast",
        PsNodeKind::Phi => "phi",
        PsNodeKind::Call => "call",
        PsNodeKind::CallFuncPtr => "call-funcptr",
        PsNodeKind::CallReturn => "call-return",
        PsNodeKind::Entry => "entry",
        PsNodeKind::Return => "return",
        PsNodeKind::Noop => "noop",
        PsNodeKind::Constant => "constant",
        PsNodeKind::Memcpy { .. } => "memcpy",
        PsNodeKind::Free => "free",
        PsNodeKind::InvalidateLocals => "invalidate-locals",
        PsNodeKind::InvalidateObject => "invalidate-object",
    }
}

fn rw_kind_name(kind: &RwNodeKind) -> &'static str {
    match kind {
        RwNodeKind::UnknownMemory => "unknown-mem",
        RwNodeKind::Alloc(_) => "alloc",
        RwNodeKind::DynAlloc(_) => "dyn-alloc",
        RwNodeKind::Store(_) => "store",
        RwNodeKind::Load(_) => "load",
        RwNodeKind::Mu(_) => "mu",
        RwNodeKind::Phi => "phi",
        RwNodeKind::Call(_) => "call",
        RwNodeKind::CallReturn => "call-return",
        RwNodeKind::Return => "return",
        RwNodeKind::Fork => "fork",
        RwNodeKind::Join => "join",
        RwNodeKind::Noop => "noop",
    }
}
