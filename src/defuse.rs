//! Def–use edge stream for the slicer.
//!
//! Combines the memory dependences resolved by an engine with the direct
//! value dependences of the pointer subgraph (operands into operations,
//! callee returns into call-return nodes, called pointers into indirect
//! calls).

use serde::Serialize;

use crate::pointer::{PointerGraph, PsNodeId, PsNodeKind};
use crate::reaching::ReachingDefinitions;
use crate::rwgraph::RwNodeId;
use crate::ssa::MemorySsa;

/// One data-dependence edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DefUseEdge {
    /// A memory definition reaching a use (read–write graph nodes).
    Memory { def: RwNodeId, use_at: RwNodeId },
    /// A direct operand feeding an operation (pointer subgraph nodes).
    Operand { from: PsNodeId, to: PsNodeId },
    /// A callee's returned value feeding the call-return node.
    Return { from: PsNodeId, to: PsNodeId },
    /// The called pointer feeding an indirect call.
    FunctionPointer { from: PsNodeId, to: PsNodeId },
}

/// Edges from the memory-SSA engine plus the pointer-subgraph value
/// edges. Queries may synthesise phi nodes, hence the mutable engine.
pub fn collect_def_use_edges(ps: &PointerGraph, ssa: &mut MemorySsa) -> Vec<DefUseEdge> {
    let mut edges = value_edges(ps);
    for id in ssa.graph().node_ids().collect::<Vec<_>>() {
        if !ssa.graph().node(id).is_use() {
            continue;
        }
        for def in ssa.definitions_of(id) {
            edges.push(DefUseEdge::Memory { def, use_at: id });
        }
    }
    edges
}

/// Same stream from the dense reaching-definitions engine.
pub fn collect_def_use_edges_dense(
    ps: &PointerGraph,
    rd: &ReachingDefinitions,
) -> Vec<DefUseEdge> {
    let mut edges = value_edges(ps);
    for id in rd.graph().node_ids() {
        if !rd.graph().node(id).is_use() {
            continue;
        }
        for def in rd.definitions_of(id) {
            edges.push(DefUseEdge::Memory { def, use_at: id });
        }
    }
    edges
}

fn value_edges(ps: &PointerGraph) -> Vec<DefUseEdge> {
    let mut edges = Vec::new();
    for id in ps.node_ids() {
        let node = ps.node(id);
        match node.kind {
            PsNodeKind::CallReturn => {
                for &op in node.operands() {
                    edges.push(DefUseEdge::Return { from: op, to: id });
                }
            }
            PsNodeKind::CallFuncPtr => {
                for (i, &op) in node.operands().iter().enumerate() {
                    if i == 0 {
                        edges.push(DefUseEdge::FunctionPointer { from: op, to: id });
                    } else {
                        edges.push(DefUseEdge::Operand { from: op, to: id });
                    }
                }
            }
            _ => {
                for &op in node.operands() {
                    edges.push(DefUseEdge::Operand { from: op, to: id });
                }
            }
        }
    }
    edges
}

/// Debug dump of an edge stream; not a stable format.
pub fn edges_to_json(edges: &[DefUseEdge]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(edges)
}
