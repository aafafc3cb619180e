//! Populates a read–write graph skeleton with def/use sites.
//!
//! The frontend has already laid out subgraphs, blocks and nodes and linked
//! memory-touching nodes to their pointer-analysis operands. This pass
//! translates each pointer operand through the finished pointer analysis
//! into [`DefSite`]s, applies function models to declared calls, treats
//! unmodeled calls as worst case, and synthesises the exit overwrite that
//! keeps definitions of locals from leaking into callers.

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::diagnostics::{AnalysisResult, DiagnosticSink, ErrorKind, OnceReporter};
use crate::offset::Offset;
use crate::options::{DataDependenceEngine, DataDependenceOptions, FunctionModel, OperandValue};
use crate::pointer::{PointerAnalysis, PsNodeId};
use crate::rwgraph::{CallArg, DefSite, ReadWriteGraph, RwNodeId, RwNodeKind, RwSubgraphId};

/// Annotate `graph` with the def/use sites implied by `pa`.
pub fn annotate(
    graph: &mut ReadWriteGraph,
    pa: &PointerAnalysis,
    opts: &DataDependenceOptions,
    sink: &mut dyn DiagnosticSink,
) -> AnalysisResult<()> {
    graph.validate()?;
    opts.validate()?;
    let mut pass = AnnotatePass {
        pa,
        opts,
        sink,
        reported: OnceReporter::default(),
        escaped: pa.escaped_allocations().into_iter().collect(),
    };
    pass.run(graph);
    Ok(())
}

struct AnnotatePass<'a> {
    pa: &'a PointerAnalysis,
    opts: &'a DataDependenceOptions,
    sink: &'a mut dyn DiagnosticSink,
    reported: OnceReporter,
    /// PS allocations whose address is stored somewhere.
    escaped: FxHashSet<PsNodeId>,
}

impl AnnotatePass<'_> {
    fn run(&mut self, graph: &mut ReadWriteGraph) {
        self.annotate_accesses(graph);
        self.annotate_returns(graph);
        self.annotate_calls(graph);
    }

    /// Loads, stores and artificial uses.
    fn annotate_accesses(&mut self, graph: &mut ReadWriteGraph) {
        for id in graph.node_ids().collect::<Vec<_>>() {
            let (kind_is_store, access) = match &graph.node(id).kind {
                RwNodeKind::Load(m) | RwNodeKind::Mu(m) => (false, *m),
                RwNodeKind::Store(m) => (true, *m),
                _ => continue,
            };
            let Some(pointer) = access.pointer else {
                continue; // pre-annotated by the frontend
            };

            let sites = self.translate(graph, id, pointer, access.length);
            if kind_is_store {
                let strong = self.is_strong_store(graph, pointer, access.length, &sites);
                for site in sites {
                    graph.node_mut(id).add_def(site, strong);
                }
            } else {
                for site in sites {
                    graph.node_mut(id).add_use(site);
                }
            }
        }
    }

    /// A store is an overwrite iff its pointer set is a single pointer
    /// with concrete offset and length whose target is not heap memory.
    fn is_strong_store(
        &self,
        graph: &ReadWriteGraph,
        pointer: PsNodeId,
        length: Offset,
        sites: &BTreeSet<DefSite>,
    ) -> bool {
        if self.opts.field_insensitive || length.is_unknown() {
            return false;
        }
        let Some(ptr) = self.pa.points_to(pointer).single_pointer() else {
            return false;
        };
        if ptr.offset.is_unknown() {
            return false;
        }
        if ptr.is_unknown() {
            return self.opts.strong_update_unknown;
        }
        if !ptr.is_valid() {
            return false;
        }
        sites
            .iter()
            .all(|site| !graph.node(site.target).is_heap_allocation() && !site.is_unknown_memory())
    }

    /// Map one pointer operand into def-sites.
    fn translate(
        &mut self,
        graph: &ReadWriteGraph,
        at: RwNodeId,
        pointer: PsNodeId,
        length: Offset,
    ) -> BTreeSet<DefSite> {
        let mut sites = BTreeSet::new();
        let pts = self.pa.points_to(pointer);
        if pts.is_empty() {
            self.reported.report(
                self.sink,
                ErrorKind::UnsoundFallback,
                at.0,
                &format!("node {}: empty points-to set, using unknown memory", at.0),
            );
            sites.insert(DefSite::unknown_memory());
            return sites;
        }
        for ptr in pts.iter() {
            if ptr.is_null() {
                continue;
            }
            if !ptr.is_valid() {
                sites.insert(DefSite::unknown_memory());
                continue;
            }
            let target = graph.rw_target(ptr.target);
            let offset = if self.opts.field_insensitive {
                Offset::UNKNOWN
            } else {
                ptr.offset
            };
            sites.insert(DefSite::new(target, offset, length));
        }
        if sites.is_empty() {
            // the whole set was null pointers
            sites.insert(DefSite::unknown_memory());
        }
        sites
    }

    /// Synthesise the exit overwrite of purely local allocations.
    fn annotate_returns(&mut self, graph: &mut ReadWriteGraph) {
        // invert the allocation map to know each allocation's PS node
        let rw_to_ps: FxHashMap<RwNodeId, PsNodeId> = graph
            .node_ids()
            .filter_map(|id| {
                graph.node(id).origin.map(|ps| (id, ps))
            })
            .collect();

        for sg in graph.subgraph_ids().collect::<Vec<_>>() {
            let locals = self.local_allocations(graph, sg, &rw_to_ps);
            if locals.is_empty() {
                continue;
            }
            for block in graph.return_blocks(sg) {
                let Some(ret) = graph.block(block).last() else {
                    continue;
                };
                for &target in &locals {
                    graph
                        .node_mut(ret)
                        .add_def(DefSite::new(target, Offset::UNKNOWN, Offset::UNKNOWN), true);
                }
            }
        }
    }

    /// Allocations of `sg` that never escape it: not heap, not global,
    /// address not stored anywhere.
    fn local_allocations(
        &self,
        graph: &ReadWriteGraph,
        sg: RwSubgraphId,
        rw_to_ps: &FxHashMap<RwNodeId, PsNodeId>,
    ) -> Vec<RwNodeId> {
        let mut locals = Vec::new();
        for &block in graph.subgraph(sg).blocks() {
            for &id in graph.block(block).nodes() {
                let node = graph.node(id);
                if !matches!(node.kind, RwNodeKind::Alloc(_)) {
                    continue;
                }
                if node.alloc_info().is_some_and(|i| i.is_heap || i.is_global) {
                    continue;
                }
                let escapes = rw_to_ps
                    .get(&id)
                    .is_some_and(|ps| self.escaped.contains(ps));
                if !escapes {
                    locals.push(id);
                }
            }
        }
        locals
    }

    fn annotate_calls(&mut self, graph: &mut ReadWriteGraph) {
        for id in graph.node_ids().collect::<Vec<_>>() {
            let Some(info) = graph.node(id).call_info().cloned() else {
                continue;
            };

            if !info.callees.is_empty() {
                // defined callees: the SSA engine resolves them through
                // summaries; the dense engine needs the effect inlined
                if self.opts.engine == DataDependenceEngine::Rd {
                    let (defs, uses) = self.collect_callee_effects(graph, &info.callees);
                    for site in defs {
                        graph.node_mut(id).add_def(site, false);
                    }
                    for site in uses {
                        graph.node_mut(id).add_use(site);
                    }
                }
                continue;
            }

            let model = info
                .callee_name
                .as_deref()
                .and_then(|name| self.opts.model(name).cloned());
            match model {
                Some(model) => self.apply_model(graph, id, &model, &info.args),
                None if self.opts.undefined_are_pure => {}
                None => self.worst_case_call(graph, id, &info.args),
            }
        }
    }

    /// Effects of a modelled declared function: byte ranges of the memory
    /// reachable through positional pointer arguments.
    fn apply_model(
        &mut self,
        graph: &mut ReadWriteGraph,
        call: RwNodeId,
        model: &FunctionModel,
        args: &[CallArg],
    ) {
        let mut defs: Vec<DefSite> = Vec::new();
        let mut uses: Vec<DefSite> = Vec::new();
        for (sites, ranges) in [(&mut defs, &model.defines), (&mut uses, &model.uses)] {
            for range in ranges {
                let Some(arg) = args.get(range.operand) else {
                    self.reported.report(
                        self.sink,
                        ErrorKind::UnsupportedConstruct,
                        call.0,
                        &format!("call {}: model references missing operand", call.0),
                    );
                    continue;
                };
                let Some(pointer) = arg.pointer else {
                    continue;
                };
                let from = resolve_operand_value(range.from, args);
                let to = resolve_operand_value(range.to, args);
                let len = match (from.value(), to.value()) {
                    (Some(f), Some(t)) if t >= f => Offset(t - f),
                    _ => Offset::UNKNOWN,
                };
                for ptr in self.pa.points_to(pointer).iter() {
                    if ptr.is_null() {
                        continue;
                    }
                    if !ptr.is_valid() {
                        sites.push(DefSite::unknown_memory());
                        continue;
                    }
                    let target = graph.rw_target(ptr.target);
                    let offset = if self.opts.field_insensitive {
                        Offset::UNKNOWN
                    } else {
                        ptr.offset.saturating_add(from)
                    };
                    sites.push(DefSite::new(target, offset, len));
                }
            }
        }
        // modelled writes stay weak: copy routines cannot be proven to
        // reach every byte of the summarised range
        for site in defs {
            graph.node_mut(call).add_def(site, false);
        }
        for site in uses {
            graph.node_mut(call).add_use(site);
        }
    }

    /// An unmodeled declared call defines and uses everything reachable
    /// through its pointer arguments, at unknown offsets.
    fn worst_case_call(&mut self, graph: &mut ReadWriteGraph, call: RwNodeId, args: &[CallArg]) {
        self.reported.report(
            self.sink,
            ErrorKind::UnsupportedConstruct,
            call.0,
            &format!("call {}: no model for declared callee, assuming worst case", call.0),
        );
        let roots: Vec<PsNodeId> = args
            .iter()
            .filter_map(|arg| arg.pointer)
            .flat_map(|p| {
                self.pa
                    .points_to(p)
                    .iter()
                    .filter(|ptr| ptr.is_valid())
                    .map(|ptr| ptr.target)
                    .collect::<Vec<_>>()
            })
            .collect();
        let mut sites: BTreeSet<DefSite> = self
            .pa
            .pointed_memory_closure(roots)
            .into_iter()
            .map(|t| DefSite::new(graph.rw_target(t), Offset::UNKNOWN, Offset::UNKNOWN))
            .collect();
        sites.insert(DefSite::unknown_memory());
        for site in sites {
            graph.node_mut(call).add_def(site, false);
            graph.node_mut(call).add_use(site);
        }
    }

    /// Transitive def/use sites of defined callees, excluding memory that
    /// cannot outlive them.
    fn collect_callee_effects(
        &self,
        graph: &ReadWriteGraph,
        callees: &[RwSubgraphId],
    ) -> (BTreeSet<DefSite>, BTreeSet<DefSite>) {
        let mut visited: FxHashSet<RwSubgraphId> = FxHashSet::default();
        let mut stack: Vec<RwSubgraphId> = callees.to_vec();
        let mut defs = BTreeSet::new();
        let mut uses = BTreeSet::new();
        while let Some(sg) = stack.pop() {
            if !visited.insert(sg) {
                continue;
            }
            for &block in graph.subgraph(sg).blocks() {
                for &id in graph.block(block).nodes() {
                    let node = graph.node(id);
                    defs.extend(node.all_defs().copied());
                    uses.extend(node.uses.iter().copied());
                    if let Some(info) = node.call_info() {
                        stack.extend(info.callees.iter().copied());
                    }
                }
            }
        }
        let is_visible = |site: &DefSite| {
            let target = graph.node(site.target);
            if site.is_unknown_memory() || target.is_heap_allocation() {
                return true;
            }
            if target.alloc_info().is_some_and(|i| i.is_global) {
                return true;
            }
            // stack memory of a visited callee stays inside it unless the
            // address escaped
            let owner = target
                .block()
                .map(|b| graph.block(b).subgraph());
            match owner {
                Some(owner) if visited.contains(&owner) => {
                    graph.node(site.target).origin.is_some_and(|ps| self.escaped.contains(&ps))
                }
                _ => true,
            }
        };
        defs.retain(|site| is_visible(site));
        uses.retain(|site| is_visible(site));
        (defs, uses)
    }
}

fn resolve_operand_value(value: OperandValue, args: &[CallArg]) -> Offset {
    match value {
        OperandValue::Offset(off) => off,
        OperandValue::Operand(i) => args
            .get(i)
            .and_then(|arg| arg.constant)
            .map(Offset)
            .unwrap_or(Offset::UNKNOWN),
    }
}
