//! Dense reaching-definitions analysis over the read–write graph.
//!
//! The reference engine: a classical gen/kill forward dataflow at node
//! granularity.
//!
//! ```text
//! gen(n)  = defs(n) ∪ overwrites(n)
//! kill(n) = { d ∈ in(n) | some overwrite of n covers d }
//! out(n)  = gen(n) ∪ (in(n) \ kill(n))
//! in(n)   = ⋃ out(pred(n))
//! ```
//!
//! Sets are bounded: past `max_set_size` entries a set collapses to the
//! single unknown-memory sentinel, which is how the analysis degrades on
//! pathological inputs.

use std::collections::{BTreeSet, VecDeque};

use crate::diagnostics::{
    AnalysisResult, DiagnosticSink, ErrorKind, LogSink, OnceReporter,
};
use crate::offset::Offset;
use crate::options::DataDependenceOptions;
use crate::rwgraph::{DefSite, ReadWriteGraph, RwNodeId};

/// One reaching definition: the defining node and what it defined.
pub type ReachingDef = (RwNodeId, DefSite);

/// A bounded set of reaching definitions.
#[derive(Debug, Clone, Default, PartialEq)]
struct RdSet {
    collapsed: bool,
    items: BTreeSet<ReachingDef>,
}

impl RdSet {
    fn sentinel() -> ReachingDef {
        (RwNodeId::UNKNOWN_MEMORY, DefSite::unknown_memory())
    }

    fn collapse(&mut self) -> bool {
        if self.collapsed {
            return false;
        }
        self.collapsed = true;
        self.items.clear();
        self.items.insert(RdSet::sentinel());
        true
    }

    fn insert(&mut self, item: ReachingDef) -> bool {
        if self.collapsed {
            return false;
        }
        self.items.insert(item)
    }

    fn merge(&mut self, other: &RdSet) -> bool {
        if self.collapsed {
            return false;
        }
        if other.collapsed {
            return self.collapse();
        }
        let before = self.items.len();
        self.items.extend(other.items.iter().copied());
        self.items.len() != before
    }

    fn enforce_cap(&mut self, cap: Offset) -> bool {
        if let Some(cap) = cap.value() {
            if self.items.len() as u64 > cap {
                return self.collapse();
            }
        }
        false
    }

    fn iter(&self) -> impl Iterator<Item = &ReachingDef> {
        self.items.iter()
    }
}

/// The dense reaching-definitions solver.
pub struct ReachingDefinitions {
    graph: ReadWriteGraph,
    opts: DataDependenceOptions,
    in_sets: Vec<RdSet>,
    out_sets: Vec<RdSet>,
    sink: Box<dyn DiagnosticSink>,
    reported: OnceReporter,
}

impl ReachingDefinitions {
    pub fn new(
        mut graph: ReadWriteGraph,
        opts: DataDependenceOptions,
    ) -> AnalysisResult<ReachingDefinitions> {
        opts.validate()?;
        if graph.entry().is_none() {
            graph.select_entry_by_name(&opts.entry_function);
        }
        graph.validate()?;
        let count = graph.node_count();
        Ok(ReachingDefinitions {
            graph,
            opts,
            in_sets: vec![RdSet::default(); count],
            out_sets: vec![RdSet::default(); count],
            sink: Box::new(LogSink),
            reported: OnceReporter::default(),
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn graph(&self) -> &ReadWriteGraph {
        &self.graph
    }

    /// Run the forward dataflow to fixpoint.
    pub fn run(&mut self) {
        let mut queue: VecDeque<RwNodeId> = self.graph.node_ids().collect();
        let mut queued = vec![true; self.graph.node_count()];

        while let Some(n) = queue.pop_front() {
            queued[n.0 as usize] = false;
            if self.process(n) {
                for succ in self.graph.node_successors(n) {
                    let idx = succ.0 as usize;
                    if !queued[idx] {
                        queued[idx] = true;
                        queue.push_back(succ);
                    }
                }
            }
        }
    }

    fn process(&mut self, n: RwNodeId) -> bool {
        let idx = n.0 as usize;

        // in(n) = union of predecessor outs
        let mut in_set = RdSet::default();
        for pred in self.graph.node_predecessors(n) {
            in_set.merge(&self.out_sets[pred.0 as usize]);
        }

        let node = self.graph.node(n);
        let mut out = RdSet::default();
        if in_set.collapsed {
            out.collapse();
        } else {
            // survivors: definitions no overwrite of n fully covers
            for &(definer, site) in in_set.iter() {
                let killed = node
                    .overwrites
                    .iter()
                    .any(|ow| ow.covers(&site));
                if !killed {
                    out.insert((definer, site));
                }
            }
        }
        for site in node.all_defs() {
            out.insert((n, *site));
        }
        if out.enforce_cap(self.opts.max_set_size) {
            self.reported.report(
                self.sink.as_mut(),
                ErrorKind::ResourceCapHit,
                n.0,
                &format!("node {}: reaching set exceeded the cap, collapsed", n.0),
            );
        }

        let changed = out != self.out_sets[idx];
        self.in_sets[idx] = in_set;
        if changed {
            self.out_sets[idx] = out;
        }
        changed
    }

    /// The definitions reaching `node`, as def-sites.
    pub fn reaching_def_sites(&self, node: RwNodeId) -> Vec<DefSite> {
        let sites: BTreeSet<DefSite> = self.in_sets[node.0 as usize]
            .iter()
            .map(|&(_, site)| site)
            .collect();
        sites.into_iter().collect()
    }

    /// The nodes defining the memory `use_node` reads.
    pub fn definitions_of(&self, use_node: RwNodeId) -> Vec<RwNodeId> {
        let uses = &self.graph.node(use_node).uses;
        let mut definers: BTreeSet<RwNodeId> = BTreeSet::new();
        for &(definer, site) in self.in_sets[use_node.0 as usize].iter() {
            if uses.iter().any(|u| u.overlaps(&site)) {
                definers.insert(definer);
            }
        }
        definers.into_iter().collect()
    }

    /// The nodes whose definition of `(mem, offset, len)` reaches `at`.
    pub fn definitions_at(
        &self,
        at: RwNodeId,
        mem: RwNodeId,
        offset: Offset,
        len: Offset,
    ) -> Vec<RwNodeId> {
        let probe = DefSite::new(mem, offset, len);
        let mut definers: BTreeSet<RwNodeId> = BTreeSet::new();
        for &(definer, site) in self.in_sets[at.0 as usize].iter() {
            if probe.overlaps(&site) {
                definers.insert(definer);
            }
        }
        definers.into_iter().collect()
    }
}
