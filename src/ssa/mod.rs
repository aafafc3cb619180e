//! Semi-sparse memory-SSA construction.
//!
//! Replaces the dense reaching-definitions fixpoint with per-block local
//! value numbering and on-demand phi insertion:
//!
//! - LVN folds each block's nodes into a per-block summary of disjoint
//!   definition intervals (at most once per block per summary
//!   generation).
//! - A use is resolved against the definitions before it in its block;
//!   uncovered byte ranges climb the CFG. At join points a phi node is
//!   synthesised at the block head *before* descending into the
//!   predecessors, which is what terminates the search on cycles.
//! - Reaching the entry of a non-entry subgraph continues at every call
//!   site of that subgraph; reaching the entry of the program yields the
//!   unknown-memory node.
//! - Calls to defined functions are folded in through interprocedural
//!   summaries, computed bottom-up to fixpoint.

mod definitions;
mod intervals;
mod summary;

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::diagnostics::{AnalysisResult, DiagnosticSink, ErrorKind, LogSink};
use crate::offset::Offset;
use crate::options::DataDependenceOptions;
use crate::rwgraph::{
    DefSite, MemAccess, ReadWriteGraph, RwBlockId, RwNodeId, RwNodeKind, RwSubgraphId,
};
use self::definitions::{Definitions, Summary};
use self::intervals::Interval;

/// Key of a memoised inter-block resolution: where the phi would live,
/// which memory object and which byte range it joins.
type PhiKey = (RwBlockId, RwNodeId, Interval);

/// The memory-SSA engine.
pub struct MemorySsa {
    graph: ReadWriteGraph,
    opts: DataDependenceOptions,
    /// Per-block summaries; presence + `processed` implements the block
    /// state machine.
    defs: FxHashMap<RwBlockId, Definitions>,
    in_lvn: FxHashSet<RwBlockId>,
    summaries: FxHashMap<RwSubgraphId, Summary>,
    /// Call nodes per callee subgraph.
    callsites: FxHashMap<RwSubgraphId, Vec<RwNodeId>>,
    phi_cache: FxHashMap<PhiKey, RwNodeId>,
    phi_refs: FxHashMap<RwNodeId, usize>,
    phis: Vec<RwNodeId>,
    /// Guard against non-phi cycles (single-predecessor loops).
    resolving: FxHashSet<PhiKey>,
    /// Use nodes whose def-use edges are final.
    resolved: FxHashSet<RwNodeId>,
    mu_cache: FxHashMap<(RwNodeId, RwNodeId, Offset, Offset), RwNodeId>,
    prepared: bool,
    sink: Box<dyn DiagnosticSink>,
}

impl MemorySsa {
    pub fn new(mut graph: ReadWriteGraph, opts: DataDependenceOptions) -> AnalysisResult<MemorySsa> {
        opts.validate()?;
        if graph.entry().is_none() {
            graph.select_entry_by_name(&opts.entry_function);
        }
        graph.validate()?;

        let mut callsites: FxHashMap<RwSubgraphId, Vec<RwNodeId>> = FxHashMap::default();
        for id in graph.node_ids() {
            if let Some(info) = graph.node(id).call_info() {
                for &callee in &info.callees {
                    callsites.entry(callee).or_default().push(id);
                }
            }
        }

        Ok(MemorySsa {
            graph,
            opts,
            defs: FxHashMap::default(),
            in_lvn: FxHashSet::default(),
            summaries: FxHashMap::default(),
            callsites,
            phi_cache: FxHashMap::default(),
            phi_refs: FxHashMap::default(),
            phis: Vec::new(),
            resolving: FxHashSet::default(),
            resolved: FxHashSet::default(),
            mu_cache: FxHashMap::default(),
            prepared: false,
            sink: Box::new(LogSink),
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn graph(&self) -> &ReadWriteGraph {
        &self.graph
    }

    pub fn options(&self) -> &DataDependenceOptions {
        &self.opts
    }

    /// Phi nodes synthesised so far.
    pub fn phis(&self) -> &[RwNodeId] {
        &self.phis
    }

    /// Build summaries and value-number every block. Queries run LVN on
    /// demand, so calling this up front is optional but makes the costs
    /// predictable.
    pub fn run(&mut self) {
        self.ensure_ready();
        for block in self.graph.block_ids().collect::<Vec<_>>() {
            self.ensure_processed(block);
        }
        // unknown-memory readers trigger the expensive conservative
        // traversal; resolve them up front
        let unknown_readers: BTreeSet<RwNodeId> = self
            .defs
            .values()
            .flat_map(|d| d.unknown_reads.iter().copied())
            .collect();
        for reader in unknown_readers {
            self.definitions_of(reader);
        }
    }

    fn ensure_ready(&mut self) {
        if self.prepared {
            return;
        }
        self.prepared = true;
        if self.graph.subgraph_ids().count() > 1 {
            self.compute_all_summaries();
        }
    }

    /// The definers of an existing use node.
    ///
    /// Idempotent: the first call records the def-use edges on the node,
    /// later calls return them unchanged.
    pub fn definitions_of(&mut self, use_node: RwNodeId) -> Vec<RwNodeId> {
        self.ensure_ready();
        if self.resolved.contains(&use_node) {
            return self.graph.node(use_node).defuse().to_vec();
        }

        let uses: Vec<DefSite> = self.graph.node(use_node).uses.iter().copied().collect();
        let mut definers: BTreeSet<RwNodeId> = BTreeSet::new();
        for site in uses {
            if site.is_unknown_memory() {
                definers.extend(self.all_reaching_definitions(use_node));
            } else {
                definers.extend(self.resolve_before_node(use_node, site));
            }
        }

        let mut result: Vec<RwNodeId> = definers.into_iter().collect();
        if let Some(cap) = self.opts.max_set_size.value() {
            if result.len() as u64 > cap {
                self.sink.report(
                    ErrorKind::ResourceCapHit,
                    &format!("node {}: definer set exceeded the cap, collapsed", use_node.0),
                );
                result = vec![RwNodeId::UNKNOWN_MEMORY];
            }
        }
        self.graph.node_mut(use_node).defuse = result.clone();
        self.resolved.insert(use_node);
        result
    }

    /// The definitions of `(mem, offset, len)` reaching `at`: synthesises
    /// an artificial use just before `at` and resolves it.
    pub fn definitions_at(
        &mut self,
        at: RwNodeId,
        mem: RwNodeId,
        offset: Offset,
        len: Offset,
    ) -> Vec<RwNodeId> {
        self.ensure_ready();
        let offset = if self.opts.field_insensitive {
            Offset::UNKNOWN
        } else {
            offset
        };
        if self.graph.node(at).block().is_none() {
            return Vec::new();
        }
        let key = (at, mem, offset, len);
        if let Some(&mu) = self.mu_cache.get(&key) {
            return self.definitions_of(mu);
        }
        let mu = self.graph.add_node(RwNodeKind::Mu(MemAccess {
            pointer: None,
            length: len,
        }));
        self.graph.node_mut(mu).add_use(DefSite::new(mem, offset, len));
        self.graph.insert_before(mu, at);
        self.mu_cache.insert(key, mu);
        self.definitions_of(mu)
    }

    /// Conservative closure: every definition that may reach `from`,
    /// regardless of target. Resolves reads of unknown memory.
    pub fn all_reaching_definitions(&mut self, from: RwNodeId) -> Vec<RwNodeId> {
        self.ensure_ready();
        let Some(block) = self.graph.node(from).block() else {
            return Vec::new();
        };

        let mut result: BTreeSet<RwNodeId> = BTreeSet::new();
        let partial = self.partial_definitions(block, Some(from));
        result.extend(partial.definitions.all_definers());
        result.extend(partial.unknown_writes.iter().copied());

        let mut inherited = intervals::DefinitionsMap::default();
        let mut visited: FxHashSet<RwBlockId> = FxHashSet::from_iter([block]);
        for pred in self.graph.block(block).predecessors().to_vec() {
            self.collect_all_definitions(pred, &mut inherited, &mut visited);
        }
        result.extend(inherited.all_definers());
        result.remove(&RwNodeId::UNKNOWN_MEMORY);
        result.into_iter().collect()
    }

    /// Accumulate every definition reaching the end of `block`, filling
    /// the per-block `all_definitions` cache along the way.
    ///
    /// Returns whether the computed cone was complete; cones truncated by
    /// the visited set (cycles, rejoining paths) are merged but not
    /// cached.
    fn collect_all_definitions(
        &mut self,
        block: RwBlockId,
        acc: &mut intervals::DefinitionsMap,
        visited: &mut FxHashSet<RwBlockId>,
    ) -> bool {
        if !visited.insert(block) {
            return false;
        }
        self.ensure_processed(block);
        if let Some(d) = self.defs.get(&block) {
            if !d.all_definitions.is_empty() {
                // the cache already covers this block's backward cone
                acc.merge(&d.all_definitions);
                return true;
            }
        }

        let mut cone = intervals::DefinitionsMap::default();
        if let Some(d) = self.defs.get(&block) {
            cone.merge(&d.definitions);
        }
        let mut complete = true;
        for pred in self.graph.block(block).predecessors().to_vec() {
            complete &= self.collect_all_definitions(pred, &mut cone, visited);
        }
        acc.merge(&cone);
        if complete {
            if let Some(d) = self.defs.get_mut(&block) {
                d.all_definitions = cone;
            }
        }
        complete
    }

    // ----------------------
    // Local value numbering
    // ----------------------

    /// Finalise a block's definitions, at most once per generation.
    fn ensure_processed(&mut self, block: RwBlockId) {
        if self.defs.get(&block).is_some_and(|d| d.processed) {
            return;
        }
        if !self.in_lvn.insert(block) {
            return; // already building (at most one concurrent build)
        }
        let mut d = self.partial_definitions(block, None);
        d.processed = true;
        self.defs.insert(block, d);
        self.in_lvn.remove(&block);
    }

    /// Value-number the block up to (excluding) `upto`, or the whole
    /// block.
    fn partial_definitions(&self, block: RwBlockId, upto: Option<RwNodeId>) -> Definitions {
        let mut d = Definitions::default();
        for &id in self.graph.block(block).nodes() {
            if Some(id) == upto {
                break;
            }
            self.apply_node(&mut d, id);
        }
        d
    }

    /// Fold one node (including callee summaries) into `d`.
    fn apply_node(&self, d: &mut Definitions, id: RwNodeId) {
        let node = self.graph.node(id);
        if let Some(info) = node.call_info() {
            let single = info.callees.len() == 1;
            for callee in &info.callees {
                if let Some(s) = self.summaries.get(callee) {
                    d.definitions.merge(&s.defs);
                    d.unknown_writes.extend(s.unknown_writes.iter().copied());
                    // must-kills transfer only when the callee is unique
                    if single {
                        d.kills.merge(&s.kills);
                    }
                }
            }
        }
        d.update(node, id);
    }

    /// Forget a block's summary, e.g. after a phi landed at its head.
    fn invalidate_block(&mut self, block: RwBlockId) {
        self.defs.remove(&block);
    }

    // ----------------------
    // Global value numbering
    // ----------------------

    /// Definers of `site` as seen just before `at` in its block.
    fn resolve_before_node(&mut self, at: RwNodeId, site: DefSite) -> BTreeSet<RwNodeId> {
        let Some(block) = self.graph.node(at).block() else {
            return BTreeSet::new();
        };
        let partial = self.partial_definitions(block, Some(at));
        let mut definers = partial.definitions.get(&site);
        definers.extend(partial.unknown_writes.iter().copied());
        for gap in partial.definitions.uncovered(&site) {
            definers.extend(self.resolve_at_block_entry(block, site.target, gap));
        }
        definers
    }

    /// Definers of `(target, iv)` flowing into the head of `block`.
    // TODO: convert the recursion into an explicit worklist of
    // (block, interval) items; very deep CFGs can exhaust the stack.
    fn resolve_at_block_entry(
        &mut self,
        block: RwBlockId,
        target: RwNodeId,
        iv: Interval,
    ) -> BTreeSet<RwNodeId> {
        let key = (block, target, iv);
        if let Some(&definer) = self.phi_cache.get(&key) {
            *self.phi_refs.entry(definer).or_insert(0) += 1;
            return BTreeSet::from([definer]);
        }
        if !self.resolving.insert(key) {
            // a single-predecessor cycle: the loop's own definitions were
            // already collected by the frame that started this search
            return BTreeSet::new();
        }

        let preds = self.graph.block(block).predecessors().to_vec();
        let result = if preds.is_empty() {
            self.resolve_at_subgraph_entry(block, target, iv)
        } else if preds.len() == 1 {
            self.resolve_through_block(preds[0], target, iv)
        } else {
            self.join_with_phi(key, &preds)
        };

        self.resolving.remove(&key);
        result
    }

    /// Definers of `(target, iv)` reaching the end of `block`.
    fn resolve_through_block(
        &mut self,
        block: RwBlockId,
        target: RwNodeId,
        iv: Interval,
    ) -> BTreeSet<RwNodeId> {
        self.ensure_processed(block);
        let site = iv.to_site(target);
        let (mut definers, gaps, unknown_writes) = match self.defs.get(&block) {
            Some(d) => (
                d.definitions.get(&site),
                d.definitions.uncovered(&site),
                d.unknown_writes.clone(),
            ),
            None => (BTreeSet::new(), vec![iv], Vec::new()),
        };
        definers.extend(unknown_writes);
        for gap in gaps {
            definers.extend(self.resolve_at_block_entry(block, target, gap));
        }
        definers
    }

    /// Multiple predecessors: synthesise a phi at the head of the block,
    /// registered *before* descending so cyclic searches land on it.
    fn join_with_phi(&mut self, key: PhiKey, preds: &[RwBlockId]) -> BTreeSet<RwNodeId> {
        let (block, target, iv) = key;
        let phi = self.new_phi(block, target, iv, key);

        let mut operands: BTreeSet<RwNodeId> = BTreeSet::new();
        for &pred in preds {
            operands.extend(self.resolve_through_block(pred, target, iv));
        }
        self.finish_phi(key, phi, operands)
    }

    fn new_phi(
        &mut self,
        block: RwBlockId,
        target: RwNodeId,
        iv: Interval,
        key: PhiKey,
    ) -> RwNodeId {
        let site = iv.to_site(target);
        let phi = self.graph.add_node(RwNodeKind::Phi);
        self.graph.node_mut(phi).add_use(site);
        self.graph.node_mut(phi).add_def(site, false);
        self.graph.insert_at_head(block, phi);
        self.phis.push(phi);
        self.phi_cache.insert(key, phi);
        self.phi_refs.insert(phi, 0);
        // the block now starts with a new definition
        self.invalidate_block(block);
        phi
    }

    /// Record the phi's operands; elide it when it joins a single definer
    /// and nothing referenced it while it was provisional.
    fn finish_phi(
        &mut self,
        key: PhiKey,
        phi: RwNodeId,
        operands: BTreeSet<RwNodeId>,
    ) -> BTreeSet<RwNodeId> {
        let refs = self.phi_refs.get(&phi).copied().unwrap_or(0);
        let foreign: Vec<RwNodeId> = operands.iter().copied().filter(|&d| d != phi).collect();
        if refs == 0 && foreign.len() == 1 {
            let definer = foreign[0];
            self.phi_cache.insert(key, definer);
            self.graph.remove_node_from_block(phi);
            self.phis.retain(|&p| p != phi);
            self.invalidate_block(key.0);
            return BTreeSet::from([definer]);
        }
        self.graph.node_mut(phi).defuse = foreign;
        self.resolved.insert(phi);
        BTreeSet::from([phi])
    }

    /// The search climbed past the first block of a subgraph: continue at
    /// the call sites, or bottom out at unknown memory for the program
    /// entry.
    fn resolve_at_subgraph_entry(
        &mut self,
        block: RwBlockId,
        target: RwNodeId,
        iv: Interval,
    ) -> BTreeSet<RwNodeId> {
        let sg = self.graph.block(block).subgraph();
        let callsites = self.callsites.get(&sg).cloned().unwrap_or_default();
        if self.graph.entry() == Some(sg) || callsites.is_empty() {
            return BTreeSet::from([RwNodeId::UNKNOWN_MEMORY]);
        }

        // an input phi stands for the memory flowing in from the callers
        let key = (block, target, iv);
        let phi = self.new_phi(block, target, iv, key);
        let mut operands: BTreeSet<RwNodeId> = BTreeSet::new();
        let site = iv.to_site(target);
        for call in callsites {
            operands.extend(self.resolve_before_node(call, site));
        }
        self.finish_phi(key, phi, operands)
    }
}
