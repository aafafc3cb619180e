//! Interprocedural callee summaries.
//!
//! A summary captures which memory a subgraph may define (with the real
//! defining nodes), which ranges it must kill, and its unknown-memory
//! writes. Summaries start from the bottom value "no effect" and the whole
//! set is re-summarised until stable, so mutually recursive functions
//! converge to the closure of their effects. Blocks are value-numbered
//! against the current generation of summaries and rebuilt whenever any
//! summary changed.

use std::collections::BTreeSet;

use crate::offset::Offset;
use crate::rwgraph::{DefSite, RwBlockId, RwNodeId, RwSubgraphId};
use crate::ssa::MemorySsa;
use crate::ssa::definitions::Summary;

impl MemorySsa {
    /// Fixpoint over the call graph; memoised in `self.summaries`.
    pub(super) fn compute_all_summaries(&mut self) {
        let subgraphs: Vec<RwSubgraphId> = self.graph.subgraph_ids().collect();
        for &sg in &subgraphs {
            self.summaries.insert(sg, Summary::default());
        }

        loop {
            let mut changed = false;
            for &sg in &subgraphs {
                // rebuild this subgraph's blocks against the current
                // summary generation
                let blocks: Vec<RwBlockId> = self.graph.subgraph(sg).blocks().to_vec();
                for block in blocks {
                    self.invalidate_block(block);
                }
                let summary = self.collect_summary(sg);
                if self.summaries.get(&sg) != Some(&summary) {
                    self.summaries.insert(sg, summary);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// One generation of a subgraph's summary: the union of its blocks'
    /// definitions, minus memory that cannot outlive the call.
    fn collect_summary(&mut self, sg: RwSubgraphId) -> Summary {
        let blocks: Vec<RwBlockId> = self.graph.subgraph(sg).blocks().to_vec();
        let mut summary = Summary::default();
        for &block in &blocks {
            self.ensure_processed(block);
            let Some(d) = self.defs.get(&block) else {
                continue;
            };
            summary.defs.merge(&d.definitions);
            summary
                .unknown_writes
                .extend(d.unknown_writes.iter().copied());
        }

        let returns = self.graph.return_blocks(sg);

        // must-kills are taken from the straight-line suffix ending in the
        // unique return block; anything weaker stays out of the summary
        if let [ret] = returns.as_slice() {
            let mut block = *ret;
            let mut seen: BTreeSet<RwBlockId> = BTreeSet::new();
            while seen.insert(block) {
                if let Some(d) = self.defs.get(&block) {
                    summary.kills.merge(&d.kills);
                }
                match self.graph.block(block).predecessors() {
                    [single] => block = *single,
                    _ => break,
                }
            }
        }

        // drop targets fully overwritten at every exit: that is the
        // synthesised end-of-lifetime kill of the callee's own locals
        let targets: Vec<RwNodeId> = summary.defs.entries().map(|(t, _)| t).collect();
        for target in targets {
            let whole = DefSite::new(target, Offset::UNKNOWN, Offset::UNKNOWN);
            let dead = !returns.is_empty()
                && returns.iter().all(|&ret| {
                    self.defs
                        .get(&ret)
                        .is_some_and(|d| d.kills.covers(&whole))
                });
            if dead {
                summary.defs.remove_target(target);
                summary.kills.remove_target(target);
            }
        }

        summary.unknown_writes.sort_unstable();
        summary.unknown_writes.dedup();
        summary
    }

    /// The current summary definers of a subgraph, mainly for debugging
    /// and tests.
    pub fn summary_definers(&self, sg: RwSubgraphId) -> BTreeSet<RwNodeId> {
        self.summaries
            .get(&sg)
            .map(|s| s.defs.all_definers())
            .unwrap_or_default()
    }
}
