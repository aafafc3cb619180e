//! Per-block definition summaries for the memory-SSA engine.

use crate::rwgraph::{RwNode, RwNodeId};
use crate::ssa::intervals::DefinitionsMap;

/// What one basic block (or a prefix of it) defines.
///
/// `definitions` holds the may-definers per disjoint interval;
/// `kills` the ranges strongly overwritten, which lets an inter-block
/// search terminate early. The processed flag implements the
/// at-most-once build discipline: a block moves Unseen -> InLVN ->
/// Finalised and is never rebuilt within a summary generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Definitions {
    pub processed: bool,
    pub definitions: DefinitionsMap,
    pub kills: DefinitionsMap,
    /// Lazy cache: every definition reaching the end of this block,
    /// including inherited ones. Empty until a conservative query fills
    /// it.
    pub all_definitions: DefinitionsMap,
    /// Nodes writing to unknown memory in this block.
    pub unknown_writes: Vec<RwNodeId>,
    /// Nodes reading unknown memory in this block.
    pub unknown_reads: Vec<RwNodeId>,
}

impl Definitions {
    /// Fold one node's memory effects into the block summary.
    ///
    /// Interprocedural effects of calls are merged separately by the
    /// engine; this handles the node's own def/use sites.
    pub fn update(&mut self, node: &RwNode, id: RwNodeId) {
        for site in &node.overwrites {
            if site.is_unknown_memory() {
                // a strong write through unknown memory only exists when
                // the unsound option permits it; it still defines unknown
                // memory rather than killing the world
                self.unknown_writes.push(id);
                self.definitions.update(site, id);
                self.kills.update(site, id);
            } else {
                self.definitions.update(site, id);
                self.kills.update(site, id);
            }
        }
        for site in &node.defs {
            if site.is_unknown_memory() {
                self.unknown_writes.push(id);
                // any previously killed range may have been overwritten
                // again, so kill-based early termination is off the table
                self.kills.clear();
                self.definitions.add(site, id);
            } else {
                self.definitions.add(site, id);
            }
        }
        if node.uses.iter().any(|u| u.is_unknown_memory()) {
            self.unknown_reads.push(id);
        }
    }
}

/// The externally visible memory effects of a subgraph after full SSA
/// resolution: what it may define (with the real defining nodes), what it
/// must kill, and its writes through unknown memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Summary {
    pub defs: DefinitionsMap,
    pub kills: DefinitionsMap,
    pub unknown_writes: Vec<RwNodeId>,
}

