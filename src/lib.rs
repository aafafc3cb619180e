//! Memory dependence analyses for program slicing.
//!
//! This crate builds the data-dependence half of a dependence graph over
//! a low-level IR. A frontend lowers its IR into two graphs and hands
//! them over:
//!
//! - the **pointer subgraph** ([`pointer::PointerGraph`]), on which the
//!   [`pointer::PointerAnalysis`] computes, for every abstract location,
//!   the memory objects and offsets it may reference;
//! - the **read–write graph** ([`rwgraph::ReadWriteGraph`]), annotated
//!   with concrete def/use sites by [`rwgraph::builder::annotate`] using
//!   the pointer-analysis result.
//!
//! Two engines answer "which writes reach this read": the dense
//! [`reaching::ReachingDefinitions`] reference solver, and the semi-sparse
//! [`ssa::MemorySsa`] form with on-demand phi insertion and
//! interprocedural summaries. [`defuse::collect_def_use_edges`] turns
//! either result into the edge stream a slicer consumes.
//!
//! The crate is single-threaded by contract: no analysis instance may be
//! used concurrently. All graph containers are arena-based and move-only;
//! queries return ids whose lifetime equals the container's.

pub mod defuse;
pub mod diagnostics;
pub mod dot;
pub mod offset;
pub mod options;
pub mod pointer;
pub mod reaching;
pub mod rwgraph;
pub mod ssa;

#[cfg(test)]
mod analysis_tests;

pub use diagnostics::{AnalysisError, AnalysisResult, DiagnosticSink, ErrorKind};
pub use offset::Offset;
pub use options::{
    DataDependenceEngine, DataDependenceOptions, FunctionModel, PointerAnalysisOptions,
};
pub use pointer::{
    AllocInfo, Pointer, PointerAnalysis, PointerGraph, PointsToSet, PsNodeId, PsNodeKind,
};
pub use reaching::ReachingDefinitions;
pub use rwgraph::{
    CallArg, CallInfo, DefSite, MemAccess, ReadWriteGraph, RwAllocInfo, RwBlockId, RwNodeId,
    RwNodeKind, RwSubgraphId,
};
pub use ssa::MemorySsa;
