//! Tutti execution engine.
//!
//! Orchestrates declarative ensembles: a sequential driver for linear
//! flows, a dependency-graph driver for control-flow constructs
//! (parallel, branch, foreach, try, switch, while, map-reduce), an
//! immutable copy-on-write state manager with scoped audited access,
//! and a quality-gated scoring loop with configurable retry and
//! aggregation.

pub mod context;
pub mod executor;
pub mod expr;
pub mod graph;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod scoring;
pub mod suspend;

pub use context::ExecutionContext;
pub use executor::EnsembleExecutor;
pub use graph::{ExecutionGraph, GraphExecutor, GraphNode, NodeStatus};
pub use registry::{FnEvaluator, FnUnit, UnitRegistry};
pub use runner::{is_skipped, skip_marker, UnitRunner};
pub use scoring::{
    EnsembleScorer, ScoreRecord, ScoredOutcome, ScoringExecutor, ScoringState, ScoringStatus,
};
pub use suspend::{SuspendStore, SuspendedState};
