//! Dependency-graph execution for nonlinear flows.
//!
//! A flow's elements compile into nodes tagged by kind, with
//! `depends_on` entries as explicit edges. The executor repeatedly
//! computes the frontier — nodes whose dependencies have all
//! completed — runs it concurrently, settles results in node order,
//! and recomputes. Termination is: all nodes completed, a node failed
//! (abort, siblings not cancelled), or an empty frontier with
//! incomplete nodes (deadlock from a dependency cycle).

pub mod executor;
pub mod node;

pub use executor::GraphExecutor;
pub use node::{ExecutionGraph, GraphNode, NodeStatus};
