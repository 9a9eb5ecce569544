use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;

use tutti_core::ensemble::Step;
use tutti_core::error::{Result, TuttiError};

/// Lifecycle of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One compiled flow element with its dependency edges and runtime
/// bookkeeping.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub kind: &'static str,
    pub step: Step,
    pub depends_on: Vec<String>,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Dependency graph compiled from a flat list of flow elements.
///
/// Each element becomes a node tagged by kind; `depends_on` entries
/// become explicit edges. Compilation validates identifiers eagerly —
/// a duplicate id or an edge to an unknown node is a definition error,
/// not a runtime one.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    pub nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
}

impl ExecutionGraph {
    pub fn compile(steps: &[Step]) -> Result<Self> {
        let mut nodes = Vec::with_capacity(steps.len());
        let mut index = HashMap::new();

        for (i, step) in steps.iter().enumerate() {
            let id = step.effective_id(i);
            if index.insert(id.clone(), i).is_some() {
                return Err(TuttiError::Config(format!(
                    "duplicate step identifier '{}'",
                    id
                )));
            }
            nodes.push(GraphNode {
                id,
                kind: step.kind(),
                step: step.clone(),
                depends_on: step.depends_on().to_vec(),
                status: NodeStatus::Pending,
                started_at: None,
                finished_at: None,
                result: None,
                error: None,
            });
        }

        for node in &nodes {
            for dep in &node.depends_on {
                if !index.contains_key(dep) {
                    return Err(TuttiError::Config(format!(
                        "step '{}' depends on unknown step '{}'",
                        node.id, dep
                    )));
                }
                if dep == &node.id {
                    return Err(TuttiError::Config(format!(
                        "step '{}' depends on itself",
                        node.id
                    )));
                }
            }
        }

        Ok(Self { nodes, index })
    }

    /// Indices of pending nodes whose dependencies have all completed —
    /// the current frontier.
    pub fn frontier(&self) -> Vec<usize> {
        let completed: HashSet<&str> = self
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Completed)
            .map(|n| n.id.as_str())
            .collect();

        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.status == NodeStatus::Pending
                    && n.depends_on.iter().all(|d| completed.contains(d.as_str()))
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn all_completed(&self) -> bool {
        self.nodes.iter().all(|n| n.status == NodeStatus::Completed)
    }

    /// Ids of nodes that are not yet completed, in definition order.
    pub fn remaining_ids(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.status != NodeStatus::Completed)
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|i| &self.nodes[*i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutti_core::ensemble::UnitStep;

    fn unit(id: &str, deps: &[&str]) -> Step {
        Step::Unit(
            UnitStep::new(id).with_depends_on(deps.iter().map(|s| s.to_string()).collect()),
        )
    }

    #[test]
    fn test_compile_assigns_ids_and_edges() {
        let graph =
            ExecutionGraph::compile(&[unit("a", &[]), unit("b", &["a"]), unit("c", &["a", "b"])])
                .unwrap();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.node("c").unwrap().depends_on, vec!["a", "b"]);
        assert_eq!(graph.nodes[0].kind, "unit");
    }

    #[test]
    fn test_unknown_dependency_is_definition_error() {
        let err = ExecutionGraph::compile(&[unit("a", &["ghost"])]).unwrap_err();
        assert_eq!(err.code(), "config");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_id_is_definition_error() {
        let err = ExecutionGraph::compile(&[unit("a", &[]), unit("a", &[])]).unwrap_err();
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = ExecutionGraph::compile(&[unit("a", &["a"])]).unwrap_err();
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn test_frontier_advances_with_completion() {
        let mut graph =
            ExecutionGraph::compile(&[unit("a", &[]), unit("b", &["a"]), unit("c", &["b"])])
                .unwrap();
        assert_eq!(graph.frontier(), vec![0]);

        graph.nodes[0].status = NodeStatus::Completed;
        assert_eq!(graph.frontier(), vec![1]);

        graph.nodes[1].status = NodeStatus::Completed;
        assert_eq!(graph.frontier(), vec![2]);
    }

    #[test]
    fn test_cycle_has_empty_frontier() {
        let graph = ExecutionGraph::compile(&[unit("a", &["b"]), unit("b", &["a"])]).unwrap();
        assert!(graph.frontier().is_empty());
        assert!(!graph.all_completed());
        assert_eq!(graph.remaining_ids(), vec!["a", "b"]);
    }
}
