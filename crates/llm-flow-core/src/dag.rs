// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dependency DAG over steps and loops.
//!
//! Nodes are a workflow's steps and top-level loops; edges come from
//! `needs:`. The validator has already required every `{{name}}`
//! reference to appear in `needs`, so explicit edges are the full edge
//! set.

use crate::error::{FlowError, Result};
use crate::model::Workflow;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Kind of DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// An entry of `steps:`.
    Step,
    /// An entry of `loops:`.
    Loop,
}

/// One DAG node.
#[derive(Debug, Clone)]
pub struct Node {
    /// Step or loop name.
    pub name: String,
    /// Document position (steps first, then loops).
    pub doc_index: usize,
    /// Node kind.
    pub kind: NodeKind,
}

/// The workflow DAG.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<Node, ()>,
    by_name: HashMap<String, NodeIndex>,
}

impl WorkflowDag {
    /// Builds the DAG from a validated workflow.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut by_name = HashMap::new();
        let mut doc_index = 0usize;

        for step in &workflow.steps {
            let idx = graph.add_node(Node {
                name: step.name.clone(),
                doc_index,
                kind: NodeKind::Step,
            });
            by_name.insert(step.name.clone(), idx);
            doc_index += 1;
        }
        for loop_ in &workflow.loops {
            if let Some(name) = &loop_.name {
                let idx = graph.add_node(Node {
                    name: name.clone(),
                    doc_index,
                    kind: NodeKind::Loop,
                });
                by_name.insert(name.clone(), idx);
                doc_index += 1;
            }
        }

        let mut add_edges = |name: &str, needs: &[String]| -> Result<()> {
            let target = by_name[name];
            for dep in needs {
                let source = *by_name
                    .get(dep)
                    .ok_or_else(|| FlowError::StepNotFound(dep.clone()))?;
                graph.add_edge(source, target, ());
            }
            Ok(())
        };
        for step in &workflow.steps {
            add_edges(&step.name, &step.needs)?;
        }
        for loop_ in &workflow.loops {
            if let Some(name) = &loop_.name {
                add_edges(name, &loop_.needs)?;
            }
        }

        Ok(Self { graph, by_name })
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the DAG is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Node metadata by name.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.by_name.get(name).map(|&idx| &self.graph[idx])
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        match self.by_name.get(name) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|dep| self.graph[dep].name.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Direct dependents of a node.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        match self.by_name.get(name) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .map(|dep| self.graph[dep].name.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every node reachable from `name` along dependency edges (the
    /// transitive dependents), excluding `name` itself.
    pub fn transitive_dependents(&self, name: &str) -> HashSet<String> {
        let mut dependents = HashSet::new();
        let Some(&start) = self.by_name.get(name) else {
            return dependents;
        };
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != start {
                dependents.insert(self.graph[idx].name.clone());
            }
        }
        dependents
    }

    /// A topological order that follows document order wherever the
    /// dependency edges allow (stable Kahn: among ready nodes, the one
    /// declared first runs first).
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let mut indegree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while order.len() < self.graph.node_count() {
            let next = self
                .graph
                .node_indices()
                .filter(|idx| indegree.get(idx) == Some(&0))
                .min_by_key(|&idx| self.graph[idx].doc_index);
            let Some(idx) = next else {
                // Unreachable after validation; kept as a hard stop.
                return Err(FlowError::Registry(
                    "workflow DAG contains a cycle".to_string(),
                ));
            };
            indegree.remove(&idx);
            for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(count) = indegree.get_mut(&dependent) {
                    *count = count.saturating_sub(1);
                }
            }
            order.push(self.graph[idx].name.clone());
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(yaml: &str) -> Workflow {
        serde_yaml::from_str(yaml).unwrap()
    }

    const DIAMOND: &str = r#"
$schema: llm-flow/v1
name: diamond
version: "1.0"
description: diamond dag
execution:
  provider: anthropic
  model: claude-sonnet-4-20250514
steps:
  - name: fan_in
    needs: [left, right]
    run: "Join {{left}} {{right}}"
  - name: source
    run: "Start {{input}}"
  - name: left
    needs: [source]
    run: "L {{source}}"
  - name: right
    needs: [source]
    run: "R {{source}}"
"#;

    #[test]
    fn test_execution_order_respects_dependencies() {
        let dag = WorkflowDag::from_workflow(&workflow(DIAMOND)).unwrap();
        let order = dag.execution_order().unwrap();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("source") < pos("left"));
        assert!(pos("source") < pos("right"));
        assert!(pos("left") < pos("fan_in"));
        assert!(pos("right") < pos("fan_in"));
    }

    #[test]
    fn test_order_prefers_document_order() {
        let dag = WorkflowDag::from_workflow(&workflow(DIAMOND)).unwrap();
        let order = dag.execution_order().unwrap();
        // fan_in is declared first but gated; among ready peers document
        // order wins: left before right.
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("left") < pos("right"));
    }

    #[test]
    fn test_transitive_dependents() {
        let dag = WorkflowDag::from_workflow(&workflow(DIAMOND)).unwrap();
        let dependents = dag.transitive_dependents("source");
        assert_eq!(dependents.len(), 3);
        assert!(dependents.contains("left"));
        assert!(dependents.contains("fan_in"));
        assert!(dag.transitive_dependents("fan_in").is_empty());
    }

    #[test]
    fn test_loops_are_nodes() {
        let yaml = r#"
$schema: llm-flow/v1
name: with-loop
version: "1.0"
description: loop node
execution:
  provider: anthropic
  model: claude-sonnet-4-20250514
steps:
  - name: prep
    run: "Prep {{input}}"
loops:
  - name: refine
    workflow: child
    max_iterations: 3
    until: "output says done"
    needs: [prep]
"#;
        let dag = WorkflowDag::from_workflow(&workflow(yaml)).unwrap();
        assert_eq!(dag.len(), 2);
        assert_eq!(dag.node("refine").unwrap().kind, NodeKind::Loop);
        let order = dag.execution_order().unwrap();
        assert_eq!(order, vec!["prep", "refine"]);
    }

    #[test]
    fn test_dependencies() {
        let dag = WorkflowDag::from_workflow(&workflow(DIAMOND)).unwrap();
        let mut deps = dag.dependencies("fan_in");
        deps.sort();
        assert_eq!(deps, vec!["left", "right"]);
    }
}
