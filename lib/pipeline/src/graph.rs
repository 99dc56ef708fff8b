//! Agent dependency graph built on petgraph.
//!
//! Nodes are agent names, edges point from an upstream agent to the agent
//! that consumes its output. The graph is built once per configuration
//! snapshot and rejected if it contains a cycle, so nothing at runtime ever
//! has to cope with one.

use crate::definition::AgentDefinition;
use crate::error::GraphError;
use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use trendline_core::{AgentName, RunState};

/// A data dependency between two agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub upstream: AgentName,
    pub downstream: AgentName,
    /// Upstream run states that satisfy this edge.
    pub required_states: Vec<RunState>,
}

impl DependencyEdge {
    #[must_use]
    pub fn accepts(&self, state: RunState) -> bool {
        self.required_states.contains(&state)
    }
}

/// Acyclic graph of agent dependencies.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<AgentName, DependencyEdge>,
    index: HashMap<AgentName, NodeIndex>,
}

impl DependencyGraph {
    /// Builds and validates the graph.
    ///
    /// `required_states` yields the accepted upstream states for each
    /// downstream definition, normally from its failure policy.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate names, unknown or self dependencies,
    /// and cycles.
    pub fn build<'a, I, F>(definitions: I, required_states: F) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = &'a AgentDefinition>,
        F: Fn(&AgentDefinition) -> Vec<RunState>,
    {
        let definitions: Vec<&AgentDefinition> = definitions.into_iter().collect();
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for def in &definitions {
            if index.contains_key(&def.name) {
                return Err(GraphError::DuplicateAgent {
                    agent: def.name.clone(),
                });
            }
            let idx = graph.add_node(def.name.clone());
            index.insert(def.name.clone(), idx);
        }

        for def in &definitions {
            let downstream_idx = index[&def.name];
            let states = required_states(def);
            for upstream in &def.depends_on {
                if *upstream == def.name {
                    return Err(GraphError::SelfDependency {
                        agent: def.name.clone(),
                    });
                }
                let upstream_idx =
                    *index
                        .get(upstream)
                        .ok_or_else(|| GraphError::UnknownDependency {
                            agent: def.name.clone(),
                            upstream: upstream.clone(),
                        })?;
                graph.add_edge(
                    upstream_idx,
                    downstream_idx,
                    DependencyEdge {
                        upstream: upstream.clone(),
                        downstream: def.name.clone(),
                        required_states: states.clone(),
                    },
                );
            }
        }

        let built = Self { graph, index };
        built.validate()?;
        Ok(built)
    }

    /// Rejects cycles, naming every agent of the first cycle found.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] if the graph is not a DAG.
    pub fn validate(&self) -> Result<(), GraphError> {
        if toposort(&self.graph, None).is_ok() {
            return Ok(());
        }
        let mut agents: Vec<AgentName> = tarjan_scc(&self.graph)
            .into_iter()
            .find(|component| component.len() > 1)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect();
        agents.sort();
        Err(GraphError::CycleDetected { agents })
    }

    #[must_use]
    pub fn contains(&self, agent: &AgentName) -> bool {
        self.index.contains_key(agent)
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Edges into `agent`, one per upstream dependency.
    #[must_use]
    pub fn upstream_edges(&self, agent: &AgentName) -> Vec<&DependencyEdge> {
        let Some(&idx) = self.index.get(agent) else {
            return Vec::new();
        };
        let mut edges: Vec<&DependencyEdge> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|edge| edge.weight())
            .collect();
        edges.sort_by(|a, b| a.upstream.cmp(&b.upstream));
        edges
    }

    /// Agents that consume `agent`'s output directly.
    #[must_use]
    pub fn downstream(&self, agent: &AgentName) -> Vec<&AgentName> {
        let Some(&idx) = self.index.get(agent) else {
            return Vec::new();
        };
        let mut names: Vec<&AgentName> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter_map(|edge| self.graph.node_weight(edge.target()))
            .collect();
        names.sort();
        names
    }

    /// Agents with no dependencies.
    #[must_use]
    pub fn roots(&self) -> Vec<&AgentName> {
        let mut names: Vec<&AgentName> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .edges_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect();
        names.sort();
        names
    }

    /// Every agent, upstream before downstream.
    #[must_use]
    pub fn topological_order(&self) -> Vec<AgentName> {
        toposort(&self.graph, None)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> AgentName {
        AgentName::new(s).unwrap()
    }

    fn def(agent: &str, deps: &[&str]) -> AgentDefinition {
        deps.iter().fold(
            AgentDefinition::new(name(agent), "0 * * * *"),
            |def, dep| def.depending_on(name(dep)),
        )
    }

    fn succeeded_only(_: &AgentDefinition) -> Vec<RunState> {
        vec![RunState::Succeeded]
    }

    fn pipeline() -> Vec<AgentDefinition> {
        vec![
            def("ingestion", &[]),
            def("analyzer", &["ingestion"]),
            def("semantic", &["ingestion"]),
            def("predictor", &["analyzer", "semantic"]),
            def("evaluator", &["predictor"]),
        ]
    }

    #[test]
    fn builds_edges_from_definitions() {
        let graph = DependencyGraph::build(&pipeline(), succeeded_only).unwrap();
        assert_eq!(graph.agent_count(), 5);
        assert_eq!(graph.edge_count(), 5);

        let edges = graph.upstream_edges(&name("predictor"));
        let upstream: Vec<&str> = edges.iter().map(|e| e.upstream.as_str()).collect();
        assert_eq!(upstream, vec!["analyzer", "semantic"]);
        assert!(edges[0].accepts(RunState::Succeeded));
        assert!(!edges[0].accepts(RunState::PartialSuccess));

        assert_eq!(
            graph.downstream(&name("ingestion")),
            vec![&name("analyzer"), &name("semantic")]
        );
        assert_eq!(graph.roots(), vec![&name("ingestion")]);
    }

    #[test]
    fn topological_order_puts_upstream_first() {
        let graph = DependencyGraph::build(&pipeline(), succeeded_only).unwrap();
        let order = graph.topological_order();
        let pos = |n: &str| order.iter().position(|a| a.as_str() == n).unwrap();
        assert!(pos("ingestion") < pos("analyzer"));
        assert!(pos("analyzer") < pos("predictor"));
        assert!(pos("semantic") < pos("predictor"));
        assert!(pos("predictor") < pos("evaluator"));
    }

    #[test]
    fn two_node_cycle_is_rejected() {
        let defs = vec![def("a", &["b"]), def("b", &["a"])];
        let err = DependencyGraph::build(&defs, succeeded_only).unwrap_err();
        assert_eq!(
            err,
            GraphError::CycleDetected {
                agents: vec![name("a"), name("b")]
            }
        );
    }

    #[test]
    fn longer_cycle_is_rejected() {
        let defs = vec![
            def("root", &[]),
            def("a", &["root", "c"]),
            def("b", &["a"]),
            def("c", &["b"]),
        ];
        let err = DependencyGraph::build(&defs, succeeded_only).unwrap_err();
        let GraphError::CycleDetected { agents } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(agents, vec![name("a"), name("b"), name("c")]);
    }

    #[test]
    fn self_and_unknown_dependencies_are_rejected() {
        let err = DependencyGraph::build(&[def("a", &["a"])], succeeded_only).unwrap_err();
        assert_eq!(err, GraphError::SelfDependency { agent: name("a") });

        let err = DependencyGraph::build(&[def("a", &["ghost"])], succeeded_only).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let defs = vec![def("a", &[]), def("a", &[])];
        let err = DependencyGraph::build(&defs, succeeded_only).unwrap_err();
        assert_eq!(err, GraphError::DuplicateAgent { agent: name("a") });
    }

    #[test]
    fn edges_carry_per_downstream_states() {
        let defs = vec![
            def("ingestion", &[]),
            def("analyzer", &["ingestion"]).with_failure_policy("lenient"),
        ];
        let graph = DependencyGraph::build(&defs, |d| {
            if d.failure_policy == "lenient" {
                vec![RunState::Succeeded, RunState::PartialSuccess]
            } else {
                vec![RunState::Succeeded]
            }
        })
        .unwrap();
        let edges = graph.upstream_edges(&name("analyzer"));
        assert!(edges[0].accepts(RunState::PartialSuccess));
    }
}
