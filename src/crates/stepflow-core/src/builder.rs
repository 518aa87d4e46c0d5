//! A convenience builder for assembling a [`FlowGraph`] in-process — used by
//! tests and by front ends that construct flows programmatically rather
//! than loading them from an authoring format (that loader is out of
//! scope, per spec §1).

use crate::error::Result;
use crate::graph::{Edge, EdgeType, FlowGraph, Node, Policy};

#[derive(Debug, Default)]
pub struct FlowGraphBuilder {
    id: String,
    version: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    policy: Option<Policy>,
}

impl FlowGraphBuilder {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn start_node(self, id: impl Into<String>, station: impl Into<String>) -> Self {
        self.node(Node {
            id: id.into(),
            station: station.into(),
            is_start: true,
            is_terminal: false,
            max_iterations: None,
            exit_condition: None,
        })
    }

    pub fn terminal_node(self, id: impl Into<String>, station: impl Into<String>) -> Self {
        self.node(Node {
            id: id.into(),
            station: station.into(),
            is_start: false,
            is_terminal: true,
            max_iterations: None,
            exit_condition: None,
        })
    }

    pub fn plain_node(self, id: impl Into<String>, station: impl Into<String>) -> Self {
        self.node(Node {
            id: id.into(),
            station: station.into(),
            is_start: false,
            is_terminal: false,
            max_iterations: None,
            exit_condition: None,
        })
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn sequence_edge(self, id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge(Edge {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            edge_type: EdgeType::Sequence,
            condition: None,
            priority: None,
            is_default: false,
        })
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<FlowGraph> {
        let policy = self.policy.unwrap_or(Policy {
            max_loop_iterations: 3,
            max_stack_depth: 3,
            tiebreaker_confidence_threshold: 0.7,
            tiebreaker_timeout_ms: 30_000,
        });
        FlowGraph::compile(self.id, self.version, self.nodes, self.edges, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_linear_graph() {
        let graph = FlowGraphBuilder::new("f1", "1")
            .start_node("A", "producer")
            .plain_node("B", "critic")
            .terminal_node("C", "done")
            .sequence_edge("e1", "A", "B")
            .sequence_edge("e2", "B", "C")
            .build()
            .unwrap();
        assert_eq!(graph.node_count(), 3);
    }
}
