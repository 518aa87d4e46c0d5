//! Graphviz DOT export for a [`FlowGraph`] (supplemented feature, §11.1).
//!
//! Read-only and consulted by nothing in C1–C3; exists purely so an
//! operator can inspect a loaded graph with `stepflow-cli inspect --dot`.

use crate::graph::{EdgeType, FlowGraph};
use std::fmt::Write as _;

/// Render `graph` as a Graphviz DOT document.
pub fn to_dot(graph: &FlowGraph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", escape(&graph.id));
    let _ = writeln!(out, "  rankdir=LR;");

    for node in graph.nodes() {
        let shape = if node.is_start {
            "doublecircle"
        } else if node.is_terminal {
            "doublecircle"
        } else {
            "box"
        };
        let _ = writeln!(
            out,
            "  \"{}\" [shape={shape}, label=\"{}\\n({})\"];",
            escape(&node.id),
            escape(&node.id),
            escape(&node.station)
        );
    }

    for edge in graph.edges() {
        let style = match edge.edge_type {
            EdgeType::Sequence => "solid",
            EdgeType::Loop => "dashed",
            EdgeType::Branch => "solid",
            EdgeType::Detour => "dotted",
            EdgeType::Terminal => "bold",
        };
        let label = edge.condition.clone().unwrap_or_default();
        let _ = writeln!(
            out,
            "  \"{}\" -> \"{}\" [style={style}, label=\"{}\"];",
            escape(&edge.from),
            escape(&edge.to),
            escape(&label)
        );
    }

    let _ = writeln!(out, "}}");
    out
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FlowGraphBuilder;

    #[test]
    fn renders_nodes_and_edges() {
        let graph = FlowGraphBuilder::new("f1", "1")
            .start_node("A", "producer")
            .terminal_node("B", "done")
            .sequence_edge("e1", "A", "B")
            .build()
            .unwrap();
        let dot = to_dot(&graph);
        assert!(dot.contains("digraph"));
        assert!(dot.contains("\"A\" -> \"B\""));
    }
}
