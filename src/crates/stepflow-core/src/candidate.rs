//! C2 — the candidate generator.

use crate::graph::{Edge, EdgeId, EdgeType, FlowGraph, NodeId};
use crate::node_result::NodeStatus;
use crate::state::RunState;

/// Where a candidate edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    /// A literal outgoing edge in the `FlowGraph`.
    GraphEdge,
    /// The synthetic `pop_stack` candidate yielded when the current node is
    /// the top interruption frame's target and just completed.
    DetourCatalog,
    /// Reserved for future fast-path hints; unused by this implementation
    /// but kept so callers can match exhaustively against the same origin
    /// set the spec names.
    FastPathHint,
}

/// A legal next edge, annotated with where it came from.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub edge_id: EdgeId,
    pub to: NodeId,
    pub edge_type: EdgeType,
    pub condition: Option<String>,
    pub priority: i64,
    pub is_default: bool,
    pub origin: CandidateOrigin,
}

impl Candidate {
    fn from_edge(edge: &Edge, ordinal: usize) -> Self {
        Self {
            edge_id: edge.id.clone(),
            to: edge.to.clone(),
            edge_type: edge.edge_type,
            condition: edge.condition.clone(),
            priority: edge.priority.unwrap_or(-(ordinal as i64)),
            is_default: edge.is_default,
            origin: CandidateOrigin::GraphEdge,
        }
    }
}

/// Synthetic edge id for the stack-pop candidate; never collides with an
/// authored edge id because authored ids come from the external spec loader
/// and this string is reserved by convention.
pub const POP_STACK_EDGE_ID: &str = "__pop_stack__";

/// Produce the ordered candidate list for `current_node_id` (spec §4.2).
///
/// Ordering: explicit `priority` descending, then authoring order ascending
/// (graph edges are already stored in authoring order, so a stable sort on
/// priority alone preserves it for ties).
///
/// If the interruption stack is non-empty, the current node equals the top
/// frame's `injected_node_id`, and `last_status` is not `Failed`, the sole
/// candidate returned is the synthetic `pop_stack` edge — graph edges from
/// the injected node are not legal candidates while a pop is pending.
pub fn generate_candidates(
    graph: &FlowGraph,
    current_node_id: &str,
    last_status: Option<NodeStatus>,
    run: &RunState,
) -> Vec<Candidate> {
    if let Some(frame) = run.peek_frame() {
        if frame.injected_node_id == current_node_id && last_status != Some(NodeStatus::Failed) {
            let resume_to = graph
                .edge(&frame.resume_edge_id)
                .map(|e| e.to.clone())
                .unwrap_or_else(|| frame.resume_edge_id.clone());
            return vec![Candidate {
                edge_id: POP_STACK_EDGE_ID.to_string(),
                to: resume_to,
                edge_type: EdgeType::Sequence,
                condition: None,
                priority: i64::MAX,
                is_default: false,
                origin: CandidateOrigin::DetourCatalog,
            }];
        }
    }

    let mut candidates: Vec<Candidate> = graph
        .edges_from(current_node_id)
        .enumerate()
        .map(|(ordinal, edge)| Candidate::from_edge(edge, ordinal))
        .collect();

    // Stable sort: priority descending. Equal priorities (including the
    // shared default derived from authoring order) keep their relative
    // order, which is authoring order ascending — exactly the spec's
    // tie-break rule.
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, Policy};
    use crate::state::{InjectedBy, StackFrame};
    use chrono::Utc;

    fn policy() -> Policy {
        Policy {
            max_loop_iterations: 3,
            max_stack_depth: 3,
            tiebreaker_confidence_threshold: 0.7,
            tiebreaker_timeout_ms: 30_000,
        }
    }

    fn node(id: &str, start: bool, terminal: bool) -> Node {
        Node {
            id: id.into(),
            station: "s".into(),
            is_start: start,
            is_terminal: terminal,
            max_iterations: None,
            exit_condition: None,
        }
    }

    fn edge(id: &str, from: &str, to: &str, priority: Option<i64>) -> Edge {
        Edge {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            edge_type: EdgeType::Sequence,
            condition: None,
            priority,
            is_default: false,
        }
    }

    #[test]
    fn orders_by_priority_then_authoring_order() {
        let nodes = vec![node("A", true, false), node("B", false, true), node("C", false, true)];
        let edges = vec![
            edge("low", "A", "B", Some(1)),
            edge("high", "A", "C", Some(5)),
        ];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();
        let run = RunState::new("r", "f", "A", Utc::now());
        let candidates = generate_candidates(&graph, "A", None, &run);
        assert_eq!(candidates[0].edge_id, "high");
        assert_eq!(candidates[1].edge_id, "low");
    }

    #[test]
    fn ties_keep_authoring_order() {
        let nodes = vec![node("A", true, false), node("B", false, true), node("C", false, true)];
        let edges = vec![edge("e1", "A", "B", None), edge("e2", "A", "C", None)];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();
        let run = RunState::new("r", "f", "A", Utc::now());
        let candidates = generate_candidates(&graph, "A", None, &run);
        assert_eq!(candidates[0].edge_id, "e1");
        assert_eq!(candidates[1].edge_id, "e2");
    }

    #[test]
    fn yields_pop_stack_when_frame_targets_current_node() {
        let nodes = vec![node("A", true, false), node("D", false, false), node("B", false, true)];
        let edges = vec![edge("resume", "A", "B", None)];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();
        let mut run = RunState::new("r", "f", "D", Utc::now());
        run.push_frame(
            StackFrame {
                injected_node_id: "D".into(),
                origin_node_id: "A".into(),
                resume_edge_id: "resume".into(),
                injected_by: InjectedBy::Operator,
                created_at: Utc::now(),
            },
            3,
        );
        let candidates = generate_candidates(&graph, "D", Some(NodeStatus::Succeeded), &run);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].edge_id, POP_STACK_EDGE_ID);
        assert_eq!(candidates[0].to, "B");
    }

    #[test]
    fn does_not_pop_when_injected_node_failed() {
        let nodes = vec![node("A", true, false), node("D", false, false), node("B", false, true)];
        let edges = vec![edge("resume", "A", "B", None), edge("retry", "D", "D", None)];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();
        let mut run = RunState::new("r", "f", "D", Utc::now());
        run.push_frame(
            StackFrame {
                injected_node_id: "D".into(),
                origin_node_id: "A".into(),
                resume_edge_id: "resume".into(),
                injected_by: InjectedBy::Operator,
                created_at: Utc::now(),
            },
            3,
        );
        let candidates = generate_candidates(&graph, "D", Some(NodeStatus::Failed), &run);
        assert!(candidates.iter().all(|c| c.edge_id != POP_STACK_EDGE_ID));
    }
}
