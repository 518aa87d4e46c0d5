//! The immutable flow graph: nodes, typed edges, and per-graph policy.
//!
//! A [`FlowGraph`] is produced by an external spec loader (out of scope here,
//! per spec §1) and handed to the kernel as a read-only snapshot for the
//! lifetime of a run. Nothing in this crate ever mutates a `FlowGraph` after
//! construction — `compile()` is the only fallible step, and it is where the
//! structural invariants of spec §3 are checked once and for all.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Opaque identifier for a [`Node`]. Carried as a plain string so the loader
/// (out of scope) can assign ids however its authoring format wants to.
pub type NodeId = String;

/// Opaque identifier for an [`Edge`].
pub type EdgeId = String;

/// Opaque reference to a station/prompt template, consulted only by the
/// engine adapter (C6). The kernel and router never interpret this value.
pub type StationRef = String;

/// The type of an [`Edge`], fixing how the candidate generator and router
/// treat it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// A plain forward transition.
    Sequence,
    /// A microloop edge — self-loop or a back-edge the router treats as
    /// loop-bounded (spec §4.3 step 3).
    Loop,
    /// A conditional fan-out edge.
    Branch,
    /// An edge that injects a detour node/flow, pushing the interruption
    /// stack (spec §4.5, §4.7 step 6).
    Detour,
    /// An edge into a TERMINAL node.
    Terminal,
}

/// A single node in the flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique id within the graph.
    pub id: NodeId,
    /// Opaque reference to the station template executed by C6.
    pub station: StationRef,
    /// `true` for the graph's single START node.
    #[serde(default)]
    pub is_start: bool,
    /// `true` for a TERMINAL node (a graph may have more than one).
    #[serde(default)]
    pub is_terminal: bool,
    /// Per-node iteration ceiling, overriding `Policy::max_loop_iterations`
    /// when present.
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Expression evaluated by the router's microloop exit check (spec
    /// §4.3 step 3).
    #[serde(default)]
    pub exit_condition: Option<String>,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Unique id within the graph.
    pub id: EdgeId,
    /// Source node id.
    pub from: NodeId,
    /// Target node id.
    pub to: NodeId,
    /// Edge type, fixing routing treatment.
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    /// Optional condition expression (spec §4.1 DSL).
    #[serde(default)]
    pub condition: Option<String>,
    /// Explicit priority; defaults to the edge's ordinal among its source
    /// node's outgoing edges if not set (spec §3).
    #[serde(default)]
    pub priority: Option<i64>,
    /// Marks this edge as the default choice among edges whose condition
    /// evaluates true (spec §4.3 step 5).
    #[serde(default)]
    pub is_default: bool,
}

/// Per-graph routing policy (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Global ceiling on any single node's iteration count.
    pub max_loop_iterations: u32,
    /// Maximum depth of the interruption stack.
    #[serde(default = "Policy::default_max_stack_depth")]
    pub max_stack_depth: usize,
    /// Confidence floor below which a tie-breaker result is rejected.
    #[serde(default = "Policy::default_tiebreaker_confidence_threshold")]
    pub tiebreaker_confidence_threshold: f64,
    /// Tie-breaker call budget, in milliseconds.
    #[serde(default = "Policy::default_tiebreaker_timeout_ms")]
    pub tiebreaker_timeout_ms: u64,
}

impl Policy {
    fn default_max_stack_depth() -> usize {
        3
    }
    fn default_tiebreaker_confidence_threshold() -> f64 {
        0.7
    }
    fn default_tiebreaker_timeout_ms() -> u64 {
        30_000
    }

    /// `max_total_steps = node_count * 10`, the safety net from spec §3.
    pub fn max_total_steps(&self, node_count: usize) -> u64 {
        (node_count as u64) * 10
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_loop_iterations: 3,
            max_stack_depth: Policy::default_max_stack_depth(),
            tiebreaker_confidence_threshold: Policy::default_tiebreaker_confidence_threshold(),
            tiebreaker_timeout_ms: Policy::default_tiebreaker_timeout_ms(),
        }
    }
}

/// An immutable, validated flow graph.
///
/// Construct via [`FlowGraph::compile`]; there is no public constructor that
/// skips validation, so every `FlowGraph` a kernel ever sees has already
/// satisfied the invariants of spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraph {
    /// Flow identifier.
    pub id: String,
    /// Flow version string, opaque to the kernel.
    pub version: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    /// Per-graph policy.
    pub policy: Policy,

    #[serde(skip)]
    node_index: HashMap<NodeId, usize>,
    /// Outgoing edges per node, pre-sorted into authoring order — this *is*
    /// the deterministic tie-break order spec §3 requires.
    #[serde(skip)]
    outgoing: HashMap<NodeId, Vec<usize>>,
}

impl FlowGraph {
    /// Validate and index a raw graph, producing an immutable [`FlowGraph`].
    ///
    /// Checks, in order: exactly one START node, at least one TERMINAL node,
    /// unique node/edge ids, every edge endpoint resolves, no self-loop
    /// unless the edge is `loop`-typed.
    pub fn compile(id: impl Into<String>, version: impl Into<String>, nodes: Vec<Node>, edges: Vec<Edge>, policy: Policy) -> Result<Self> {
        let mut node_index = HashMap::with_capacity(nodes.len());
        let mut seen_node_ids = HashSet::with_capacity(nodes.len());
        let mut start_count = 0usize;
        let mut terminal_count = 0usize;

        for (i, node) in nodes.iter().enumerate() {
            if !seen_node_ids.insert(node.id.clone()) {
                return Err(CoreError::GraphInvalid(format!("duplicate node id '{}'", node.id)));
            }
            if node.is_start {
                start_count += 1;
            }
            if node.is_terminal {
                terminal_count += 1;
            }
            node_index.insert(node.id.clone(), i);
        }

        if start_count != 1 {
            return Err(CoreError::GraphInvalid(format!(
                "expected exactly one START node, found {start_count}"
            )));
        }
        if terminal_count == 0 {
            return Err(CoreError::GraphInvalid("graph has no TERMINAL node".into()));
        }

        let mut seen_edge_ids = HashSet::with_capacity(edges.len());
        let mut outgoing: HashMap<NodeId, Vec<usize>> = HashMap::new();

        for (i, edge) in edges.iter().enumerate() {
            if !seen_edge_ids.insert(edge.id.clone()) {
                return Err(CoreError::GraphInvalid(format!("duplicate edge id '{}'", edge.id)));
            }
            if !node_index.contains_key(&edge.from) {
                return Err(CoreError::GraphInvalid(format!(
                    "edge '{}' has unknown source node '{}'",
                    edge.id, edge.from
                )));
            }
            if !node_index.contains_key(&edge.to) {
                return Err(CoreError::GraphInvalid(format!(
                    "edge '{}' has unknown target node '{}'",
                    edge.id, edge.to
                )));
            }
            if edge.from == edge.to && edge.edge_type != EdgeType::Loop {
                return Err(CoreError::GraphInvalid(format!(
                    "edge '{}' is a self-loop but is not typed 'loop'",
                    edge.id
                )));
            }
            outgoing.entry(edge.from.clone()).or_default().push(i);
        }

        // Authoring order within each node's outgoing set is preserved as-is
        // (edges were pushed in input order above); this is the deterministic
        // tie-break order per spec §3.
        Ok(Self {
            id: id.into(),
            version: version.into(),
            nodes,
            edges,
            policy,
            node_index,
            outgoing,
        })
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_index.get(id).map(|&i| &self.nodes[i])
    }

    /// The single START node.
    pub fn start_node(&self) -> &Node {
        self.nodes
            .iter()
            .find(|n| n.is_start)
            .expect("compile() guarantees exactly one START node")
    }

    /// All outgoing edges from `node_id`, in authoring order (priority
    /// resolution happens in the candidate generator, not here).
    pub fn edges_from(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(node_id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    /// Look up an edge by id.
    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// Total node count, used for `Policy::max_total_steps`.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Iterate all edges.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    /// `true` if `node_id` is inside a microloop: it has a `loop`-typed
    /// self-edge or a `loop`-typed incoming edge (spec §4.3 step 3).
    pub fn is_in_microloop(&self, node_id: &str) -> bool {
        self.edges_from(node_id).any(|e| e.edge_type == EdgeType::Loop)
            || self
                .edges
                .iter()
                .any(|e| e.to == node_id && e.edge_type == EdgeType::Loop)
    }

    /// Resolved `max_iterations` for a node: the node-level override if
    /// present, else the policy global ceiling.
    pub fn resolved_max_iterations(&self, node_id: &str) -> u32 {
        self.node(node_id)
            .and_then(|n| n.max_iterations)
            .unwrap_or(self.policy.max_loop_iterations)
    }
}
