//! Types returned by the engine adapter (C6) after executing a node.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Outcome of a single node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Verification status of a node's output, the primary signal the router's
/// microloop exit check looks at (spec §4.3 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Verified,
    Unverified,
    Blocked,
    Partial,
}

/// Opaque execution metadata. Never consulted by routing except through the
/// `receipt.*` dotted paths an author opted into via an edge condition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Receipt {
    /// Wall-clock duration of the node execution, in milliseconds.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Token usage, if the station is LLM-backed.
    #[serde(default)]
    pub tokens: Option<u64>,
    /// Set when the node failed; one of the closed error-kind taxonomy
    /// strings (spec §7), e.g. `"EngineTransient"`.
    #[serde(default)]
    pub error_kind: Option<String>,
    /// Any additional fields the engine chose to report, preserved verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// The routing-relevant summary of a node execution (spec glossary:
/// "Envelope"). A closed-schema record per spec §9: unknown fields are
/// preserved but never consulted except through dotted paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub verification_status: VerificationStatus,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    pub can_further_iteration_help: bool,
    /// Explicit hint at the next node id (spec §4.3 step 4).
    #[serde(default)]
    pub next_node_id: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    /// Opaque references into the artifact/filesystem layer.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Additional author-opted-in fields, reachable from expressions via
    /// `envelope.<field>` dotted paths.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            verification_status: VerificationStatus::Unverified,
            confidence: 0.0,
            can_further_iteration_help: true,
            next_node_id: None,
            summary: None,
            artifacts: Vec::new(),
            extra: HashMap::new(),
        }
    }
}

/// What the engine adapter (C6) returns for one node execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: NodeStatus,
    #[serde(default)]
    pub receipt: Receipt,
    #[serde(default)]
    pub envelope: Envelope,
}

impl NodeResult {
    /// Convenience constructor for a verified success, the common case in
    /// tests and in the happy path of S1.
    pub fn succeeded(envelope: Envelope) -> Self {
        Self {
            status: NodeStatus::Succeeded,
            receipt: Receipt::default(),
            envelope,
        }
    }

    /// Convenience constructor for an engine failure, carrying the error
    /// kind the kernel will surface in `step_error`.
    pub fn failed(error_kind: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Failed,
            receipt: Receipt {
                error_kind: Some(error_kind.into()),
                ..Receipt::default()
            },
            envelope: Envelope::default(),
        }
    }
}
