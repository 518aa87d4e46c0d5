//! The append-only `Event` record (spec §3, §4.8) and its closed kind set.

use crate::router::RouteDecision;
use crate::state::{InjectedBy, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of event kinds (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    RunCreated { flow_id: String },
    RunStarted,
    RunPaused,
    RunResumed,
    RunCancelled,
    RunCompleted { status: RunStatus },
    StepStart { node_id: String, iteration: u64 },
    StepEnd { node_id: String, iteration: u64 },
    StepError { node_id: String, error_kind: String },
    ToolStart { node_id: String, tool: String },
    ToolEnd { node_id: String, tool: String },
    RoutingDecision { decision: RouteDecision },
    RoutingOffroad { decision: RouteDecision },
    StackPush { injected_node_id: String, origin_node_id: String, injected_by: InjectedBy },
    StackPop { injected_node_id: String, resume_edge_id: String },
    StackOverflowPrevented { attempted_node_id: String },
    FlowInjected { detour_flow_id: String },
    NodeInjected { node_id: String, position: String },
    StreamGap { last_contiguous_seq: u64 },
    Heartbeat,
}

/// One append-only record in a run's event log, ordered by `(run_id, seq)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: String,
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(run_id: impl Into<String>, seq: u64, at: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            run_id: run_id.into(),
            seq,
            at,
            kind,
        }
    }
}
