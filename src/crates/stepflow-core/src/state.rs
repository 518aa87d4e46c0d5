//! `RunState`: the single mutable record the kernel owns for one run.

use crate::graph::EdgeId;
use crate::node_result::{Envelope, NodeStatus};
use crate::router::RouteDecision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a run (spec §3, state machine in §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
    Partial,
}

impl RunStatus {
    /// A run in one of these statuses never executes again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Partial
        )
    }
}

/// Who requested a detour injection (spec §3 `StackFrame`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectedBy {
    Operator,
    Policy,
    ErrorHandler,
}

/// One frame of the LIFO interruption stack (C5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackFrame {
    pub injected_node_id: String,
    pub origin_node_id: String,
    /// Edge to take once the injected node completes and is popped.
    pub resume_edge_id: EdgeId,
    pub injected_by: InjectedBy,
    pub created_at: DateTime<Utc>,
}

/// A per-run lease used to enforce single-writer ownership of `run_state`
/// and `event_log` across crash-recovery (spec §5 shared-resource policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub owner_token: String,
    pub lease_expires_at: DateTime<Utc>,
}

/// The mutable, exclusively-kernel-owned state of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub flow_id: String,
    pub status: RunStatus,
    /// Null only at terminal states.
    pub current_node_id: Option<String>,
    pub iteration_counts: HashMap<String, u64>,
    pub step_count: u64,
    pub interruption_stack: Vec<StackFrame>,
    /// Compact projection of the previous tick's routing decision, consulted
    /// by the router on the next tick for audit continuity.
    #[serde(default)]
    pub last_routing_audit: Option<RouteDecision>,
    /// Compact projection of the previous node's envelope, fed into the
    /// routing context as `envelope.*`.
    #[serde(default)]
    pub last_envelope: Option<Envelope>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub lease: Option<Lease>,
    /// Set once a node has been executed on the current visit, cleared on
    /// advance; lets the kernel tell "just arrived" from "already ran"
    /// (spec §4.7 step 4).
    #[serde(default)]
    pub current_node_executed: bool,
    /// Outcome of the current node's most recent execution, consulted by
    /// the candidate generator's pop-stack check (spec §4.5: a failed
    /// injected node does not auto-pop).
    #[serde(default)]
    pub last_node_status: Option<NodeStatus>,
    /// Set by the router/kernel when a decision should surface to an
    /// operator (tie-break fallback, stack overflow, oracle unavailable).
    #[serde(default)]
    pub needs_human: bool,
}

impl RunState {
    /// A freshly created run, positioned at `start_node_id`.
    pub fn new(run_id: impl Into<String>, flow_id: impl Into<String>, start_node_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            flow_id: flow_id.into(),
            status: RunStatus::Created,
            current_node_id: Some(start_node_id.into()),
            iteration_counts: HashMap::new(),
            step_count: 0,
            interruption_stack: Vec::new(),
            last_routing_audit: None,
            last_envelope: None,
            created_at: now,
            updated_at: now,
            lease: None,
            current_node_executed: false,
            last_node_status: None,
            needs_human: false,
        }
    }

    /// Current iteration count for a node, defaulting to 0.
    pub fn iteration_count(&self, node_id: &str) -> u64 {
        self.iteration_counts.get(node_id).copied().unwrap_or(0)
    }

    /// Depth of the interruption stack.
    pub fn stack_depth(&self) -> usize {
        self.interruption_stack.len()
    }

    /// Push a detour frame. Fails by returning `false` (caller decides the
    /// `stack_overflow_prevented` emission) rather than an error type, since
    /// overflow is an expected, policy-governed outcome, not an exceptional
    /// one (spec §4.5).
    pub fn push_frame(&mut self, frame: StackFrame, max_depth: usize) -> bool {
        if self.interruption_stack.len() >= max_depth {
            return false;
        }
        self.interruption_stack.push(frame);
        true
    }

    /// Pop the top frame, if any.
    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        self.interruption_stack.pop()
    }

    /// The top frame without removing it.
    pub fn peek_frame(&self) -> Option<&StackFrame> {
        self.interruption_stack.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn new_run_starts_at_created() {
        let rs = RunState::new("r1", "f1", "A", now());
        assert_eq!(rs.status, RunStatus::Created);
        assert_eq!(rs.current_node_id.as_deref(), Some("A"));
        assert_eq!(rs.step_count, 0);
    }

    #[test]
    fn push_respects_max_depth() {
        let mut rs = RunState::new("r1", "f1", "A", now());
        let frame = |n: &str| StackFrame {
            injected_node_id: n.into(),
            origin_node_id: "A".into(),
            resume_edge_id: "e1".into(),
            injected_by: InjectedBy::Operator,
            created_at: now(),
        };
        assert!(rs.push_frame(frame("D1"), 2));
        assert!(rs.push_frame(frame("D2"), 2));
        assert!(!rs.push_frame(frame("D3"), 2));
        assert_eq!(rs.stack_depth(), 2);
    }

    #[test]
    fn pop_returns_lifo_order() {
        let mut rs = RunState::new("r1", "f1", "A", now());
        let frame = |n: &str| StackFrame {
            injected_node_id: n.into(),
            origin_node_id: "A".into(),
            resume_edge_id: "e1".into(),
            injected_by: InjectedBy::Policy,
            created_at: now(),
        };
        rs.push_frame(frame("D1"), 3);
        rs.push_frame(frame("D2"), 3);
        assert_eq!(rs.pop_frame().unwrap().injected_node_id, "D2");
        assert_eq!(rs.pop_frame().unwrap().injected_node_id, "D1");
        assert!(rs.pop_frame().is_none());
    }
}
