//! Request/response DTOs for the external API (spec §6 verb table).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use stepflow_core::RunStatus;

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub flow_id: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct RunHandle {
    pub run_id: String,
    pub etag: String,
}

/// The subset of `RunState` worth exposing verbatim to an external caller.
#[derive(Debug, Serialize)]
pub struct RunStateView {
    pub run_id: String,
    pub flow_id: String,
    pub status: RunStatus,
    pub current_node_id: Option<String>,
    pub step_count: u64,
    pub stack_depth: usize,
    pub needs_human: bool,
    pub etag: String,
}

/// Body for `pause`/`resume`/`cancel`: an `If-Match`-style etag the caller
/// last observed (spec §4.4).
#[derive(Debug, Deserialize)]
pub struct EtagRequest {
    pub etag: String,
}

#[derive(Debug, Serialize)]
pub struct EtagResponse {
    pub etag: String,
}

/// Where to splice an injected node relative to the run's current position
/// (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectPosition {
    BeforeNext,
    AfterCurrent,
}

#[derive(Debug, Deserialize)]
pub struct InjectNodeRequest {
    pub etag: String,
    pub node_id: String,
    pub position: InjectPosition,
}

#[derive(Debug, Deserialize)]
pub struct InterruptRequest {
    pub etag: String,
    pub detour_flow_id: String,
    #[serde(default)]
    pub resume_after: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListRunsQuery {
    pub status: Option<RunStatus>,
    pub flow_id_prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub flow_id: String,
    pub status: RunStatus,
    pub step_count: u64,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SubscribeQuery {
    pub from_seq: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_runs: usize,
}
