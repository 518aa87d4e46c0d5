//! Engine Adapter (C6): the only component permitted to block on external
//! I/O. The kernel treats it as opaque — any failure surface maps to a
//! `NodeResult{status: failed}` or a retryable transient signal.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use stepflow_core::NodeResult;
use tokio_util::sync::CancellationToken;

/// Everything the adapter needs to execute one node: the resolved station
/// template, parameters, and references to artifacts produced earlier in
/// the run. Opaque to the kernel beyond these fields.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: String,
    pub node_id: String,
    pub station: String,
    pub iteration: u64,
    pub params: HashMap<String, Value>,
    pub artifacts: Vec<String>,
}

/// Outcome of one engine invocation. `Transient` signals the kernel should
/// retry once with backoff before converting to a failed `NodeResult`
/// (spec §7 `EngineTransient` → one retry → `EngineFailed`).
pub enum EngineOutcome {
    Result(NodeResult),
    Transient(String),
}

#[async_trait]
pub trait EngineAdapter: Send + Sync {
    async fn execute(&self, ctx: &NodeContext, cancel: CancellationToken) -> EngineOutcome;
}

/// A scripted adapter for deterministic tests (spec §10.4): returns queued
/// `NodeResult`s by `(node_id, call_index)` in the order supplied, regardless
/// of context. Grounded on the teacher's pattern of exhaustively testing the
/// execution engine against hand-built fixtures rather than a live LLM.
pub struct ScriptedEngine {
    scripts: parking_lot::Mutex<HashMap<String, std::collections::VecDeque<NodeResult>>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            scripts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Queue the results a node should return on successive executions, in order.
    pub fn push(&self, node_id: impl Into<String>, results: Vec<NodeResult>) {
        self.scripts
            .lock()
            .entry(node_id.into())
            .or_default()
            .extend(results);
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineAdapter for ScriptedEngine {
    async fn execute(&self, ctx: &NodeContext, _cancel: CancellationToken) -> EngineOutcome {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(&ctx.node_id).and_then(|q| q.pop_front()) {
            Some(result) => EngineOutcome::Result(result),
            None => EngineOutcome::Result(NodeResult::failed("no_script".to_string())),
        }
    }
}
