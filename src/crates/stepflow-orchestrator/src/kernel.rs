//! Orchestrator Kernel (C7): the tick loop that turns one `RunState` plus a
//! `FlowGraph` into a sequence of checkpoints and events.
//!
//! One [`Kernel`] drives exactly one run, matching the per-run
//! single-threaded cooperative scheduling model: nothing here is shared
//! across runs except the event bus and the store root.

use crate::engine::{EngineAdapter, EngineOutcome, NodeContext};
use crate::error::{OrchestratorError, Result};
use crate::events::EventBus;
use crate::oracle::TieBreakOracle;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stepflow_core::candidate::{generate_candidates, POP_STACK_EDGE_ID};
use stepflow_core::expr::{ExprCache, RoutingContext};
use stepflow_core::node_result::{NodeStatus, Receipt};
use stepflow_core::router::{reason_codes, route, RouteInput, RouteOutcome};
use stepflow_core::{Event, EventKind, FlowGraph, RunState, RunStatus};
use stepflow_store::StateStore;
use tokio_util::sync::CancellationToken;

/// How long an in-flight engine call gets to wind down after cancellation
/// before it's marked `EngineTimeout` (spec §4.7 "Cancellation & timeouts").
const ENGINE_WIND_DOWN: Duration = Duration::from_secs(5);

/// What happened on one call to [`Kernel::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The run has more work; call `tick` again.
    Continue,
    /// The run stopped driving itself — paused, cancelled, or terminal.
    Suspended(RunStatus),
}

/// Drives one run to completion, one tick at a time.
pub struct Kernel {
    run_id: String,
    graph: Arc<FlowGraph>,
    store: Arc<StateStore>,
    engine: Arc<dyn EngineAdapter>,
    oracle: Arc<dyn TieBreakOracle>,
    events: EventBus,
    expr_cache: ExprCache,
    params: HashMap<String, Value>,
}

impl Kernel {
    pub fn new(
        run_id: impl Into<String>,
        graph: Arc<FlowGraph>,
        store: Arc<StateStore>,
        engine: Arc<dyn EngineAdapter>,
        oracle: Arc<dyn TieBreakOracle>,
        events: EventBus,
        params: HashMap<String, Value>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            graph,
            store,
            engine,
            oracle,
            events,
            expr_cache: ExprCache::new(),
            params,
        }
    }

    /// Tick until the run suspends (paused, cancelled, or reaches a
    /// terminal status). Assumes `RunState` has already been created via
    /// `StateStore::create`.
    pub async fn drive(&self, cancel: CancellationToken) -> Result<RunStatus> {
        loop {
            match self.tick(&cancel).await? {
                TickOutcome::Continue => continue,
                TickOutcome::Suspended(status) => return Ok(status),
            }
        }
    }

    async fn emit(&self, kind: EventKind) -> Result<()> {
        let seq = self.events.next_seq(&self.run_id);
        let event = Event::new(self.run_id.clone(), seq, Utc::now(), kind);
        self.store.append_event(&event).await?;
        self.events.publish(event);
        Ok(())
    }

    async fn checkpoint(&self, state: &RunState, etag: &str) -> Result<String> {
        Ok(self.store.compare_and_swap(etag, state).await?)
    }

    async fn execute_with_retry(&self, ctx: &NodeContext, cancel: &CancellationToken) -> stepflow_core::NodeResult {
        match self.run_engine(ctx, cancel).await {
            EngineOutcome::Result(result) => result,
            EngineOutcome::Transient(_reason) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                match self.run_engine(ctx, cancel).await {
                    EngineOutcome::Result(result) => result,
                    EngineOutcome::Transient(_reason) => stepflow_core::NodeResult::failed("EngineFailed"),
                }
            }
        }
    }

    /// Runs one engine call, honoring the cancellation wind-down budget: once
    /// `cancel` fires, the in-flight call gets `ENGINE_WIND_DOWN` to return
    /// before it's given up on and marked `EngineTimeout`.
    async fn run_engine(&self, ctx: &NodeContext, cancel: &CancellationToken) -> EngineOutcome {
        let exec = self.engine.execute(ctx, cancel.clone());
        tokio::pin!(exec);
        tokio::select! {
            outcome = &mut exec => outcome,
            _ = cancel.cancelled() => match tokio::time::timeout(ENGINE_WIND_DOWN, &mut exec).await {
                Ok(outcome) => outcome,
                Err(_) => EngineOutcome::Result(stepflow_core::NodeResult::failed("EngineTimeout")),
            },
        }
    }

    /// One step of the state machine described in spec §4.7.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickOutcome> {
        let loaded = self.store.load().await?;
        let mut state = loaded.state;
        let mut etag = loaded.etag;

        if state.status.is_terminal() {
            return Ok(TickOutcome::Suspended(state.status));
        }
        if state.status == RunStatus::Paused {
            return Ok(TickOutcome::Suspended(state.status));
        }

        if cancel.is_cancelled() {
            state.status = RunStatus::Cancelled;
            state.current_node_id = None;
            let _ = self.checkpoint(&state, &etag).await?;
            self.emit(EventKind::RunCancelled).await?;
            self.emit(EventKind::RunCompleted { status: state.status }).await?;
            self.events.close(&self.run_id);
            return Ok(TickOutcome::Suspended(state.status));
        }

        if state.status == RunStatus::Created {
            state.status = RunStatus::Running;
            self.emit(EventKind::RunStarted).await?;
        }

        let current_node_id = state.current_node_id.clone().ok_or_else(|| OrchestratorError::IllegalTransition {
            run_id: self.run_id.clone(),
            reason: "non-terminal run has no current_node_id".to_string(),
        })?;
        let node = self
            .graph
            .node(&current_node_id)
            .ok_or_else(|| OrchestratorError::InvalidSpec(format!("unknown node '{current_node_id}'")))?
            .clone();

        let mut receipt_for_route: Option<Receipt> = None;

        if !state.current_node_executed {
            state.step_count += 1;
            let iteration = state.iteration_count(&current_node_id);
            self.emit(EventKind::StepStart {
                node_id: current_node_id.clone(),
                iteration,
            })
            .await?;

            let ctx = NodeContext {
                run_id: self.run_id.clone(),
                node_id: current_node_id.clone(),
                station: node.station.clone(),
                iteration,
                params: self.params.clone(),
                artifacts: state.last_envelope.as_ref().map(|e| e.artifacts.clone()).unwrap_or_default(),
            };
            let result = self.execute_with_retry(&ctx, cancel).await;

            *state.iteration_counts.entry(current_node_id.clone()).or_insert(0) += 1;
            state.current_node_executed = true;
            state.last_node_status = Some(result.status);
            state.last_envelope = Some(result.envelope.clone());
            receipt_for_route = Some(result.receipt.clone());

            match result.status {
                NodeStatus::Failed => {
                    self.emit(EventKind::StepError {
                        node_id: current_node_id.clone(),
                        error_kind: result.receipt.error_kind.clone().unwrap_or_else(|| "unknown".to_string()),
                    })
                    .await?;
                }
                NodeStatus::Succeeded | NodeStatus::Skipped => {
                    self.emit(EventKind::StepEnd {
                        node_id: current_node_id.clone(),
                        iteration,
                    })
                    .await?;
                }
            }

            // Checkpoint between execute and route so a crash here never
            // re-executes the same node on resume (spec §8 property 7).
            etag = self.checkpoint(&state, &etag).await?;
        }

        if node.is_terminal {
            state.status = if state.last_node_status == Some(NodeStatus::Failed) {
                RunStatus::Failed
            } else {
                RunStatus::Succeeded
            };
            state.current_node_id = None;
            let _ = self.checkpoint(&state, &etag).await?;
            self.emit(EventKind::RunCompleted { status: state.status }).await?;
            self.events.close(&self.run_id);
            return Ok(TickOutcome::Suspended(state.status));
        }

        // The pop-stack check only applies once the sitting node has
        // actually finished; before that, `last_node_status` may still
        // describe a different, earlier node.
        let last_status_for_candidates = if state.current_node_executed {
            state.last_node_status
        } else {
            None
        };
        let candidates = generate_candidates(&self.graph, &current_node_id, last_status_for_candidates, &state);
        let default_candidate_id = candidates.first().map(|c| c.edge_id.clone());
        let max_total_steps = self.graph.policy.max_total_steps(self.graph.node_count());

        let input = RouteInput {
            graph: &self.graph,
            current_node_id: &current_node_id,
            candidates: candidates.clone(),
            envelope: state.last_envelope.as_ref(),
            receipt: receipt_for_route.as_ref(),
            iteration: state.iteration_count(&current_node_id),
            step_count: state.step_count,
            max_total_steps,
            has_errors: state.last_node_status == Some(NodeStatus::Failed),
        };
        let exit_condition_expr = node.exit_condition.as_deref();
        let outcome = route(input, &self.expr_cache, exit_condition_expr)?;

        let decision = match outcome {
            RouteOutcome::Decided(d) => d,
            RouteOutcome::NeedsTieBreak(pending) => {
                let context = build_routing_context(&state, &current_node_id, &self.graph);
                let budget_ms = self.graph.policy.tiebreaker_timeout_ms;
                let oracle_result = self.oracle.tiebreak(&candidates, &context, budget_ms).await;
                pending.resolve(oracle_result)
            }
        };

        state.last_routing_audit = Some(decision.clone());
        state.needs_human = decision.needs_human;

        self.emit(EventKind::RoutingDecision { decision: decision.clone() }).await?;
        let is_offroad = decision.chosen_candidate_id != default_candidate_id;
        if is_offroad && decision.chosen_candidate_id.is_some() {
            self.emit(EventKind::RoutingOffroad { decision: decision.clone() }).await?;
        }

        let chosen = decision
            .chosen_candidate_id
            .as_ref()
            .and_then(|id| candidates.iter().find(|c| &c.edge_id == id));

        let chosen = match chosen {
            None => {
                if decision.reason_code == reason_codes::SAFETY_STEP_CAP {
                    state.status = RunStatus::Partial;
                    state.current_node_id = None;
                    let _ = self.checkpoint(&state, &etag).await?;
                    self.emit(EventKind::RunCompleted { status: state.status }).await?;
                    self.events.close(&self.run_id);
                    return Ok(TickOutcome::Suspended(state.status));
                }
                state.status = RunStatus::Paused;
                let _ = self.checkpoint(&state, &etag).await?;
                self.emit(EventKind::RunPaused).await?;
                return Ok(TickOutcome::Suspended(state.status));
            }
            Some(c) => c.clone(),
        };

        if chosen.edge_id == POP_STACK_EDGE_ID {
            if let Some(frame) = state.pop_frame() {
                self.emit(EventKind::StackPop {
                    injected_node_id: frame.injected_node_id,
                    resume_edge_id: frame.resume_edge_id,
                })
                .await?;
            }
        }
        state.current_node_id = Some(chosen.to.clone());
        state.current_node_executed = false;

        let _ = self.checkpoint(&state, &etag).await?;
        Ok(TickOutcome::Continue)
    }
}

/// Rebuild the routing context the oracle sees, mirroring the router's
/// internal view (status/confidence/envelope/receipt/iteration caps) — kept
/// here rather than shared because the router intentionally keeps its own
/// context assembly private to its own decision chain.
fn build_routing_context(state: &RunState, current_node_id: &str, graph: &FlowGraph) -> RoutingContext {
    let mut ctx = RoutingContext::new();
    ctx.set("iteration", state.iteration_count(current_node_id) as i64);
    ctx.set("max_iterations", graph.resolved_max_iterations(current_node_id) as i64);
    ctx.set("has_errors", state.last_node_status == Some(NodeStatus::Failed));
    ctx.set("run", serde_json::json!({ "step_count": state.step_count }));
    if let Some(envelope) = &state.last_envelope {
        ctx.set(
            "status",
            serde_json::to_value(envelope.verification_status).unwrap_or(Value::Null),
        );
        ctx.set("confidence", envelope.confidence);
        ctx.set("envelope", serde_json::to_value(envelope).unwrap_or(Value::Null));
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptedEngine;
    use crate::oracle::ScriptedOracle;
    use stepflow_core::graph::{Edge, EdgeType, Node, Policy};
    use stepflow_core::node_result::{Envelope, NodeResult, VerificationStatus};
    use stepflow_core::state::{InjectedBy, StackFrame};

    fn policy() -> Policy {
        Policy {
            max_loop_iterations: 3,
            max_stack_depth: 3,
            tiebreaker_confidence_threshold: 0.7,
            tiebreaker_timeout_ms: 1_000,
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

    fn seq_edge(id: &str, from: &str, to: &str) -> Edge {
        Edge {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            edge_type: EdgeType::Sequence,
            condition: None,
            priority: None,
            is_default: false,
        }
    }

    fn verified(confidence: f64) -> Envelope {
        Envelope {
            verification_status: VerificationStatus::Verified,
            confidence,
            can_further_iteration_help: true,
            ..Envelope::default()
        }
    }

    async fn kernel_for(
        run_id: &str,
        runs_root: &std::path::Path,
        graph: FlowGraph,
        engine: Arc<ScriptedEngine>,
        oracle: Arc<dyn TieBreakOracle>,
    ) -> Kernel {
        let store = Arc::new(StateStore::new(runs_root, run_id));
        let start = graph.start_node().id.clone();
        let run = RunState::new(run_id.to_string(), graph.id.clone(), start, Utc::now());
        store.create(&run).await.unwrap();
        Kernel::new(run_id.to_string(), Arc::new(graph), store, engine, oracle, EventBus::new(), HashMap::new())
    }

    #[tokio::test]
    async fn s1_linear_happy_path_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = vec![node("A", true, false), node("B", false, false), node("C", false, true)];
        let edges = vec![seq_edge("e1", "A", "B"), seq_edge("e2", "B", "C")];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();

        let engine = Arc::new(ScriptedEngine::new());
        engine.push("A", vec![NodeResult::succeeded(verified(0.9))]);
        engine.push("B", vec![NodeResult::succeeded(verified(0.9))]);
        engine.push("C", vec![NodeResult::succeeded(verified(0.9))]);

        let oracle = Arc::new(ScriptedOracle::unavailable());
        let kernel = kernel_for("r1", dir.path(), graph, engine, oracle).await;

        let status = kernel.drive(CancellationToken::new()).await.unwrap();
        assert_eq!(status, RunStatus::Succeeded);

        let loaded = kernel.store.load().await.unwrap();
        assert_eq!(loaded.state.step_count, 3);
    }

    #[tokio::test]
    async fn s5_tie_break_picks_oracle_choice() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = vec![node("A", true, false), node("B", false, true), node("C", false, true)];
        let edges = vec![seq_edge("to_b", "A", "B"), seq_edge("to_c", "A", "C")];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();

        let engine = Arc::new(ScriptedEngine::new());
        engine.push("A", vec![NodeResult::succeeded(verified(0.5))]);
        engine.push("B", vec![NodeResult::succeeded(verified(0.9))]);

        let oracle = Arc::new(ScriptedOracle::always_choose("to_b", 0.9));
        let kernel = kernel_for("r2", dir.path(), graph, engine, oracle).await;

        let status = kernel.drive(CancellationToken::new()).await.unwrap();
        assert_eq!(status, RunStatus::Succeeded);

        let loaded = kernel.store.load().await.unwrap();
        let audit = loaded.state.last_routing_audit.unwrap();
        assert!(audit.tie_breaker_used);
    }

    #[tokio::test]
    async fn pop_stack_resumes_after_injected_node_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = vec![node("A", true, false), node("D", false, false), node("B", false, true)];
        let edges = vec![seq_edge("resume", "A", "B")];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();

        let engine = Arc::new(ScriptedEngine::new());
        engine.push("D", vec![NodeResult::succeeded(verified(0.9))]);
        engine.push("B", vec![NodeResult::succeeded(verified(0.9))]);

        let store = Arc::new(StateStore::new(dir.path(), "r3"));
        let mut run = RunState::new("r3".to_string(), "f".to_string(), "D".to_string(), Utc::now());
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
        run.status = RunStatus::Running;
        store.create(&run).await.unwrap();

        let kernel = Kernel::new(
            "r3".to_string(),
            Arc::new(graph),
            store,
            engine,
            Arc::new(ScriptedOracle::unavailable()),
            EventBus::new(),
            HashMap::new(),
        );

        let status = kernel.drive(CancellationToken::new()).await.unwrap();
        assert_eq!(status, RunStatus::Succeeded);

        let events = kernel.store.recover_events().await.unwrap();
        assert!(events.iter().any(|e| matches!(e.kind, EventKind::StackPop { .. })));
    }

    #[tokio::test]
    async fn resume_after_execute_does_not_re_execute() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = vec![node("A", true, false), node("B", false, true)];
        let edges = vec![seq_edge("e1", "A", "B")];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();

        let engine = Arc::new(ScriptedEngine::new());
        engine.push("A", vec![NodeResult::succeeded(verified(0.9))]);
        engine.push("B", vec![NodeResult::succeeded(verified(0.9))]);

        let store = Arc::new(StateStore::new(dir.path(), "r4"));
        let mut run = RunState::new("r4".to_string(), "f".to_string(), "A".to_string(), Utc::now());
        run.status = RunStatus::Running;
        run.current_node_executed = true;
        run.last_node_status = Some(NodeStatus::Succeeded);
        run.last_envelope = Some(verified(0.9));
        run.step_count = 1;
        store.create(&run).await.unwrap();

        let kernel = Kernel::new(
            "r4".to_string(),
            Arc::new(graph),
            store,
            engine.clone(),
            Arc::new(ScriptedOracle::unavailable()),
            EventBus::new(),
            HashMap::new(),
        );

        let outcome = kernel.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Continue);

        let loaded = kernel.store.load().await.unwrap();
        assert_eq!(loaded.state.step_count, 1, "resumed tick must not re-execute A");
        assert_eq!(loaded.state.current_node_id.as_deref(), Some("B"));
    }
}
