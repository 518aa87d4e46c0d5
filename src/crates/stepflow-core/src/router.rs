//! C3 — the router: the priority chain that turns a candidate list into one
//! `RouteDecision`.

use crate::candidate::{Candidate, CandidateOrigin, POP_STACK_EDGE_ID};
use crate::error::Result;
use crate::expr::{ExprCache, RoutingContext};
use crate::graph::{EdgeType, FlowGraph};
use crate::node_result::{Envelope, Receipt, VerificationStatus};
use serde::{Deserialize, Serialize};

/// Reason codes used in `RouteDecision::reason_code` and in per-candidate
/// elimination records. Kept as string constants (rather than a closed enum)
/// because `reason_code` is also produced ad hoc for hard-constraint
/// eliminations the evaluator doesn't know about in advance.
pub mod reason_codes {
    pub const SAFETY_STEP_CAP: &str = "SAFETY_STEP_CAP";
    pub const DETERMINISTIC_TERMINAL: &str = "DETERMINISTIC_TERMINAL";
    pub const LOOP_EXIT_VERIFIED: &str = "LOOP_EXIT_VERIFIED";
    pub const LOOP_EXIT_MAX_ITERATIONS: &str = "LOOP_EXIT_MAX_ITERATIONS";
    pub const LOOP_EXIT_CANNOT_ITERATE: &str = "LOOP_EXIT_CANNOT_ITERATE";
    pub const LOOP_EXIT_CONDITION: &str = "LOOP_EXIT_CONDITION";
    pub const EXPLICIT_HINT: &str = "EXPLICIT_HINT";
    pub const EDGE_CONDITION: &str = "EDGE_CONDITION";
    pub const SINGLE_SURVIVOR: &str = "SINGLE_SURVIVOR";
    pub const STACK_POP: &str = "STACK_POP";
    pub const ORACLE_DECIDED: &str = "ORACLE_DECIDED";
    pub const ORACLE_INVALID_CHOICE: &str = "OracleInvalidChoice";
    pub const ORACLE_UNAVAILABLE: &str = "OracleUnavailable";
}

/// How a `RouteDecision` was reached (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    HardConstraint,
    ExitCondition,
    EdgeCondition,
    Deterministic,
    TieBreaker,
}

/// A candidate that did not survive to become the chosen edge, and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EliminatedCandidate {
    pub edge_id: String,
    pub eliminated_reason: String,
}

/// The full audit record for one routing tick (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub chosen_candidate_id: Option<String>,
    pub decision_type: DecisionType,
    pub reason_code: String,
    /// Bounded to 100 characters (spec §3); longer text is truncated.
    pub reason_text: String,
    pub candidates_considered: Vec<EliminatedCandidate>,
    pub confidence: f64,
    pub needs_human: bool,
    pub evaluated_conditions: Vec<String>,
    pub tie_breaker_used: bool,
    pub decision_ms: u64,
}

impl RouteDecision {
    fn reason_text(text: impl Into<String>) -> String {
        let mut s: String = text.into();
        if s.len() > 100 {
            s.truncate(100);
        }
        s
    }
}

/// What the tie-breaker oracle (C6) reports back for one `tiebreak` call.
#[derive(Debug, Clone)]
pub struct TieBreakResult {
    pub chosen_candidate_id: String,
    pub confidence: f64,
    pub reason: String,
}

/// Everything needed to evaluate the priority chain for one node.
pub struct RouteInput<'a> {
    pub graph: &'a FlowGraph,
    pub current_node_id: &'a str,
    pub candidates: Vec<Candidate>,
    pub envelope: Option<&'a Envelope>,
    pub receipt: Option<&'a Receipt>,
    pub iteration: u64,
    pub step_count: u64,
    pub max_total_steps: u64,
    pub has_errors: bool,
}

/// Either a finished decision, or a request for the caller to consult the
/// tie-breaker oracle (spec §4.3 step 7, spec §5 suspension point (d)).
///
/// Splitting the chain here keeps this crate free of any async/I/O
/// dependency: the orchestrator kernel calls the oracle (an `async-trait`
/// method on its engine adapter) and resumes the chain with
/// [`PendingTieBreak::resolve`].
pub enum RouteOutcome {
    Decided(RouteDecision),
    NeedsTieBreak(PendingTieBreak),
}

/// Chain state captured at step 7, to be resumed once the oracle answers
/// (or times out / is unavailable).
pub struct PendingTieBreak {
    survivors: Vec<Candidate>,
    evaluated_conditions: Vec<String>,
    eliminated: Vec<EliminatedCandidate>,
    tiebreaker_confidence_threshold: f64,
}

impl PendingTieBreak {
    /// Candidate ids the oracle is allowed to choose from.
    pub fn candidate_ids(&self) -> Vec<String> {
        self.survivors.iter().map(|c| c.edge_id.clone()).collect()
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.tiebreaker_confidence_threshold
    }

    /// Finish the chain given the oracle's answer (or `None` if it was
    /// unavailable or timed out).
    pub fn resolve(self, oracle: Option<TieBreakResult>) -> RouteDecision {
        let PendingTieBreak {
            survivors,
            evaluated_conditions,
            mut eliminated,
            tiebreaker_confidence_threshold,
        } = self;

        let fallback = || {
            // Highest priority == lowest ordinal == first in our already
            // priority-sorted survivor list.
            survivors.first().expect("PendingTieBreak always has ≥2 survivors")
        };

        match oracle {
            Some(result) if result.confidence >= tiebreaker_confidence_threshold && survivors.iter().any(|c| c.edge_id == result.chosen_candidate_id) => {
                for c in &survivors {
                    if c.edge_id != result.chosen_candidate_id {
                        eliminated.push(EliminatedCandidate {
                            edge_id: c.edge_id.clone(),
                            eliminated_reason: "not_chosen_by_oracle".to_string(),
                        });
                    }
                }
                RouteDecision {
                    chosen_candidate_id: Some(result.chosen_candidate_id),
                    decision_type: DecisionType::TieBreaker,
                    reason_code: reason_codes::ORACLE_DECIDED.to_string(),
                    reason_text: RouteDecision::reason_text(result.reason),
                    candidates_considered: eliminated,
                    confidence: result.confidence,
                    needs_human: false,
                    evaluated_conditions,
                    tie_breaker_used: true,
                    decision_ms: 0,
                }
            }
            Some(result) => {
                // Either low confidence or an id outside the candidate set.
                let invalid_choice = !survivors.iter().any(|c| c.edge_id == result.chosen_candidate_id);
                let reason_code = if invalid_choice {
                    reason_codes::ORACLE_INVALID_CHOICE
                } else {
                    reason_codes::ORACLE_UNAVAILABLE
                };
                let chosen = fallback();
                for c in &survivors {
                    if c.edge_id != chosen.edge_id {
                        eliminated.push(EliminatedCandidate {
                            edge_id: c.edge_id.clone(),
                            eliminated_reason: "lost_tiebreak_fallback".to_string(),
                        });
                    }
                }
                RouteDecision {
                    chosen_candidate_id: Some(chosen.edge_id.clone()),
                    decision_type: DecisionType::TieBreaker,
                    reason_code: reason_code.to_string(),
                    reason_text: RouteDecision::reason_text(format!("oracle result rejected: {reason_code}")),
                    candidates_considered: eliminated,
                    confidence: 0.0,
                    needs_human: true,
                    evaluated_conditions,
                    tie_breaker_used: true,
                    decision_ms: 0,
                }
            }
            None => {
                let chosen = fallback();
                for c in &survivors {
                    if c.edge_id != chosen.edge_id {
                        eliminated.push(EliminatedCandidate {
                            edge_id: c.edge_id.clone(),
                            eliminated_reason: "oracle_unavailable".to_string(),
                        });
                    }
                }
                RouteDecision {
                    chosen_candidate_id: Some(chosen.edge_id.clone()),
                    decision_type: DecisionType::TieBreaker,
                    reason_code: reason_codes::ORACLE_UNAVAILABLE.to_string(),
                    reason_text: RouteDecision::reason_text("tie-breaker oracle unavailable or timed out"),
                    candidates_considered: eliminated,
                    confidence: 0.0,
                    needs_human: true,
                    evaluated_conditions,
                    tie_breaker_used: true,
                    decision_ms: 0,
                }
            }
        }
    }
}

fn build_context(input: &RouteInput) -> RoutingContext {
    let mut ctx = RoutingContext::new();
    ctx.set("iteration", input.iteration as i64);
    ctx.set(
        "max_iterations",
        input.graph.resolved_max_iterations(input.current_node_id) as i64,
    );
    ctx.set("has_errors", input.has_errors);
    ctx.set("run", serde_json::json!({ "step_count": input.step_count }));
    if let Some(envelope) = input.envelope {
        ctx.set(
            "status",
            serde_json::to_value(envelope.verification_status).unwrap_or(serde_json::Value::Null),
        );
        ctx.set("confidence", envelope.confidence);
        ctx.set(
            "envelope",
            serde_json::to_value(envelope).unwrap_or(serde_json::Value::Null),
        );
    }
    if let Some(receipt) = input.receipt {
        ctx.set(
            "receipt",
            serde_json::to_value(receipt).unwrap_or(serde_json::Value::Null),
        );
    }
    ctx
}

/// Run the priority chain (spec §4.3) to completion or to the tie-break
/// suspension point.
pub fn route(input: RouteInput, expr_cache: &ExprCache, exit_condition_expr: Option<&str>) -> Result<RouteOutcome> {
    let started = std::time::Instant::now();
    let ctx = build_context(&input);
    let mut eliminated: Vec<EliminatedCandidate> = Vec::new();
    let mut evaluated_conditions: Vec<String> = Vec::new();
    let mut candidates = input.candidates;

    // Step 1: hard constraints. Candidates are defensively re-checked
    // against the graph even though load-time validation should make a
    // dangling target impossible.
    candidates.retain(|c| {
        let ok = input.graph.node(&c.to).is_some() || c.edge_id == POP_STACK_EDGE_ID;
        if !ok {
            eliminated.push(EliminatedCandidate {
                edge_id: c.edge_id.clone(),
                eliminated_reason: "dangling_target".to_string(),
            });
        }
        ok
    });

    let decide = |chosen: Option<&Candidate>,
                  decision_type: DecisionType,
                  reason_code: &str,
                  reason_text: &str,
                  confidence: f64,
                  needs_human: bool,
                  eliminated: Vec<EliminatedCandidate>,
                  evaluated_conditions: Vec<String>| RouteDecision {
        chosen_candidate_id: chosen.map(|c| c.edge_id.clone()),
        decision_type,
        reason_code: reason_code.to_string(),
        reason_text: RouteDecision::reason_text(reason_text),
        candidates_considered: eliminated,
        confidence,
        needs_human,
        evaluated_conditions,
        tie_breaker_used: false,
        decision_ms: started.elapsed().as_millis() as u64,
    };

    // Step 2: safety step cap, and the terminal short-circuit.
    if input.step_count >= input.max_total_steps {
        return Ok(RouteOutcome::Decided(decide(
            None,
            DecisionType::Deterministic,
            reason_codes::SAFETY_STEP_CAP,
            "step count reached policy.max_total_steps",
            1.0,
            false,
            eliminated,
            evaluated_conditions,
        )));
    }
    if candidates.len() == 1 && input.graph.node(&candidates[0].to).is_some_and(|n| n.is_terminal) {
        return Ok(RouteOutcome::Decided(decide(
            Some(&candidates[0]),
            DecisionType::Deterministic,
            reason_codes::DETERMINISTIC_TERMINAL,
            "only remaining candidate targets a terminal node",
            1.0,
            false,
            eliminated,
            evaluated_conditions,
        )));
    }

    // Step 3: microloop exit conditions.
    let mut forced: Option<(&'static str, String)> = None;
    if input.graph.is_in_microloop(input.current_node_id) {
        let verified = input
            .envelope
            .map(|e| e.verification_status == VerificationStatus::Verified)
            .unwrap_or(false);
        let at_cap = input.iteration
            >= input.graph.resolved_max_iterations(input.current_node_id) as u64;
        let cannot_iterate = input
            .envelope
            .map(|e| !e.can_further_iteration_help)
            .unwrap_or(false);
        let exit_expr_true = match exit_condition_expr {
            Some(expr) => {
                evaluated_conditions.push(expr.to_string());
                match expr_cache.evaluate(expr, &ctx) {
                    Ok(v) => v,
                    Err(e) if e.is_recoverable_eval_error() => {
                        crate::warn_log!("exit_condition eval error, treating as false: {e}");
                        false
                    }
                    Err(e) => return Err(e),
                }
            }
            None => false,
        };

        if verified || at_cap || cannot_iterate || exit_expr_true {
            let (code, text) = if verified {
                (reason_codes::LOOP_EXIT_VERIFIED, "envelope.verification_status == VERIFIED")
            } else if at_cap {
                (reason_codes::LOOP_EXIT_MAX_ITERATIONS, "iteration count reached max_iterations")
            } else if cannot_iterate {
                (reason_codes::LOOP_EXIT_CANNOT_ITERATE, "envelope.can_further_iteration_help == false")
            } else {
                (reason_codes::LOOP_EXIT_CONDITION, "node.exit_condition evaluated true")
            };
            let before = candidates.len();
            candidates.retain(|c| {
                let is_loop = c.edge_type == EdgeType::Loop;
                if is_loop {
                    eliminated.push(EliminatedCandidate {
                        edge_id: c.edge_id.clone(),
                        eliminated_reason: "verified".to_string(),
                    });
                }
                !is_loop
            });
            if candidates.len() != before {
                forced = Some((code, text.to_string()));
            }
        }
    }

    // Step 4: explicit envelope hint.
    if let Some(envelope) = input.envelope {
        if let Some(hint) = &envelope.next_node_id {
            let matches: Vec<&Candidate> = candidates.iter().filter(|c| &c.to == hint).collect();
            if matches.len() == 1 {
                let chosen = matches[0].clone();
                let rest: Vec<EliminatedCandidate> = candidates
                    .iter()
                    .filter(|c| c.edge_id != chosen.edge_id)
                    .map(|c| EliminatedCandidate {
                        edge_id: c.edge_id.clone(),
                        eliminated_reason: "not_explicit_hint".to_string(),
                    })
                    .collect();
                eliminated.extend(rest);
                return Ok(RouteOutcome::Decided(decide(
                    Some(&chosen),
                    DecisionType::EdgeCondition,
                    reason_codes::EXPLICIT_HINT,
                    "envelope.next_node_id named a uniquely reachable node",
                    input.envelope.map(|e| e.confidence).unwrap_or(1.0),
                    false,
                    eliminated,
                    evaluated_conditions,
                )));
            }
            // Hint names a node not reachable via a single candidate edge:
            // dropped silently from routing, but noted in the audit trail.
            evaluated_conditions.push(format!("envelope.next_node_id == \"{hint}\" (unreachable, dropped)"));
        }
    }

    // Step 5: edge conditions.
    let mut survivors: Vec<Candidate> = Vec::with_capacity(candidates.len());
    let mut eager: Option<Candidate> = None;
    for c in candidates.into_iter() {
        match &c.condition {
            None => survivors.push(c),
            Some(expr) => {
                evaluated_conditions.push(expr.clone());
                let result = match expr_cache.evaluate(expr, &ctx) {
                    Ok(v) => v,
                    Err(e) if e.is_recoverable_eval_error() => {
                        crate::warn_log!("edge condition eval error, treating as false: {e}");
                        false
                    }
                    Err(e) => return Err(e),
                };
                if result {
                    if c.is_default && eager.is_none() {
                        eager = Some(c.clone());
                    }
                    survivors.push(c);
                } else {
                    eliminated.push(EliminatedCandidate {
                        edge_id: c.edge_id.clone(),
                        eliminated_reason: "condition_false".to_string(),
                    });
                }
            }
        }
    }

    if let Some(chosen) = eager {
        let rest: Vec<EliminatedCandidate> = survivors
            .iter()
            .filter(|c| c.edge_id != chosen.edge_id)
            .map(|c| EliminatedCandidate {
                edge_id: c.edge_id.clone(),
                eliminated_reason: "lost_to_default".to_string(),
            })
            .collect();
        eliminated.extend(rest);
        return Ok(RouteOutcome::Decided(decide(
            Some(&chosen),
            DecisionType::EdgeCondition,
            reason_codes::EDGE_CONDITION,
            "edge marked is_default with a true condition",
            1.0,
            false,
            eliminated,
            evaluated_conditions,
        )));
    }

    // Step 6: single survivor.
    if survivors.len() == 1 {
        let (decision_type, code, text) = match &forced {
            Some((code, text)) => (DecisionType::ExitCondition, *code, text.clone()),
            None => (
                DecisionType::Deterministic,
                reason_codes::SINGLE_SURVIVOR,
                "exactly one legal candidate remained".to_string(),
            ),
        };
        let chosen = survivors[0].clone();
        return Ok(RouteOutcome::Decided(decide(
            Some(&chosen),
            decision_type,
            code,
            &text,
            1.0,
            false,
            eliminated,
            evaluated_conditions,
        )));
    }

    if survivors.is_empty() {
        return Ok(RouteOutcome::Decided(decide(
            None,
            DecisionType::HardConstraint,
            "NO_SURVIVING_CANDIDATES",
            "every candidate was eliminated before a decision was reached",
            0.0,
            true,
            eliminated,
            evaluated_conditions,
        )));
    }

    // Step 7: tie-breaker. `survivors` is already priority-ordered because
    // the candidate generator produced them in priority order and no
    // reordering has happened since.
    Ok(RouteOutcome::NeedsTieBreak(PendingTieBreak {
        survivors,
        evaluated_conditions,
        eliminated,
        tiebreaker_confidence_threshold: input.graph.policy.tiebreaker_confidence_threshold,
    }))
}

/// A router that also owns the candidate's origin classification, exposed
/// for callers that want to distinguish a stack-pop decision without
/// re-deriving it from `chosen_candidate_id`.
pub fn decision_origin(decision: &RouteDecision, candidates: &[Candidate]) -> Option<CandidateOrigin> {
    let chosen = decision.chosen_candidate_id.as_ref()?;
    candidates.iter().find(|c| &c.edge_id == chosen).map(|c| c.origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::generate_candidates;
    use crate::graph::{Edge, Node, Policy};
    use crate::node_result::NodeStatus;
    use crate::state::RunState;
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

    fn verified_envelope(confidence: f64) -> Envelope {
        Envelope {
            verification_status: VerificationStatus::Verified,
            confidence,
            can_further_iteration_help: true,
            ..Envelope::default()
        }
    }

    #[test]
    fn s1_linear_single_survivor_is_deterministic() {
        let nodes = vec![node("A", true, false), node("B", false, false), node("C", false, true)];
        let edges = vec![seq_edge("e1", "A", "B"), seq_edge("e2", "B", "C")];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();
        let run = RunState::new("r", "f", "A", Utc::now());
        let candidates = generate_candidates(&graph, "A", None, &run);
        let cache = ExprCache::new();
        let envelope = verified_envelope(0.9);
        let input = RouteInput {
            graph: &graph,
            current_node_id: "A",
            candidates,
            envelope: Some(&envelope),
            receipt: None,
            iteration: 1,
            step_count: 1,
            max_total_steps: graph.policy.max_total_steps(graph.node_count()),
            has_errors: false,
        };
        let outcome = route(input, &cache, None).unwrap();
        match outcome {
            RouteOutcome::Decided(d) => {
                assert_eq!(d.chosen_candidate_id.as_deref(), Some("e1"));
                assert_eq!(d.decision_type, DecisionType::Deterministic);
            }
            RouteOutcome::NeedsTieBreak(_) => panic!("expected a decision"),
        }
    }

    #[test]
    fn s2_microloop_exit_on_verified() {
        let nodes = vec![node("A", true, false), node("B", false, false), node("C", false, true)];
        let edges = vec![
            seq_edge("to_b", "A", "B"),
            Edge {
                id: "loop".into(),
                from: "B".into(),
                to: "B".into(),
                edge_type: EdgeType::Loop,
                condition: None,
                priority: None,
                is_default: false,
            },
            seq_edge("to_c", "B", "C"),
        ];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();
        let run = RunState::new("r", "f", "B", Utc::now());
        let candidates = generate_candidates(&graph, "B", None, &run);
        let cache = ExprCache::new();
        let envelope = verified_envelope(0.95);
        let input = RouteInput {
            graph: &graph,
            current_node_id: "B",
            candidates,
            envelope: Some(&envelope),
            receipt: None,
            iteration: 2,
            step_count: 2,
            max_total_steps: graph.policy.max_total_steps(graph.node_count()),
            has_errors: false,
        };
        let outcome = route(input, &cache, None).unwrap();
        match outcome {
            RouteOutcome::Decided(d) => {
                assert_eq!(d.chosen_candidate_id.as_deref(), Some("to_c"));
                assert_eq!(d.decision_type, DecisionType::ExitCondition);
                assert_eq!(d.reason_code, reason_codes::LOOP_EXIT_VERIFIED);
                assert!(d
                    .candidates_considered
                    .iter()
                    .any(|e| e.edge_id == "loop" && e.eliminated_reason == "verified"));
            }
            RouteOutcome::NeedsTieBreak(_) => panic!("expected a decision"),
        }
    }

    #[test]
    fn s3_microloop_exit_on_iteration_cap() {
        let nodes = vec![node("A", true, false), node("B", false, false), node("C", false, true)];
        let edges = vec![
            seq_edge("to_b", "A", "B"),
            Edge {
                id: "loop".into(),
                from: "B".into(),
                to: "B".into(),
                edge_type: EdgeType::Loop,
                condition: None,
                priority: None,
                is_default: false,
            },
            seq_edge("to_c", "B", "C"),
        ];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();
        let run = RunState::new("r", "f", "B", Utc::now());
        let candidates = generate_candidates(&graph, "B", None, &run);
        let cache = ExprCache::new();
        let envelope = Envelope {
            verification_status: VerificationStatus::Unverified,
            confidence: 0.4,
            can_further_iteration_help: true,
            ..Envelope::default()
        };
        let input = RouteInput {
            graph: &graph,
            current_node_id: "B",
            candidates,
            envelope: Some(&envelope),
            receipt: None,
            iteration: 3,
            step_count: 3,
            max_total_steps: graph.policy.max_total_steps(graph.node_count()),
            has_errors: false,
        };
        let outcome = route(input, &cache, None).unwrap();
        match outcome {
            RouteOutcome::Decided(d) => {
                assert_eq!(d.chosen_candidate_id.as_deref(), Some("to_c"));
                assert_eq!(d.reason_code, reason_codes::LOOP_EXIT_MAX_ITERATIONS);
            }
            RouteOutcome::NeedsTieBreak(_) => panic!("expected a decision"),
        }
    }

    #[test]
    fn s4_edge_condition_picks_unverified_branch() {
        let nodes = vec![node("A", true, false), node("B", false, true), node("C", false, true)];
        let edges = vec![
            Edge {
                id: "to_b".into(),
                from: "A".into(),
                to: "B".into(),
                edge_type: EdgeType::Branch,
                condition: Some(r#"status == "VERIFIED""#.into()),
                priority: None,
                is_default: false,
            },
            Edge {
                id: "to_c".into(),
                from: "A".into(),
                to: "C".into(),
                edge_type: EdgeType::Branch,
                condition: Some(r#"status == "UNVERIFIED""#.into()),
                priority: None,
                is_default: false,
            },
        ];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();
        let run = RunState::new("r", "f", "A", Utc::now());
        let candidates = generate_candidates(&graph, "A", None, &run);
        let cache = ExprCache::new();
        let envelope = Envelope {
            verification_status: VerificationStatus::Unverified,
            confidence: 0.5,
            can_further_iteration_help: false,
            ..Envelope::default()
        };
        let input = RouteInput {
            graph: &graph,
            current_node_id: "A",
            candidates,
            envelope: Some(&envelope),
            receipt: None,
            iteration: 1,
            step_count: 1,
            max_total_steps: graph.policy.max_total_steps(graph.node_count()),
            has_errors: false,
        };
        let outcome = route(input, &cache, None).unwrap();
        match outcome {
            RouteOutcome::Decided(d) => {
                assert_eq!(d.chosen_candidate_id.as_deref(), Some("to_c"));
                assert_eq!(d.decision_type, DecisionType::Deterministic);
                assert_eq!(d.evaluated_conditions.len(), 2);
            }
            RouteOutcome::NeedsTieBreak(_) => panic!("expected a decision"),
        }
    }

    #[test]
    fn s5_tie_breaker_used_when_multiple_survivors() {
        let nodes = vec![node("A", true, false), node("B", false, true), node("C", false, true)];
        let edges = vec![seq_edge("to_b", "A", "B"), seq_edge("to_c", "A", "C")];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();
        let run = RunState::new("r", "f", "A", Utc::now());
        let candidates = generate_candidates(&graph, "A", None, &run);
        let cache = ExprCache::new();
        let input = RouteInput {
            graph: &graph,
            current_node_id: "A",
            candidates,
            envelope: None,
            receipt: None,
            iteration: 1,
            step_count: 1,
            max_total_steps: graph.policy.max_total_steps(graph.node_count()),
            has_errors: false,
        };
        let outcome = route(input, &cache, None).unwrap();
        let pending = match outcome {
            RouteOutcome::NeedsTieBreak(p) => p,
            RouteOutcome::Decided(_) => panic!("expected a tie-break"),
        };
        assert_eq!(pending.candidate_ids(), vec!["to_b", "to_c"]);
        let decision = pending.resolve(Some(TieBreakResult {
            chosen_candidate_id: "to_b".into(),
            confidence: 0.9,
            reason: "oracle preferred to_b".into(),
        }));
        assert_eq!(decision.chosen_candidate_id.as_deref(), Some("to_b"));
        assert_eq!(decision.decision_type, DecisionType::TieBreaker);
        assert!(decision.tie_breaker_used);
        assert!(!decision.needs_human);
    }

    #[test]
    fn s5_invalid_oracle_choice_falls_back_with_needs_human() {
        let nodes = vec![node("A", true, false), node("B", false, true), node("C", false, true)];
        let edges = vec![seq_edge("to_b", "A", "B"), seq_edge("to_c", "A", "C")];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();
        let run = RunState::new("r", "f", "A", Utc::now());
        let candidates = generate_candidates(&graph, "A", None, &run);
        let cache = ExprCache::new();
        let input = RouteInput {
            graph: &graph,
            current_node_id: "A",
            candidates,
            envelope: None,
            receipt: None,
            iteration: 1,
            step_count: 1,
            max_total_steps: graph.policy.max_total_steps(graph.node_count()),
            has_errors: false,
        };
        let outcome = route(input, &cache, None).unwrap();
        let pending = match outcome {
            RouteOutcome::NeedsTieBreak(p) => p,
            RouteOutcome::Decided(_) => panic!("expected a tie-break"),
        };
        let decision = pending.resolve(Some(TieBreakResult {
            chosen_candidate_id: "not_a_real_edge".into(),
            confidence: 0.95,
            reason: "oracle hallucinated".into(),
        }));
        assert_eq!(decision.chosen_candidate_id.as_deref(), Some("to_b"));
        assert!(decision.needs_human);
        assert_eq!(decision.reason_code, reason_codes::ORACLE_INVALID_CHOICE);
    }

    #[test]
    fn safety_step_cap_aborts() {
        let nodes = vec![node("A", true, false), node("B", false, true)];
        let edges = vec![seq_edge("to_b", "A", "B")];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();
        let run = RunState::new("r", "f", "A", Utc::now());
        let candidates = generate_candidates(&graph, "A", None, &run);
        let cache = ExprCache::new();
        let input = RouteInput {
            graph: &graph,
            current_node_id: "A",
            candidates,
            envelope: None,
            receipt: None,
            iteration: 1,
            step_count: 100,
            max_total_steps: 5,
            has_errors: false,
        };
        let outcome = route(input, &cache, None).unwrap();
        match outcome {
            RouteOutcome::Decided(d) => {
                assert_eq!(d.chosen_candidate_id, None);
                assert_eq!(d.reason_code, reason_codes::SAFETY_STEP_CAP);
            }
            RouteOutcome::NeedsTieBreak(_) => panic!("expected a decision"),
        }
    }

    #[test]
    fn stack_pop_candidate_is_deterministic() {
        let nodes = vec![node("A", true, false), node("D", false, false), node("B", false, true)];
        let edges = vec![seq_edge("resume", "A", "B")];
        let graph = FlowGraph::compile("f", "1", nodes, edges, policy()).unwrap();
        let mut run = RunState::new("r", "f", "D", Utc::now());
        use crate::state::{InjectedBy, StackFrame};
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
        let cache = ExprCache::new();
        let input = RouteInput {
            graph: &graph,
            current_node_id: "D",
            candidates,
            envelope: None,
            receipt: None,
            iteration: 1,
            step_count: 2,
            max_total_steps: graph.policy.max_total_steps(graph.node_count()),
            has_errors: false,
        };
        let outcome = route(input, &cache, None).unwrap();
        match outcome {
            RouteOutcome::Decided(d) => {
                assert_eq!(d.chosen_candidate_id.as_deref(), Some(POP_STACK_EDGE_ID));
            }
            RouteOutcome::NeedsTieBreak(_) => panic!("expected a decision"),
        }
    }
}
