//! Tie-breaker oracle (spec §4.3 step 7, §4.6): consulted only when the
//! router has ≥2 surviving candidates after every deterministic rule.

use async_trait::async_trait;
use stepflow_core::candidate::Candidate;
use stepflow_core::expr::RoutingContext;
use stepflow_core::TieBreakResult;

#[async_trait]
pub trait TieBreakOracle: Send + Sync {
    /// Returns `None` on timeout or unavailability (spec §7
    /// `OracleUnavailable` — the router falls back to the highest-priority
    /// candidate and sets `needs_human`).
    async fn tiebreak(
        &self,
        candidates: &[Candidate],
        context: &RoutingContext,
        budget_ms: u64,
    ) -> Option<TieBreakResult>;
}

/// Deterministic stub for tests (spec §10.4, §8 property 5): always picks a
/// fixed candidate id with a fixed confidence, or returns `None` to exercise
/// the fallback path.
pub struct ScriptedOracle {
    choice: Option<(String, f64)>,
}

impl ScriptedOracle {
    pub fn always_choose(edge_id: impl Into<String>, confidence: f64) -> Self {
        Self {
            choice: Some((edge_id.into(), confidence)),
        }
    }

    pub fn unavailable() -> Self {
        Self { choice: None }
    }
}

#[async_trait]
impl TieBreakOracle for ScriptedOracle {
    async fn tiebreak(
        &self,
        _candidates: &[Candidate],
        _context: &RoutingContext,
        _budget_ms: u64,
    ) -> Option<TieBreakResult> {
        self.choice.clone().map(|(chosen_candidate_id, confidence)| TieBreakResult {
            chosen_candidate_id,
            confidence,
            reason: "scripted".to_string(),
        })
    }
}
