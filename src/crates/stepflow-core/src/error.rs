//! Error types for graph loading, expression evaluation, and routing.
//!
//! All errors implement `std::error::Error` via `thiserror`. The variants here
//! are the closed error-kind taxonomy from the routing/expression side of the
//! error design — persistence and engine errors live in their own crates and
//! are wrapped in by `stepflow-orchestrator::OrchestratorError`.

use thiserror::Error;

/// Convenience result type using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced while loading a graph or evaluating routing logic.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The `FlowGraph` failed structural validation at load time.
    ///
    /// Covers the invariants in spec §3: missing START/TERMINAL, dangling
    /// edge endpoints, self-loops on non-`loop` edges, duplicate ids.
    #[error("graph invalid: {0}")]
    GraphInvalid(String),

    /// A condition or exit-condition expression failed to parse at load time.
    #[error("expression parse error in \"{expr}\": {reason}")]
    ExpressionParseError {
        /// Source text of the offending expression.
        expr: String,
        /// Human-readable reason.
        reason: String,
    },

    /// An expression referenced an identifier not present in the routing
    /// context. Per spec §7 this is a *recoverable* runtime error: callers
    /// should treat it as the condition evaluating to `false` and log a
    /// warning, not abort the run.
    #[error("unresolved identifier \"{0}\" in routing context")]
    UnresolvedIdentifier(String),

    /// An expression compared values of incompatible types (e.g. a string to
    /// a number). Also recoverable per spec §7.
    #[error("type mismatch evaluating expression: {0}")]
    TypeMismatch(String),

    /// A `matches` operator's regex literal failed to compile. Regexes are
    /// validated eagerly at graph-load time (spec §4.1) so this should never
    /// surface at routing time for a graph that passed validation.
    #[error("invalid regex in expression: {0}")]
    InvalidRegex(#[from] regex::Error),
}

impl CoreError {
    /// True for the subset of errors spec §7 classifies as "recoverable
    /// locally" — the router degrades the offending edge condition to
    /// `false` and continues rather than aborting the run.
    pub fn is_recoverable_eval_error(&self) -> bool {
        matches!(
            self,
            CoreError::UnresolvedIdentifier(_) | CoreError::TypeMismatch(_)
        )
    }
}
