//! Orchestrator-level errors (spec §7): wraps the core/store error kinds and
//! adds the runtime kinds that only exist once an engine and an external API
//! are in the picture.

use stepflow_core::CoreError;
use stepflow_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// `create_run` named a flow id the runtime has no graph registered for.
    #[error("unknown flow '{0}'")]
    UnknownFlow(String),

    /// `create_run` params failed validation before a `RunState` could be built.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// `inject_node`/`interrupt` was rejected because the interruption stack
    /// is already at `max_stack_depth`.
    #[error("interruption stack overflow for run '{0}'")]
    StackOverflow(String),

    /// `inject_node`/`interrupt` named a node or flow that doesn't resolve.
    #[error("invalid injection spec: {0}")]
    InvalidSpec(String),

    /// An API write's `etag` didn't match the currently persisted state.
    #[error("etag conflict for run '{run_id}'")]
    Conflict { run_id: String },

    /// pause/resume/cancel requested while the run is in a status that
    /// cannot legally reach the target (e.g. resuming a terminal run).
    #[error("illegal transition for run '{run_id}': {reason}")]
    IllegalTransition { run_id: String, reason: String },
}

impl OrchestratorError {
    /// The exit code a CLI front-end should use for this error (spec §6).
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::StackOverflow(_) => 2,
            OrchestratorError::InvalidParams(_) | OrchestratorError::InvalidSpec(_) => 64,
            _ => 3,
        }
    }
}
