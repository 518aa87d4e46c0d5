//! Error types for run-state and event-log persistence.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by the state store (C4). Maps onto the store-facing
/// subset of the closed error-kind taxonomy in spec §7.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// No run directory exists for the given run id.
    #[error("unknown run '{0}'")]
    UnknownRun(String),

    /// `run_state` exists but failed structural validation after a crash.
    /// Corresponds to spec §7 `CheckpointFailed` when it occurs on load.
    #[error("run_state for '{run_id}' is not structurally valid: {reason}")]
    CorruptRunState { run_id: String, reason: String },

    /// An API write supplied an etag that does not match the currently
    /// persisted `run_state` (spec §4.4 `If-Match` semantics).
    #[error("etag conflict: expected {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    /// The store could not durably commit a write (disk full, permission
    /// denied, etc.). Fatal: the kernel aborts the run (spec §7
    /// `CheckpointFailed`).
    #[error("checkpoint write failed: {0}")]
    CheckpointFailed(String),
}
