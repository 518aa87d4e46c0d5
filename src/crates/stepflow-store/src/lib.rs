//! Crash-safe persistence for run state and event logs (C4).
//!
//! Every write goes through [`atomic::atomic_write_file`] (write-temp, fsync,
//! rename) or the append-only [`event_log::EventLog`], so a process killed
//! mid-write leaves the run directory in a recoverable state: `run_state`
//! always reflects its last complete write, and `events.log` never has more
//! than one trailing partial record.

pub mod atomic;
pub mod canonical;
pub mod error;
pub mod event_log;
pub mod layout;
pub mod store;

pub use canonical::{canonical_json, etag_of};
pub use error::{Result, StoreError};
pub use event_log::EventLog;
pub use layout::RunDirectory;
pub use store::{LoadedState, StateStore};
