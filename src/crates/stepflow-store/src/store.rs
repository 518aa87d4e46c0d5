//! `StateStore`: the durable home for one run's `RunState` and event log
//! (spec §4.4, §5, §6).

use crate::atomic::atomic_write_file;
use crate::canonical::etag_of;
use crate::error::{Result, StoreError};
use crate::event_log::EventLog;
use crate::layout::RunDirectory;
use stepflow_core::{Event, EventKind, RunState};

/// A snapshot of `run_state` plus the etag it hashes to, returned by
/// [`StateStore::load`] so callers can later perform an `If-Match` write.
#[derive(Debug, Clone)]
pub struct LoadedState {
    pub state: RunState,
    pub etag: String,
}

/// Durable persistence for a single run directory: atomic `run_state`
/// snapshots plus an append-only event log. One `StateStore` per run.
pub struct StateStore {
    dir: RunDirectory,
    events: EventLog,
}

impl StateStore {
    pub fn new(runs_root: impl AsRef<std::path::Path>, run_id: &str) -> Self {
        let dir = RunDirectory::new(runs_root, run_id);
        let events = EventLog::new(dir.event_log_path());
        Self { dir, events }
    }

    pub fn run_directory(&self) -> &RunDirectory {
        &self.dir
    }

    /// Create the run directory and write the initial `run_state`. Errors
    /// if a `run_state` already exists for this run id.
    pub async fn create(&self, state: &RunState) -> Result<String> {
        self.dir.ensure().await.map_err(StoreError::Io)?;
        if tokio::fs::try_exists(self.dir.run_state_path()).await.unwrap_or(false) {
            return Err(StoreError::CheckpointFailed(format!(
                "run_state already exists for '{}'",
                state.run_id
            )));
        }
        self.write_state(state).await
    }

    /// Load the persisted `run_state`, validating structure. Returns
    /// `UnknownRun` if no `run_state` file exists.
    pub async fn load(&self) -> Result<LoadedState> {
        let path = self.dir.run_state_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::UnknownRun(self.dir.root().display().to_string()));
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        let state: RunState = serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptRunState {
            run_id: self.dir.root().display().to_string(),
            reason: e.to_string(),
        })?;
        let etag = etag_of(&state).map_err(StoreError::Serialize)?;
        Ok(LoadedState { state, etag })
    }

    /// Overwrite `run_state` unconditionally via the atomic write primitive.
    /// Returns the new etag. Used for the kernel's own checkpoints, which
    /// own the only writer and don't need optimistic concurrency.
    pub async fn write_state(&self, state: &RunState) -> Result<String> {
        let bytes = serde_json::to_vec(state).map_err(StoreError::Serialize)?;
        atomic_write_file(&self.dir.run_state_path(), &bytes)
            .await
            .map_err(|e| StoreError::CheckpointFailed(e.to_string()))?;
        etag_of(state).map_err(StoreError::Serialize)
    }

    /// Compare-and-swap write for external API callers (spec §4.4
    /// `If-Match`): succeeds only if the currently persisted state's etag
    /// matches `expected_etag`.
    pub async fn compare_and_swap(&self, expected_etag: &str, state: &RunState) -> Result<String> {
        let current = self.load().await?;
        if current.etag != expected_etag {
            return Err(StoreError::Conflict {
                expected: expected_etag.to_string(),
                actual: current.etag,
            });
        }
        self.write_state(state).await
    }

    /// Append one event and bump `seq` appropriately. Callers pass the
    /// fully-formed event; this method doesn't assign `seq` itself so the
    /// kernel (the only writer) can keep it monotonic across restarts.
    pub async fn append_event(&self, event: &Event) -> Result<()> {
        self.events.append(event).await
    }

    /// Convenience wrapper that stamps `run_id`/`seq`/`at` before appending.
    pub async fn emit(&self, run_id: &str, seq: u64, kind: EventKind) -> Result<()> {
        let event = Event::new(run_id.to_string(), seq, chrono::Utc::now(), kind);
        self.append_event(&event).await
    }

    /// Recover the event log, truncating any trailing partial record left
    /// by a crash mid-append (spec §7 `CheckpointFailed` recovery path).
    pub async fn recover_events(&self) -> Result<Vec<Event>> {
        self.events.recover().await
    }

    pub fn event_log(&self) -> &EventLog {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::RunStatus;
    use tempfile::tempdir;

    fn sample_state(run_id: &str) -> RunState {
        RunState::new(run_id.to_string(), "flow-1".to_string(), "start".to_string(), chrono::Utc::now())
    }

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path(), "run-1");
        let state = sample_state("run-1");

        store.create(&state).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.state.run_id, "run-1");
        assert_eq!(loaded.state.status, RunStatus::Created);
    }

    #[tokio::test]
    async fn load_missing_run_is_unknown_run() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path(), "run-absent");
        match store.load().await {
            Err(StoreError::UnknownRun(_)) => {}
            other => panic!("expected UnknownRun, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_etag() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path(), "run-1");
        let state = sample_state("run-1");
        store.create(&state).await.unwrap();

        let mut updated = state.clone();
        updated.status = RunStatus::Running;

        let err = store.compare_and_swap("stale-etag", &updated).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn compare_and_swap_succeeds_with_current_etag() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path(), "run-1");
        let state = sample_state("run-1");
        let etag = store.create(&state).await.unwrap();

        let mut updated = state.clone();
        updated.status = RunStatus::Running;
        store.compare_and_swap(&etag, &updated).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.state.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn emit_and_recover_events() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path(), "run-1");
        store.dir.ensure().await.unwrap();

        store.emit("run-1", 1, EventKind::RunCreated { flow_id: "flow-1".into() }).await.unwrap();
        store.emit("run-1", 2, EventKind::RunStarted).await.unwrap();

        let events = store.recover_events().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
    }
}
