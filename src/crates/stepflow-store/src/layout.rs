//! On-disk layout of a run directory (spec §6): `run_state`, `events.log`,
//! and an opaque `artifacts/` directory this crate never writes into.

use std::path::{Path, PathBuf};

/// Paths for one run's durable artifacts, rooted at `<root>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    pub fn new(runs_root: impl AsRef<Path>, run_id: &str) -> Self {
        Self {
            root: runs_root.as_ref().join(run_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_state_path(&self) -> PathBuf {
        self.root.join("run_state")
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.root.join("events.log")
    }

    /// Managed entirely by callers (spec §1: "the artifact/filesystem
    /// layer... an opaque key-value sink"); this crate only ensures the
    /// directory exists.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    /// Create the run directory and its `artifacts/` subdirectory if they
    /// don't already exist.
    pub async fn ensure(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::create_dir_all(self.artifacts_dir()).await?;
        Ok(())
    }
}
