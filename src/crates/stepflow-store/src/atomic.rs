//! Atomic file write: write-temp-then-rename, the commit primitive behind
//! both `run_state` and checkpoint writes (spec §4.4).

use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Write `data` to `path` atomically: write to a uniquely-named temp file
/// in the same directory, fsync it, then rename over `path`. The rename is
/// the atomic commit point — a reader of `path` always observes either the
/// previous file or the complete new one, never a partial write.
pub async fn atomic_write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        uuid::Uuid::new_v4()
    );
    let temp_path = path.with_file_name(temp_name);

    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;

    tokio::fs::rename(&temp_path, path).await?;

    // Best-effort directory fsync: on some filesystems the rename itself
    // isn't durable until the containing directory's metadata is flushed.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = tokio::fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_and_replaces_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run_state");

        atomic_write_file(&path, b"v1").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"v1");

        atomic_write_file(&path, b"v2").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"v2");

        // No leftover temp files.
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["run_state".to_string()]);
    }
}
