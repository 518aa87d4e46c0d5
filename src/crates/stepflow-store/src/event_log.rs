//! Append-only, self-delimited event log (spec §4.8).
//!
//! Each event is one JSON object per line. A crash mid-append leaves at most
//! one trailing incomplete line; `recover` discards it and physically
//! truncates the file so the next append starts clean.

use crate::error::{Result, StoreError};
use std::path::{Path, PathBuf};
use stepflow_core::Event;
use tokio::io::AsyncWriteExt;

/// Handle onto one run's `events.log`.
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event, fsync'd before returning. The log is opened in
    /// append mode so concurrent writers never clobber each other's bytes
    /// (callers still need an external lock to keep `seq` monotonic).
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_string(event).map_err(StoreError::Serialize)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(StoreError::Io)?;
        file.write_all(line.as_bytes()).await.map_err(StoreError::Io)?;
        file.sync_all().await.map_err(StoreError::Io)?;
        Ok(())
    }

    /// Read all valid events, discarding and truncating any trailing
    /// partial or corrupt record. Returns the recovered events in order.
    ///
    /// Only a *trailing* bad record is tolerated: if a line in the middle
    /// fails to parse, the log itself is corrupt beyond what crash-recovery
    /// can repair, and that is reported as an error rather than silently
    /// dropping history.
    pub async fn recover(&self) -> Result<Vec<Event>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let text = String::from_utf8_lossy(&bytes);
        let ends_with_newline = bytes.last() == Some(&b'\n');
        let mut lines: Vec<&str> = text.lines().collect();

        let trailing_incomplete = !ends_with_newline && !lines.is_empty();
        if trailing_incomplete {
            lines.pop();
        }

        let mut events = Vec::with_capacity(lines.len());
        let mut valid_byte_len = 0usize;
        let mut cursor = 0usize;

        for (idx, line) in lines.iter().enumerate() {
            let line_len_with_newline = line.len() + 1;
            match serde_json::from_str::<Event>(line) {
                Ok(ev) => {
                    events.push(ev);
                    cursor += line_len_with_newline;
                    valid_byte_len = cursor;
                }
                Err(_) => {
                    if trailing_incomplete_is_last(idx, lines.len(), trailing_incomplete) {
                        break;
                    }
                    return Err(StoreError::CorruptRunState {
                        run_id: self.path.display().to_string(),
                        reason: format!("unparseable event log record at line {}", idx + 1),
                    });
                }
            }
        }

        if trailing_incomplete || valid_byte_len != bytes.len() {
            self.truncate_to(valid_byte_len).await?;
        }

        Ok(events)
    }

    async fn truncate_to(&self, len: usize) -> Result<()> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(StoreError::Io)?;
        file.set_len(len as u64).await.map_err(StoreError::Io)?;
        file.sync_all().await.map_err(StoreError::Io)?;
        Ok(())
    }
}

/// A parse failure only counts as "the tolerated trailing partial record" if
/// it's the very last line we're considering and we already know the file
/// didn't end with a newline.
fn trailing_incomplete_is_last(idx: usize, considered_len: usize, trailing_incomplete: bool) -> bool {
    trailing_incomplete && idx + 1 == considered_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::EventKind;
    use tempfile::tempdir;

    fn sample(seq: u64) -> Event {
        Event::new("run-1".to_string(), seq, chrono::Utc::now(), EventKind::Heartbeat)
    }

    #[tokio::test]
    async fn appends_and_recovers_in_order() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.log"));

        log.append(&sample(1)).await.unwrap();
        log.append(&sample(2)).await.unwrap();
        log.append(&sample(3)).await.unwrap();

        let recovered = log.recover().await.unwrap();
        assert_eq!(recovered.len(), 3);
        assert_eq!(recovered[0].seq, 1);
        assert_eq!(recovered[2].seq, 3);
    }

    #[tokio::test]
    async fn recover_on_missing_file_returns_empty() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.log"));
        assert!(log.recover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn truncates_trailing_partial_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");
        let log = EventLog::new(path.clone());

        log.append(&sample(1)).await.unwrap();

        // Simulate a crash mid-write: append a partial line with no newline.
        let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"{\"run_id\":\"run-1\",\"seq\":2,\"at\":").await.unwrap();
        file.sync_all().await.unwrap();

        let recovered = log.recover().await.unwrap();
        assert_eq!(recovered.len(), 1);

        // File on disk should now only contain the one valid record.
        let bytes = tokio::fs::read(&path).await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 1);

        // A subsequent append should succeed cleanly after truncation.
        log.append(&sample(2)).await.unwrap();
        let recovered = log.recover().await.unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[1].seq, 2);
    }
}
