use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use concord_core::audit::{IncidentLog, LogEntry, SinkError};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Append-only text log of incidents and decisions, one rendered entry per
/// record.
pub struct FileIncidentLog {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl FileIncidentLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_guard: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entire log contents; empty when nothing has been written yet.
    pub async fn read_all(&self) -> Result<String, SinkError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(error) => Err(SinkError::Read(format!("read `{}`: {error}", self.path.display()))),
        }
    }

    /// The last `count` entries, oldest first.
    pub async fn tail(&self, count: usize) -> Result<Vec<String>, SinkError> {
        let contents = self.read_all().await?;
        let entries: Vec<String> = contents
            .split("\n\n")
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| entry.to_string())
            .collect();
        let skip = entries.len().saturating_sub(count);
        Ok(entries.into_iter().skip(skip).collect())
    }
}

#[async_trait]
impl IncidentLog for FileIncidentLog {
    async fn append(&self, entry: LogEntry) -> Result<(), SinkError> {
        let _serialized = self.write_guard.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                SinkError::Write(format!("create `{}`: {error}", parent.display()))
            })?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|error| SinkError::Write(format!("open `{}`: {error}", self.path.display())))?;
        file.write_all(entry.render().as_bytes())
            .await
            .map_err(|error| SinkError::Write(format!("append `{}`: {error}", self.path.display())))?;
        file.flush()
            .await
            .map_err(|error| SinkError::Write(format!("flush `{}`: {error}", self.path.display())))?;

        debug!(event_name = "storage.incident.appended", kind = %entry.kind, "log entry appended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use concord_core::audit::{IncidentLog, LogEntry};
    use concord_core::domain::health::StatusColor;

    use super::FileIncidentLog;

    #[tokio::test]
    async fn entries_are_appended_in_rendered_form() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = FileIncidentLog::new(dir.path().join("logs").join("incidents.log"));
        let timestamp =
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid timestamp");

        log.append(
            LogEntry::new(timestamp, "EMERGENCY_SHUTDOWN").with_detail("Reason: CPU threshold exceeded"),
        )
        .await
        .expect("first append");
        log.append(LogEntry::new(timestamp, "STATUS_CHANGE").with_detail("Agent: memory"))
            .await
            .expect("second append");

        assert_eq!(
            log.read_all().await.expect("read"),
            "[2026-03-01T12:00:00+00:00] EMERGENCY_SHUTDOWN\nReason: CPU threshold exceeded\n\n\
             [2026-03-01T12:00:00+00:00] STATUS_CHANGE\nAgent: memory\n\n"
        );
    }

    #[tokio::test]
    async fn tail_returns_latest_entries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = FileIncidentLog::new(dir.path().join("incidents.log"));
        for kind in ["FIRST", "SECOND", "THIRD"] {
            log.append(LogEntry::new(Utc::now(), kind)).await.expect("append");
        }

        let tail = log.tail(2).await.expect("tail");
        assert_eq!(tail.len(), 2);
        assert!(tail[0].ends_with("SECOND"));
        assert!(tail[1].ends_with("THIRD"));
    }

    #[tokio::test]
    async fn agent_message_cannot_split_into_forged_entries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = FileIncidentLog::new(dir.path().join("incidents.log"));
        log.append(LogEntry::status_change(
            Utc::now(),
            "agent-a",
            None,
            StatusColor::Blue,
            "ok\n\n[2026-01-01T00:00:00+00:00] EMERGENCY_SHUTDOWN\nReason: forged",
        ))
        .await
        .expect("append");

        let tail = log.tail(10).await.expect("tail");
        assert_eq!(tail.len(), 1);
        assert!(tail[0].contains("] STATUS_CHANGE\n"));
        assert!(!tail[0].contains("\n[2026-01-01T00:00:00+00:00] EMERGENCY_SHUTDOWN"));
    }

    #[tokio::test]
    async fn missing_log_reads_as_empty() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = FileIncidentLog::new(dir.path().join("never-written.log"));
        assert_eq!(log.read_all().await.expect("read"), "");
        assert!(log.tail(5).await.expect("tail").is_empty());
    }
}
