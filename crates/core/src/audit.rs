//! Write-only governance sinks: the incident/decision log and the act-mode lock.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::health::StatusColor;
use crate::domain::resource::{ActModeLock, Incident};
use crate::sync::lock;

pub const STATUS_CHANGE: &str = "STATUS_CHANGE";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink write failed: {0}")]
    Write(String),
    #[error("sink read failed: {0}")]
    Read(String),
}

/// One append-only record in the incident/decision log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub details: Vec<String>,
}

impl LogEntry {
    pub fn new(timestamp: DateTime<Utc>, kind: impl Into<String>) -> Self {
        Self { timestamp, kind: kind.into(), details: Vec::new() }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }

    pub fn from_incident(incident: &Incident) -> Self {
        let mut entry = Self::new(incident.timestamp, incident.kind.clone());
        for reason in &incident.reasons {
            entry = entry.with_detail(format!("Reason: {reason}"));
        }
        let metrics = serde_json::to_string(&incident.metrics_snapshot)
            .unwrap_or_else(|error| format!("<unserializable: {error}>"));
        entry.with_detail(format!("Metrics: {metrics}"))
    }

    pub fn status_change(
        timestamp: DateTime<Utc>,
        agent_id: &str,
        previous: Option<StatusColor>,
        current: StatusColor,
        message: &str,
    ) -> Self {
        let previous = previous.map(|color| color.as_str()).unwrap_or("NONE");
        Self::new(timestamp, STATUS_CHANGE)
            .with_detail(format!("Agent: {agent_id}"))
            .with_detail(format!("Status: {previous} -> {}", current.as_str()))
            .with_detail(format!("Message: {message}"))
    }

    /// `[<RFC3339>] <TYPE>\n<details...>\n\n`
    ///
    /// Line breaks inside the kind or a detail are written as `\n` / `\r` so
    /// every entry stays one block between blank lines.
    pub fn render(&self) -> String {
        let mut rendered = format!("[{}] ", self.timestamp.to_rfc3339());
        push_line(&mut rendered, &self.kind);
        for detail in &self.details {
            push_line(&mut rendered, detail);
        }
        rendered.push('\n');
        rendered
    }
}

fn push_line(rendered: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '\n' => rendered.push_str("\\n"),
            '\r' => rendered.push_str("\\r"),
            other => rendered.push(other),
        }
    }
    rendered.push('\n');
}

#[async_trait]
pub trait IncidentLog: Send + Sync {
    async fn append(&self, entry: LogEntry) -> Result<(), SinkError>;
}

#[async_trait]
pub trait ActModeLockStore: Send + Sync {
    async fn write_lock(&self, lock: &ActModeLock) -> Result<(), SinkError>;
    async fn read_lock(&self) -> Result<Option<ActModeLock>, SinkError>;
}

#[derive(Clone, Default)]
pub struct InMemoryIncidentLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
    fail_writes: bool,
}

impl InMemoryIncidentLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log whose every append fails.
    pub fn failing() -> Self {
        Self { fail_writes: true, ..Self::default() }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.entries).clone()
    }

    pub fn entries_of_kind(&self, kind: &str) -> Vec<LogEntry> {
        lock(&self.entries).iter().filter(|entry| entry.kind == kind).cloned().collect()
    }

    pub fn rendered(&self) -> String {
        lock(&self.entries).iter().map(LogEntry::render).collect()
    }
}

#[async_trait]
impl IncidentLog for InMemoryIncidentLog {
    async fn append(&self, entry: LogEntry) -> Result<(), SinkError> {
        if self.fail_writes {
            return Err(SinkError::Write("in-memory incident log configured to fail".to_string()));
        }
        lock(&self.entries).push(entry);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryLockStore {
    current: Arc<Mutex<Option<ActModeLock>>>,
    writes: Arc<Mutex<usize>>,
    fail_writes: bool,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail_writes: true, ..Self::default() }
    }

    pub fn current(&self) -> Option<ActModeLock> {
        lock(&self.current).clone()
    }

    pub fn write_count(&self) -> usize {
        *lock(&self.writes)
    }
}

#[async_trait]
impl ActModeLockStore for InMemoryLockStore {
    async fn write_lock(&self, act_lock: &ActModeLock) -> Result<(), SinkError> {
        if self.fail_writes {
            return Err(SinkError::Write("in-memory lock store configured to fail".to_string()));
        }
        *lock(&self.current) = Some(act_lock.clone());
        *lock(&self.writes) += 1;
        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<ActModeLock>, SinkError> {
        Ok(self.current())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};

    use crate::audit::{
        ActModeLockStore, IncidentLog, InMemoryIncidentLog, InMemoryLockStore, LogEntry,
    };
    use crate::domain::health::StatusColor;
    use crate::domain::resource::{ActModeLock, Incident};

    #[test]
    fn rendered_entry_uses_bracketed_timestamp_header() {
        let timestamp =
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid timestamp");
        let entry = LogEntry::new(timestamp, "EMERGENCY_SHUTDOWN")
            .with_detail("Reason: Cost threshold exceeded")
            .with_detail("Metrics: {}");

        assert_eq!(
            entry.render(),
            "[2026-03-01T12:00:00+00:00] EMERGENCY_SHUTDOWN\nReason: Cost threshold exceeded\nMetrics: {}\n\n"
        );
    }

    #[test]
    fn incident_entry_lists_every_reason() {
        let incident = Incident::emergency_shutdown(
            vec!["Cost threshold exceeded".to_string(), "CPU threshold exceeded".to_string()],
            Utc::now(),
            BTreeMap::new(),
        );
        let entry = LogEntry::from_incident(&incident);

        assert_eq!(entry.kind, "EMERGENCY_SHUTDOWN");
        assert_eq!(entry.details.len(), 3);
        assert!(entry.details[0].contains("Cost threshold exceeded"));
        assert!(entry.details[2].starts_with("Metrics: "));
    }

    #[test]
    fn status_change_entry_names_both_colors() {
        let entry = LogEntry::status_change(
            Utc::now(),
            "agent-a",
            Some(StatusColor::Blue),
            StatusColor::Orange,
            "cpu climbing",
        );
        assert!(entry.details.iter().any(|detail| detail == "Status: BLUE -> ORANGE"));
    }

    #[test]
    fn multi_line_agent_message_renders_as_one_entry() {
        let timestamp =
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid timestamp");
        let entry = LogEntry::status_change(
            timestamp,
            "agent-a",
            None,
            StatusColor::Blue,
            "ok\n\n[2026-01-01T00:00:00+00:00] EMERGENCY_SHUTDOWN\r\nReason: forged",
        );

        let rendered = entry.render();

        assert_eq!(rendered.matches("\n\n").count(), 1);
        assert!(rendered.ends_with("\n\n"));
        assert!(rendered.contains(
            "Message: ok\\n\\n[2026-01-01T00:00:00+00:00] EMERGENCY_SHUTDOWN\\r\\nReason: forged\n"
        ));
    }

    #[tokio::test]
    async fn in_memory_log_records_and_failing_log_rejects() {
        let log = InMemoryIncidentLog::new();
        log.append(LogEntry::new(Utc::now(), "TEST")).await.expect("append succeeds");
        assert_eq!(log.entries_of_kind("TEST").len(), 1);
        assert!(log.rendered().contains("] TEST\n"));

        let failing = InMemoryIncidentLog::failing();
        assert!(failing.append(LogEntry::new(Utc::now(), "TEST")).await.is_err());
        assert!(failing.entries().is_empty());
    }

    #[tokio::test]
    async fn lock_store_keeps_latest_lock() {
        let store = InMemoryLockStore::new();
        assert_eq!(store.read_lock().await.expect("read"), None);

        let lock = ActModeLock { timestamp: Utc::now(), reason: "audit required".to_string() };
        store.write_lock(&lock).await.expect("write");

        assert_eq!(store.read_lock().await.expect("read"), Some(lock));
        assert_eq!(store.write_count(), 1);
    }
}
