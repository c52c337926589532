use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    Turns,
    Tokens,
    Duration,
}

impl BoundaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Turns => "turns",
            Self::Tokens => "tokens",
            Self::Duration => "duration",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    Boundary(BoundaryKind),
    Cleanup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    NotStarted,
    Active,
    Halted(HaltReason),
}

/// Live state of one bounded dialogue, mutated only by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialogueSession {
    pub session_id: SessionId,
    pub current_speaker: Option<String>,
    pub turn_count: u32,
    pub token_count: u64,
    pub started_at: DateTime<Utc>,
    pub speaker_queue: Vec<String>,
}

impl DialogueSession {
    pub fn new(session_id: SessionId, started_at: DateTime<Utc>) -> Self {
        Self {
            session_id,
            current_speaker: None,
            turn_count: 0,
            token_count: 0,
            started_at,
            speaker_queue: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            turn_count: self.turn_count,
            token_count: self.token_count,
            started_at: self.started_at,
            current_speaker: self.current_speaker.clone(),
            speaker_queue: self.speaker_queue.clone(),
        }
    }

    /// Round-robin successor of the current speaker within the queue.
    pub fn next_speaker(&self) -> Option<String> {
        if self.speaker_queue.is_empty() {
            return None;
        }
        let next_index = self
            .current_speaker
            .as_ref()
            .and_then(|current| self.speaker_queue.iter().position(|id| id == current))
            .map(|index| (index + 1) % self.speaker_queue.len())
            .unwrap_or(0);
        self.speaker_queue.get(next_index).cloned()
    }
}

/// Serialized session state; this is what gets checksummed and persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub turn_count: u32,
    pub token_count: u64,
    pub started_at: DateTime<Utc>,
    pub current_speaker: Option<String>,
    pub speaker_queue: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueMessage {
    pub speaker_id: String,
    pub content: String,
}

impl DialogueMessage {
    pub fn new(speaker_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { speaker_id: speaker_id.into(), content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOutcome {
    pub success: bool,
    pub message_id: MessageId,
    pub turn_count: u32,
    pub token_count: u64,
    pub next_speaker: Option<String>,
}
