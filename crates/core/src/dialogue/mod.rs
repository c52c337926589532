//! Turn-taking state machine for one bounded two-agent dialogue.
//!
//! `NotStarted -> Active -> Halted`. A session halts on its first boundary
//! violation or on cleanup and never resumes; `initialize` starts a new one.
//!
//! Speakers take turns round-robin in queue order. The first queued speaker
//! opens the dialogue and each accepted message hands the turn to the next
//! queued speaker, wrapping around.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::checksum::ChecksumStore;
use crate::domain::context::ChecksumRecord;
use crate::domain::session::{
    BoundaryKind, DialogueMessage, DialogueSession, HaltReason, MessageId, MessageOutcome,
    SessionId, SessionPhase, SessionSnapshot,
};
use crate::events::{ChecksumSync, EventBus, MessageProcessed, SessionHalted, SessionStarted};
use crate::ids::{elapsed, Clock, IdGenerator};
use crate::schedule::ScheduledTask;
use crate::sync::lock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialogueConfig {
    pub max_turns: u32,
    pub max_tokens: u64,
    pub max_duration: Duration,
    pub checksum_interval: Duration,
    /// Characters per estimated token.
    pub token_divisor: usize,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            max_turns: 100,
            max_tokens: 100_000,
            max_duration: Duration::from_secs(3_600),
            checksum_interval: Duration::from_secs(60),
            token_divisor: 4,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DialogueError {
    #[error("no dialogue session has been initialized")]
    NotStarted,
    #[error("dialogue session {session_id} is halted")]
    Halted { session_id: SessionId },
    #[error("{} boundary exceeded for session {session_id}: {detail}", .boundary.as_str())]
    BoundaryExceeded { session_id: SessionId, boundary: BoundaryKind, detail: String },
    #[error("wrong turn: expected {}, got `{actual}`", .expected.as_deref().unwrap_or("<no speaker queued>"))]
    WrongTurn { expected: Option<String>, actual: String },
}

/// Durable-memory key under which a session's checksummed state is stored.
pub fn session_context_key(session_id: &SessionId) -> String {
    format!("session:{}", session_id.0)
}

/// Deterministic token approximation: characters divided by `divisor`, rounded up.
pub fn estimate_tokens(content: &str, divisor: usize) -> u64 {
    let chars = content.chars().count();
    u64::try_from(chars.div_ceil(divisor.max(1))).unwrap_or(u64::MAX)
}

struct ControllerState {
    phase: SessionPhase,
    session: Option<DialogueSession>,
}

pub struct DialogueController {
    config: DialogueConfig,
    bus: EventBus,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    checksums: ChecksumStore,
    state: Mutex<ControllerState>,
    checksum_task: Mutex<Option<ScheduledTask>>,
}

impl DialogueController {
    pub fn new(
        config: DialogueConfig,
        bus: EventBus,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            bus,
            ids,
            clock,
            checksums: ChecksumStore::new(),
            state: Mutex::new(ControllerState { phase: SessionPhase::NotStarted, session: None }),
            checksum_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DialogueConfig {
        &self.config
    }

    /// Starts a fresh session, abandoning any previous one.
    pub fn initialize(self: &Arc<Self>) -> SessionId {
        let started_at = self.clock.now();
        let session_id = SessionId(self.ids.next_id());

        let abandoned = {
            let mut state = lock(&self.state);
            let abandoned = state.session.as_ref().map(|session| session.session_id.clone());
            state.session = Some(DialogueSession::new(session_id.clone(), started_at));
            state.phase = SessionPhase::Active;
            abandoned
        };

        if let Some(previous) = abandoned {
            debug!(
                event_name = "dialogue.session.abandoned",
                session_id = %previous,
                "previous dialogue session abandoned by initialize"
            );
        }

        self.restart_checksum_task();

        info!(
            event_name = "dialogue.session.started",
            session_id = %session_id,
            max_turns = self.config.max_turns,
            max_tokens = self.config.max_tokens,
            "dialogue session started"
        );
        self.bus
            .session_started
            .emit(SessionStarted { session_id: session_id.clone(), started_at });

        session_id
    }

    /// Appends a speaker to the rotation. Returns `false` for duplicates or
    /// when no session is active.
    pub fn queue_speaker(&self, speaker_id: impl Into<String>) -> bool {
        let speaker_id = speaker_id.into();
        let mut state = lock(&self.state);
        if state.phase != SessionPhase::Active {
            return false;
        }
        let Some(session) = state.session.as_mut() else {
            return false;
        };
        if session.speaker_queue.iter().any(|queued| queued == &speaker_id) {
            debug!(
                event_name = "dialogue.speaker.duplicate",
                session_id = %session.session_id,
                speaker_id = %speaker_id,
                "speaker already queued"
            );
            return false;
        }

        session.speaker_queue.push(speaker_id.clone());
        if session.current_speaker.is_none() {
            session.current_speaker = Some(speaker_id);
        }
        true
    }

    pub fn process_message(
        &self,
        message: DialogueMessage,
    ) -> Result<MessageOutcome, DialogueError> {
        let now = self.clock.now();
        let mut halted = None;

        let result = {
            let mut guard = lock(&self.state);
            let ControllerState { phase: current_phase, session } = &mut *guard;
            let phase = *current_phase;
            match (phase, session.as_mut()) {
                (SessionPhase::NotStarted, _) | (_, None) => Err(DialogueError::NotStarted),
                (SessionPhase::Halted(HaltReason::Cleanup), Some(session)) => {
                    Err(DialogueError::Halted { session_id: session.session_id.clone() })
                }
                (SessionPhase::Active | SessionPhase::Halted(HaltReason::Boundary(_)), Some(session)) => {
                    match self.boundary_violation(session, now) {
                        Some((boundary, detail)) => {
                            let session_id = session.session_id.clone();
                            if phase == SessionPhase::Active {
                                *current_phase =
                                    SessionPhase::Halted(HaltReason::Boundary(boundary));
                                halted = Some(SessionHalted {
                                    session_id: session_id.clone(),
                                    reason: HaltReason::Boundary(boundary),
                                });
                            }
                            Err(DialogueError::BoundaryExceeded { session_id, boundary, detail })
                        }
                        None if session.current_speaker.as_deref()
                            != Some(message.speaker_id.as_str()) =>
                        {
                            Err(DialogueError::WrongTurn {
                                expected: session.current_speaker.clone(),
                                actual: message.speaker_id.clone(),
                            })
                        }
                        None => {
                            let tokens_added =
                                estimate_tokens(&message.content, self.config.token_divisor);
                            session.turn_count = session.turn_count.saturating_add(1);
                            session.token_count = session.token_count.saturating_add(tokens_added);
                            session.current_speaker = session.next_speaker();

                            let message_id = MessageId(self.ids.next_id());
                            Ok((
                                MessageOutcome {
                                    success: true,
                                    message_id: message_id.clone(),
                                    turn_count: session.turn_count,
                                    token_count: session.token_count,
                                    next_speaker: session.current_speaker.clone(),
                                },
                                MessageProcessed {
                                    session_id: session.session_id.clone(),
                                    message_id,
                                    speaker_id: message.speaker_id.clone(),
                                    turn_count: session.turn_count,
                                    token_count: session.token_count,
                                    tokens_added,
                                },
                            ))
                        }
                    }
                }
            }
        };

        if let Some(event) = halted {
            warn!(
                event_name = "dialogue.session.halted",
                session_id = %event.session_id,
                reason = ?event.reason,
                "dialogue session halted at boundary"
            );
            self.bus.session_halted.emit(event);
        }

        match result {
            Ok((outcome, event)) => {
                debug!(
                    event_name = "dialogue.message.processed",
                    session_id = %event.session_id,
                    message_id = %event.message_id,
                    speaker_id = %event.speaker_id,
                    turn_count = event.turn_count,
                    token_count = event.token_count,
                    "dialogue message accepted"
                );
                self.bus.message_processed.emit(event);
                Ok(outcome)
            }
            Err(error) => {
                debug!(
                    event_name = "dialogue.message.rejected",
                    speaker_id = %message.speaker_id,
                    error = %error,
                    "dialogue message rejected"
                );
                Err(error)
            }
        }
    }

    /// Computes the session digest and publishes it for durable persistence.
    pub fn sync_checksum(&self) -> Option<ChecksumSync> {
        let snapshot = self.snapshot()?;
        let digest = match self.checksums.digest(&snapshot) {
            Ok(digest) => digest,
            Err(error) => {
                warn!(
                    event_name = "dialogue.checksum.failed",
                    session_id = %snapshot.session_id,
                    error = %error,
                    "could not compute session checksum"
                );
                return None;
            }
        };

        let event = ChecksumSync {
            checksum: ChecksumRecord {
                context_id: session_context_key(&snapshot.session_id),
                digest,
                timestamp: self.clock.now(),
            },
            snapshot,
        };
        self.bus.checksum_sync.emit(event.clone());
        Some(event)
    }

    /// Stops the periodic checksum task and halts an active session.
    pub fn cleanup(&self) {
        if let Some(task) = lock(&self.checksum_task).take() {
            task.cancel();
        }

        let halted = {
            let mut state = lock(&self.state);
            let session_id = state.session.as_ref().map(|session| session.session_id.clone());
            match (state.phase, session_id) {
                (SessionPhase::Active, Some(session_id)) => {
                    state.phase = SessionPhase::Halted(HaltReason::Cleanup);
                    Some(SessionHalted { session_id, reason: HaltReason::Cleanup })
                }
                _ => None,
            }
        };

        if let Some(event) = halted {
            info!(
                event_name = "dialogue.session.cleaned_up",
                session_id = %event.session_id,
                "dialogue session halted by cleanup"
            );
            self.bus.session_halted.emit(event);
        }
    }

    pub fn phase(&self) -> SessionPhase {
        lock(&self.state).phase
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        lock(&self.state).session.as_ref().map(DialogueSession::snapshot)
    }

    pub fn current_speaker(&self) -> Option<String> {
        lock(&self.state).session.as_ref().and_then(|session| session.current_speaker.clone())
    }

    fn boundary_violation(
        &self,
        session: &DialogueSession,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<(BoundaryKind, String)> {
        if session.turn_count >= self.config.max_turns {
            return Some((
                BoundaryKind::Turns,
                format!("turn count {} reached limit {}", session.turn_count, self.config.max_turns),
            ));
        }
        if session.token_count >= self.config.max_tokens {
            return Some((
                BoundaryKind::Tokens,
                format!(
                    "token count {} reached limit {}",
                    session.token_count, self.config.max_tokens
                ),
            ));
        }
        let running = elapsed(now, session.started_at);
        if running >= self.config.max_duration {
            return Some((
                BoundaryKind::Duration,
                format!(
                    "session ran {}s, limit {}s",
                    running.as_secs(),
                    self.config.max_duration.as_secs()
                ),
            ));
        }
        None
    }

    fn restart_checksum_task(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = ScheduledTask::start(
            "dialogue.checksum_sync",
            self.config.checksum_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(controller) = weak.upgrade() {
                        controller.sync_checksum();
                    }
                }
            },
        );

        if let Some(previous) = lock(&self.checksum_task).replace(task) {
            previous.cancel();
        }
    }
}
