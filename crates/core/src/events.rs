//! Typed publish/subscribe bus.
//!
//! Each named channel is a [`Topic`] carrying exactly one payload type, so the
//! orchestrator's routes are checked by the compiler rather than matched on
//! event-name strings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::context::ChecksumRecord;
use crate::domain::health::{HealthMetrics, StatusColor};
use crate::domain::resource::MetricsSnapshot;
use crate::domain::session::{HaltReason, MessageId, SessionId, SessionSnapshot};

pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// One broadcast channel. `emit` never awaits; lagging receivers lose the
/// oldest events instead of blocking the publisher.
pub struct Topic<T> {
    tx: broadcast::Sender<T>,
    emitted: Arc<AtomicU64>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), emitted: Arc::clone(&self.emitted) }
    }
}

impl<T> Topic<T>
where
    T: Clone + Send + 'static,
{
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, emitted: Arc::new(AtomicU64::new(0)) }
    }

    /// Returns the number of receivers that were handed the event.
    pub fn emit(&self, event: T) -> usize {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn emit_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStarted {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProcessed {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub speaker_id: String,
    pub turn_count: u32,
    pub token_count: u64,
    pub tokens_added: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHalted {
    pub session_id: SessionId,
    pub reason: HaltReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSync {
    pub checksum: ChecksumRecord,
    pub snapshot: SessionSnapshot,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShutdownEvent {
    pub reasons: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub snapshot: MetricsSnapshot,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUpdated {
    pub context_id: String,
    pub checksum: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    pub context_id: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatusChanged {
    pub agent_id: String,
    pub previous: Option<StatusColor>,
    pub current: StatusColor,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsReported {
    pub metrics: HealthMetrics,
    pub color: StatusColor,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMissed {
    pub channel_id: String,
    pub last_acknowledged: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

/// Every channel in the system. Cloning shares the underlying senders.
#[derive(Clone)]
pub struct EventBus {
    pub session_started: Topic<SessionStarted>,
    pub message_processed: Topic<MessageProcessed>,
    pub session_halted: Topic<SessionHalted>,
    pub checksum_sync: Topic<ChecksumSync>,
    pub shutdown: Topic<ShutdownEvent>,
    pub context_updated: Topic<ContextUpdated>,
    pub integrity_violation: Topic<IntegrityViolation>,
    pub status_changed: Topic<AgentStatusChanged>,
    pub metrics: Topic<MetricsReported>,
    pub heartbeat_missed: Topic<HeartbeatMissed>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            session_started: Topic::with_capacity(capacity),
            message_processed: Topic::with_capacity(capacity),
            session_halted: Topic::with_capacity(capacity),
            checksum_sync: Topic::with_capacity(capacity),
            shutdown: Topic::with_capacity(capacity),
            context_updated: Topic::with_capacity(capacity),
            integrity_violation: Topic::with_capacity(capacity),
            status_changed: Topic::with_capacity(capacity),
            metrics: Topic::with_capacity(capacity),
            heartbeat_missed: Topic::with_capacity(capacity),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::RecvError;

    use super::{ContextUpdated, EventBus, Topic};

    fn updated(id: &str) -> ContextUpdated {
        ContextUpdated { context_id: id.to_string(), checksum: "abc".to_string() }
    }

    #[test]
    fn emit_without_subscribers_is_counted_but_not_delivered() {
        let topic = Topic::<ContextUpdated>::with_capacity(4);
        assert_eq!(topic.emit(updated("c-1")), 0);
        assert_eq!(topic.emit_count(), 1);
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_event() {
        let bus = EventBus::new();
        let mut first = bus.context_updated.subscribe();
        let mut second = bus.context_updated.subscribe();
        assert_eq!(bus.context_updated.subscriber_count(), 2);

        assert_eq!(bus.context_updated.emit(updated("c-1")), 2);

        assert_eq!(first.recv().await.expect("first receiver").context_id, "c-1");
        assert_eq!(second.recv().await.expect("second receiver").context_id, "c-1");
    }

    #[tokio::test]
    async fn cloned_bus_shares_channels() {
        let bus = EventBus::new();
        let mut receiver = bus.context_updated.subscribe();
        let clone = bus.clone();

        clone.context_updated.emit(updated("c-2"));

        assert_eq!(receiver.recv().await.expect("event via clone").context_id, "c-2");
        assert_eq!(bus.context_updated.emit_count(), 1);
    }

    #[tokio::test]
    async fn slow_receiver_lags_instead_of_blocking() {
        let topic = Topic::<ContextUpdated>::with_capacity(2);
        let mut receiver = topic.subscribe();

        topic.emit(updated("c-1"));
        topic.emit(updated("c-2"));
        topic.emit(updated("c-3"));

        assert!(matches!(receiver.recv().await, Err(RecvError::Lagged(1))));
        assert_eq!(receiver.recv().await.expect("c-2 retained").context_id, "c-2");
    }
}
