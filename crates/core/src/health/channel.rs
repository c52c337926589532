use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain::health::{HealthMetrics, StatusColor};

/// JSON messages exchanged with agents, discriminated by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: DateTime<Utc> },
    #[serde(rename = "heartbeat:response")]
    HeartbeatResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(rename = "agent:status", rename_all = "camelCase")]
    AgentStatus {
        agent_id: String,
        status: StatusColor,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "health:report")]
    HealthReport { metrics: HealthMetrics },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel send failed: {0}")]
    Send(String),
    #[error("channel already closed: {0}")]
    Closed(String),
}

/// One connected agent's outbound message channel.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    fn channel_id(&self) -> &str;
    async fn send(&self, message: &WireMessage) -> Result<(), ChannelError>;
    async fn close(&self) -> Result<(), ChannelError>;
}

#[derive(Default)]
struct RecordingState {
    sent: Vec<WireMessage>,
    closed: bool,
    fail_sends: bool,
}

/// Channel that records everything sent to it.
#[derive(Clone)]
pub struct RecordingChannel {
    id: String,
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), state: Arc::new(Mutex::new(RecordingState::default())) }
    }

    pub async fn sent(&self) -> Vec<WireMessage> {
        self.state.lock().await.sent.clone()
    }

    pub async fn heartbeats_sent(&self) -> usize {
        self.state
            .lock()
            .await
            .sent
            .iter()
            .filter(|message| matches!(message, WireMessage::Heartbeat { .. }))
            .count()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn fail_sends(&self, fail: bool) {
        self.state.lock().await.fail_sends = fail;
    }
}

#[async_trait]
impl AgentChannel for RecordingChannel {
    fn channel_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: &WireMessage) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ChannelError::Closed(self.id.clone()));
        }
        if state.fail_sends {
            return Err(ChannelError::Send(format!("{} configured to fail", self.id)));
        }
        state.sent.push(message.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ChannelError::Closed(self.id.clone()));
        }
        state.closed = true;
        Ok(())
    }
}
