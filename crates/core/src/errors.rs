use thiserror::Error;

use crate::audit::SinkError;
use crate::config::ConfigError;
use crate::dialogue::DialogueError;
use crate::memory::{MemoryError, StoreError};

/// Which part of the governance taxonomy an error belongs to.
///
/// Safety violations, integrity mismatches and missed heartbeats never surface
/// here: they escalate to shutdown, log a warning, or publish an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Protocol,
    Collaborator,
    Internal,
    Configuration,
}

#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error(transparent)]
    Dialogue(#[from] DialogueError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl From<StoreError> for GovernanceError {
    fn from(value: StoreError) -> Self {
        Self::Memory(MemoryError::Store(value))
    }
}

impl GovernanceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Dialogue(_) => ErrorCategory::Protocol,
            Self::Memory(MemoryError::Serialize(_)) => ErrorCategory::Internal,
            Self::Memory(_) | Self::Sink(_) => ErrorCategory::Collaborator,
            Self::Configuration(_) => ErrorCategory::Configuration,
        }
    }

    /// Collaborator failures may succeed on retry; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Memory(MemoryError::NotFound(_)) => false,
            other => other.category() == ErrorCategory::Collaborator,
        }
    }

    pub fn operator_message(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Protocol => {
                "The dialogue rejected the message. Check speaker order and session limits."
            }
            ErrorCategory::Internal => "Context could not be encoded for storage.",
            ErrorCategory::Collaborator => {
                "A storage or logging collaborator is unavailable. Please retry shortly."
            }
            ErrorCategory::Configuration => "The governance core is misconfigured.",
        }
    }
}
