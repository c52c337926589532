//! Governance core for supervised two-agent dialogues.
//!
//! The crate owns every governance component and the typed event bus that
//! connects them:
//! - **Dialogue** (`dialogue`) - turn-taking state machine with turn/token/time boundaries
//! - **Safety** (`safety`) - sliding-window kill switch with durable act-mode lock
//! - **Memory** (`memory`) - tiered context cache with checksum verification
//! - **Health** (`health`) - agent status registry, heartbeat liveness, health colors
//! - **Orchestrator** (`orchestrator`) - composition root wiring the routes between them
//!
//! # Event routes
//!
//! ```text
//! HealthMonitor --metrics--> SafetyMonitor --shutdown--> DialogueController
//! DialogueController --checksum sync--> ContextMemory --context updated--> HealthMonitor
//! ```
//!
//! Components never share registries. Everything crossing a component boundary
//! travels through [`events::EventBus`].

pub mod audit;
pub mod checksum;
pub mod config;
pub mod dialogue;
pub mod domain;
pub mod errors;
pub mod events;
pub mod health;
pub mod ids;
pub mod memory;
pub mod orchestrator;
pub mod probe;
pub mod safety;
pub mod schedule;
mod sync;

pub use audit::{
    ActModeLockStore, IncidentLog, InMemoryIncidentLog, InMemoryLockStore, LogEntry, SinkError,
};
pub use checksum::{ChecksumError, ChecksumStore};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use dialogue::{DialogueConfig, DialogueController, DialogueError};
pub use domain::context::{ChecksumRecord, RecordMetadata, VectorMatch, VectorRecord};
pub use domain::health::{AgentStatus, HealthMetricSample, HealthMetrics, StatusColor};
pub use domain::resource::{
    ActModeLock, Incident, MetricsSnapshot, ResourceMetric, ResourceSample, ResourceUsage,
};
pub use domain::session::{
    BoundaryKind, DialogueMessage, DialogueSession, HaltReason, MessageId, MessageOutcome,
    SessionId, SessionPhase, SessionSnapshot,
};
pub use errors::{ErrorCategory, GovernanceError};
pub use events::{EventBus, Topic};
pub use health::{
    AgentChannel, ChannelError, HealthConfig, HealthMonitor, HealthSummary, RecordingChannel,
    WireMessage,
};
pub use ids::{
    Clock, IdGenerator, ManualClock, SequentialIdGenerator, SystemClock, UuidIdGenerator,
};
pub use memory::{
    ContextMemory, DurableStore, Embedder, HashEmbedder, InMemoryDurableStore, MemoryConfig,
    MemoryError, StoreError,
};
pub use orchestrator::{
    Collaborators, GovernanceConfig, GovernanceOrchestrator, GovernanceStatus, MEMORY_AGENT_ID,
};
pub use probe::{AccumulatingUsageMeter, ProbeError, ResourceProbe, StaticProbe, UsageMeter};
pub use safety::{SafetyConfig, SafetyMonitor, SafetyState};
pub use schedule::ScheduledTask;
