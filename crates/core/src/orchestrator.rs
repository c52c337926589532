//! Composition root.
//!
//! Builds the four components on one [`EventBus`] and runs the fixed routes
//! between them as spawned listener tasks. Routes are purely reactive and keep
//! going when a receiver lags.

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{ActModeLockStore, IncidentLog, InMemoryIncidentLog, InMemoryLockStore};
use crate::config::AppConfig;
use crate::dialogue::{session_context_key, DialogueConfig, DialogueController};
use crate::domain::health::StatusColor;
use crate::domain::resource::ResourceUsage;
use crate::domain::session::{DialogueMessage, MessageOutcome, SessionId, SessionPhase, SessionSnapshot};
use crate::errors::GovernanceError;
use crate::events::EventBus;
use crate::health::{HealthConfig, HealthMonitor, HealthSummary};
use crate::ids::{Clock, IdGenerator, SystemClock, UuidIdGenerator};
use crate::memory::{ContextMemory, DurableStore, Embedder, HashEmbedder, InMemoryDurableStore, MemoryConfig};
use crate::probe::{AccumulatingUsageMeter, ResourceProbe, StaticProbe, UsageMeter};
use crate::safety::{SafetyConfig, SafetyMonitor, SafetyState};
use crate::sync::lock;

/// Agent id under which context memory reports its own status.
pub const MEMORY_AGENT_ID: &str = "memory";

/// External dependencies injected into the components.
#[derive(Clone)]
pub struct Collaborators {
    pub incident_log: Arc<dyn IncidentLog>,
    /// Receives agent status changes. Usually the same sink as `incident_log`.
    pub decision_log: Arc<dyn IncidentLog>,
    pub lock_store: Arc<dyn ActModeLockStore>,
    pub store: Arc<dyn DurableStore>,
    pub embedder: Arc<dyn Embedder>,
    pub probe: Arc<dyn ResourceProbe>,
    pub usage: Arc<dyn UsageMeter>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Everything in memory: a quiet probe, UUID ids and the system clock.
    pub fn in_memory(embedding_dimensions: usize) -> Self {
        let log: Arc<dyn IncidentLog> = Arc::new(InMemoryIncidentLog::new());
        Self {
            incident_log: Arc::clone(&log),
            decision_log: log,
            lock_store: Arc::new(InMemoryLockStore::new()),
            store: Arc::new(InMemoryDurableStore::new()),
            embedder: Arc::new(HashEmbedder::new(embedding_dimensions)),
            probe: Arc::new(StaticProbe::default()),
            usage: Arc::new(AccumulatingUsageMeter::new()),
            ids: Arc::new(UuidIdGenerator),
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GovernanceConfig {
    pub dialogue: DialogueConfig,
    pub safety: SafetyConfig,
    pub memory: MemoryConfig,
    pub health: HealthConfig,
}

impl From<&AppConfig> for GovernanceConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            dialogue: config.dialogue_config(),
            safety: config.safety_config(),
            memory: config.memory_config(),
            health: config.health_config(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GovernanceStatus {
    pub phase: SessionPhase,
    pub session: Option<SessionSnapshot>,
    pub safety: SafetyState,
    pub health: HealthSummary,
    /// `None` when the lock store could not be read.
    pub act_mode_locked: Option<bool>,
    pub routes_running: usize,
}

pub struct GovernanceOrchestrator {
    bus: EventBus,
    usage: Arc<dyn UsageMeter>,
    dialogue: Arc<DialogueController>,
    safety: Arc<SafetyMonitor>,
    memory: Arc<ContextMemory>,
    health: Arc<HealthMonitor>,
    routes: Mutex<Vec<JoinHandle<()>>>,
}

impl GovernanceOrchestrator {
    pub fn new(config: GovernanceConfig, collaborators: Collaborators) -> Self {
        let bus = EventBus::new();
        let Collaborators {
            incident_log,
            decision_log,
            lock_store,
            store,
            embedder,
            probe,
            usage,
            ids,
            clock,
        } = collaborators;

        let dialogue =
            Arc::new(DialogueController::new(config.dialogue, bus.clone(), ids, Arc::clone(&clock)));
        let safety = Arc::new(SafetyMonitor::new(
            config.safety,
            bus.clone(),
            Arc::clone(&clock),
            incident_log,
            lock_store,
            Arc::clone(&probe),
            Arc::clone(&usage),
        ));
        let memory = Arc::new(ContextMemory::new(
            config.memory,
            bus.clone(),
            Arc::clone(&clock),
            store,
            embedder,
        ));
        let health =
            Arc::new(HealthMonitor::new(config.health, bus.clone(), clock, decision_log, probe));

        Self { bus, usage, dialogue, safety, memory, health, routes: Mutex::new(Vec::new()) }
    }

    pub fn from_app_config(config: &AppConfig, collaborators: Collaborators) -> Self {
        Self::new(GovernanceConfig::from(config), collaborators)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn dialogue(&self) -> &Arc<DialogueController> {
        &self.dialogue
    }

    pub fn safety(&self) -> &Arc<SafetyMonitor> {
        &self.safety
    }

    pub fn memory(&self) -> &Arc<ContextMemory> {
        &self.memory
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Wires the routes and starts every component's periodic tasks. Calling
    /// it again replaces the running routes.
    pub fn start(&self) {
        self.wire_routes();
        self.safety.start();
        self.memory.start();
        self.health.start();
        info!(event_name = "orchestrator.started", "governance core started");
    }

    /// Subscribes the four routes. Events emitted after this returns are
    /// delivered.
    pub fn wire_routes(&self) {
        let routes = vec![
            self.metrics_route(),
            self.shutdown_route(),
            self.checksum_route(),
            self.context_route(),
        ];
        let previous = std::mem::replace(&mut *lock(&self.routes), routes);
        for route in previous {
            route.abort();
        }
    }

    /// Opens a session and queues `speakers` in turn order.
    pub fn start_session<I, S>(&self, speakers: I) -> SessionId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let session_id = self.dialogue.initialize();
        for speaker in speakers {
            let speaker = speaker.into();
            if !self.dialogue.queue_speaker(speaker.clone()) {
                debug!(
                    event_name = "orchestrator.session.speaker_skipped",
                    session_id = %session_id,
                    speaker_id = %speaker,
                    "speaker not queued"
                );
            }
        }
        session_id
    }

    pub fn submit(&self, message: DialogueMessage) -> Result<MessageOutcome, GovernanceError> {
        Ok(self.dialogue.process_message(message)?)
    }

    /// Detaches every route and cleans up all four components.
    pub async fn shutdown(&self) {
        let routes: Vec<JoinHandle<()>> = lock(&self.routes).drain(..).collect();
        for route in routes {
            route.abort();
        }

        self.dialogue.cleanup();
        self.safety.cleanup();
        self.memory.cleanup().await;
        self.health.cleanup().await;
        info!(event_name = "orchestrator.shutdown.completed", "governance core shut down");
    }

    pub async fn status(&self) -> GovernanceStatus {
        let act_mode_locked = match self.safety.is_locked().await {
            Ok(locked) => Some(locked),
            Err(read_error) => {
                warn!(
                    event_name = "orchestrator.status.lock_unreadable",
                    error = %read_error,
                    "could not read act-mode lock"
                );
                None
            }
        };
        let routes_running =
            lock(&self.routes).iter().filter(|route| !route.is_finished()).count();

        GovernanceStatus {
            phase: self.dialogue.phase(),
            session: self.dialogue.snapshot(),
            safety: self.safety.state(),
            health: self.health.summary(),
            act_mode_locked,
            routes_running,
        }
    }

    fn metrics_route(&self) -> JoinHandle<()> {
        let safety = Arc::clone(&self.safety);
        let usage = Arc::clone(&self.usage);
        spawn_route("metrics", self.bus.metrics.subscribe(), move |event| {
            let safety = Arc::clone(&safety);
            let (tokens, cost) = usage.take();
            async move {
                let reading = ResourceUsage {
                    cpu: event.metrics.cpu,
                    memory: event.metrics.memory,
                    tokens,
                    cost,
                };
                safety.monitor(reading).await;
            }
        })
    }

    fn shutdown_route(&self) -> JoinHandle<()> {
        let dialogue = Arc::clone(&self.dialogue);
        spawn_route("shutdown", self.bus.shutdown.subscribe(), move |event| {
            let dialogue = Arc::clone(&dialogue);
            async move {
                warn!(
                    event_name = "orchestrator.shutdown.cascade",
                    reasons = ?event.reasons,
                    "kill switch fired; halting dialogue"
                );
                dialogue.cleanup();
            }
        })
    }

    fn checksum_route(&self) -> JoinHandle<()> {
        let memory = Arc::clone(&self.memory);
        spawn_route("checksum_sync", self.bus.checksum_sync.subscribe(), move |event| {
            let memory = Arc::clone(&memory);
            async move {
                let context_id = session_context_key(&event.snapshot.session_id);
                if let Err(save_error) = memory.save_serialized(&context_id, &event.snapshot).await {
                    warn!(
                        event_name = "orchestrator.checksum.persist_failed",
                        context_id = %context_id,
                        error = %save_error,
                        "could not persist session snapshot"
                    );
                }
            }
        })
    }

    fn context_route(&self) -> JoinHandle<()> {
        let health = Arc::clone(&self.health);
        spawn_route("context_updated", self.bus.context_updated.subscribe(), move |event| {
            let health = Arc::clone(&health);
            async move {
                health
                    .update_agent_status(
                        MEMORY_AGENT_ID,
                        StatusColor::Blue,
                        format!("Context updated: {}", event.context_id),
                    )
                    .await;
            }
        })
    }
}

impl Drop for GovernanceOrchestrator {
    fn drop(&mut self) {
        for route in lock(&self.routes).drain(..) {
            route.abort();
        }
    }
}

fn spawn_route<T, F, Fut>(
    route: &'static str,
    mut receiver: broadcast::Receiver<T>,
    mut handle: F,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => handle(event).await,
                Err(RecvError::Lagged(skipped)) => warn!(
                    event_name = "orchestrator.route.lagged",
                    route,
                    skipped,
                    "route fell behind; skipped events"
                ),
                Err(RecvError::Closed) => break,
            }
        }
        debug!(event_name = "orchestrator.route.closed", route, "route stopped");
    })
}
