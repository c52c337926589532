//! Sliding-window kill switch.
//!
//! Every ingestion prunes the per-metric buckets to the configured window,
//! appends one sample per metric and evaluates cost and token totals plus cpu
//! and memory means. Any breach runs the full emergency shutdown sequence:
//! mark active, append the incident, publish `Shutdown`, write the act-mode
//! lock. Sink failures are logged and never stop the sequence.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::audit::{ActModeLockStore, IncidentLog, LogEntry, SinkError};
use crate::domain::resource::{
    ActModeLock, Incident, MetricsSnapshot, ResourceMetric, ResourceSample, ResourceUsage,
};
use crate::events::{EventBus, ShutdownEvent};
use crate::ids::Clock;
use crate::probe::{ResourceProbe, UsageMeter};
use crate::schedule::ScheduledTask;
use crate::sync::lock;

pub const MONITORING_FAILURE: &str = "Monitoring system failure";
pub const LOCK_REASON: &str = "Emergency shutdown - audit required";

#[derive(Clone, Debug, PartialEq)]
pub struct SafetyConfig {
    /// Total cost allowed inside `cost_window`.
    pub cost_threshold: f64,
    pub cost_window: Duration,
    /// Mean cpu percentage allowed inside the window.
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    /// Total tokens allowed inside the window.
    pub token_rate_threshold: f64,
    pub check_interval: Duration,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            cost_threshold: 10.0,
            cost_window: Duration::from_secs(3_600),
            cpu_threshold: 80.0,
            memory_threshold: 80.0,
            token_rate_threshold: 10_000.0,
            check_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SafetyState {
    pub is_active: bool,
    pub incident_count: u64,
    pub last_reasons: Vec<String>,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MonitorState {
    buckets: BTreeMap<ResourceMetric, VecDeque<ResourceSample>>,
    status: SafetyState,
}

impl MonitorState {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        for bucket in self.buckets.values_mut() {
            while bucket.front().is_some_and(|sample| sample.timestamp < cutoff) {
                bucket.pop_front();
            }
        }
    }

    fn record(&mut self, usage: &ResourceUsage, timestamp: DateTime<Utc>) {
        for metric in ResourceMetric::ALL {
            self.buckets.entry(metric).or_default().push_back(ResourceSample {
                metric,
                value: usage.value_of(metric),
                timestamp,
            });
        }
    }

    fn total(&self, metric: ResourceMetric) -> f64 {
        self.buckets
            .get(&metric)
            .map(|bucket| bucket.iter().map(|sample| sample.value).sum())
            .unwrap_or(0.0)
    }

    fn mean(&self, metric: ResourceMetric) -> f64 {
        match self.buckets.get(&metric) {
            Some(bucket) if !bucket.is_empty() => self.total(metric) / bucket.len() as f64,
            _ => 0.0,
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        self.buckets
            .iter()
            .map(|(metric, bucket)| (*metric, bucket.iter().copied().collect()))
            .collect()
    }
}

pub struct SafetyMonitor {
    config: SafetyConfig,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    incident_log: Arc<dyn IncidentLog>,
    lock_store: Arc<dyn ActModeLockStore>,
    probe: Arc<dyn ResourceProbe>,
    usage: Arc<dyn UsageMeter>,
    state: Mutex<MonitorState>,
    polling: Mutex<Option<ScheduledTask>>,
}

impl SafetyMonitor {
    pub fn new(
        config: SafetyConfig,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        incident_log: Arc<dyn IncidentLog>,
        lock_store: Arc<dyn ActModeLockStore>,
        probe: Arc<dyn ResourceProbe>,
        usage: Arc<dyn UsageMeter>,
    ) -> Self {
        Self {
            config,
            bus,
            clock,
            incident_log,
            lock_store,
            probe,
            usage,
            state: Mutex::new(MonitorState::default()),
            polling: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Ingests one usage reading and returns the violated thresholds, if any.
    pub async fn monitor(&self, usage: ResourceUsage) -> Vec<String> {
        let now = self.clock.now();

        if !usage.is_finite() {
            warn!(
                event_name = "safety.monitor.invalid_sample",
                cpu = usage.cpu,
                memory = usage.memory,
                tokens = usage.tokens,
                cost = usage.cost,
                "non-finite resource sample"
            );
            return self.fail_safe(now).await;
        }

        let cutoff = chrono::Duration::from_std(self.config.cost_window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let (reasons, snapshot) = {
            let mut state = lock(&self.state);
            state.prune(cutoff);
            state.record(&usage, now);
            (self.evaluate(&state), state.snapshot())
        };

        if !reasons.is_empty() {
            self.emergency_shutdown(reasons.clone(), snapshot, now).await;
        }
        reasons
    }

    /// Reads the probe and usage meter once and feeds the result to `monitor`.
    pub async fn poll_once(&self) -> Vec<String> {
        match self.probe.sample().await {
            Ok(metrics) => {
                let (tokens, cost) = self.usage.take();
                let usage =
                    ResourceUsage { cpu: metrics.cpu, memory: metrics.memory, tokens, cost };
                self.monitor(usage).await
            }
            Err(probe_error) => {
                warn!(
                    event_name = "safety.monitor.probe_failed",
                    error = %probe_error,
                    "resource probe failed"
                );
                self.fail_safe(self.clock.now()).await
            }
        }
    }

    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = ScheduledTask::start("safety.poll", self.config.check_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(monitor) = weak.upgrade() {
                    monitor.poll_once().await;
                }
            }
        });

        if let Some(previous) = lock(&self.polling).replace(task) {
            previous.cancel();
        }
    }

    pub fn cleanup(&self) {
        if let Some(task) = lock(&self.polling).take() {
            task.cancel();
        }
    }

    pub fn state(&self) -> SafetyState {
        lock(&self.state).status.clone()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        lock(&self.state).snapshot()
    }

    /// Whether an act-mode lock is present in the durable lock store.
    pub async fn is_locked(&self) -> Result<bool, SinkError> {
        Ok(self.lock_store.read_lock().await?.is_some())
    }

    fn evaluate(&self, state: &MonitorState) -> Vec<String> {
        let mut reasons = Vec::new();

        let cost = state.total(ResourceMetric::Cost);
        if cost > self.config.cost_threshold {
            reasons.push(format!(
                "Cost threshold exceeded: {cost:.2} > {:.2}",
                self.config.cost_threshold
            ));
        }

        let tokens = state.total(ResourceMetric::Tokens);
        if tokens > self.config.token_rate_threshold {
            reasons.push(format!(
                "Token rate threshold exceeded: {tokens:.0} > {:.0}",
                self.config.token_rate_threshold
            ));
        }

        let cpu = state.mean(ResourceMetric::Cpu);
        if cpu > self.config.cpu_threshold {
            reasons.push(format!(
                "CPU threshold exceeded: {cpu:.1}% > {:.1}%",
                self.config.cpu_threshold
            ));
        }

        let memory = state.mean(ResourceMetric::Memory);
        if memory > self.config.memory_threshold {
            reasons.push(format!(
                "Memory threshold exceeded: {memory:.1}% > {:.1}%",
                self.config.memory_threshold
            ));
        }

        reasons
    }

    async fn fail_safe(&self, now: DateTime<Utc>) -> Vec<String> {
        let reasons = vec![MONITORING_FAILURE.to_string()];
        let snapshot = self.metrics_snapshot();
        self.emergency_shutdown(reasons.clone(), snapshot, now).await;
        reasons
    }

    async fn emergency_shutdown(
        &self,
        reasons: Vec<String>,
        snapshot: MetricsSnapshot,
        timestamp: DateTime<Utc>,
    ) {
        let incident_number = {
            let mut state = lock(&self.state);
            state.status.is_active = true;
            state.status.incident_count += 1;
            state.status.last_reasons = reasons.clone();
            state.status.last_triggered_at = Some(timestamp);
            state.status.incident_count
        };

        error!(
            event_name = "safety.shutdown.triggered",
            incident_number,
            reasons = ?reasons,
            "emergency shutdown triggered"
        );

        let incident = Incident::emergency_shutdown(reasons.clone(), timestamp, snapshot.clone());
        if let Err(sink_error) = self.incident_log.append(LogEntry::from_incident(&incident)).await {
            warn!(
                event_name = "safety.incident.write_failed",
                error = %sink_error,
                "could not append emergency shutdown incident"
            );
        }

        self.bus.shutdown.emit(ShutdownEvent { reasons, timestamp, snapshot });

        let act_lock = ActModeLock { timestamp, reason: LOCK_REASON.to_string() };
        match self.lock_store.write_lock(&act_lock).await {
            Ok(()) => info!(
                event_name = "safety.lock.written",
                incident_number,
                "act-mode lock written; audit required before resuming"
            ),
            Err(sink_error) => error!(
                event_name = "safety.lock.write_failed",
                error = %sink_error,
                "could not write act-mode lock"
            ),
        }
    }
}
