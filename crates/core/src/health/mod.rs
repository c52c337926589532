//! Agent status registry, heartbeat liveness and health colors.

mod channel;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use channel::{AgentChannel, ChannelError, RecordingChannel, WireMessage};

use crate::audit::{IncidentLog, LogEntry};
use crate::domain::health::{AgentStatus, HealthMetricSample, HealthMetrics, StatusColor};
use crate::events::{AgentStatusChanged, EventBus, HeartbeatMissed, MetricsReported};
use crate::ids::{elapsed, Clock};
use crate::probe::ResourceProbe;
use crate::schedule::ScheduledTask;
use crate::sync::lock;

#[derive(Clone, Debug, PartialEq)]
pub struct HealthConfig {
    pub heartbeat_interval: Duration,
    pub health_check_interval: Duration,
    pub metrics_retention: Duration,
    /// Cpu or memory movement, in percentage points, that makes a report significant.
    pub significant_delta: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            metrics_retention: Duration::from_secs(3_600),
            significant_delta: 20.0,
        }
    }
}

/// Read-out for operators and the `/health` endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthSummary {
    pub color: StatusColor,
    pub agents: Vec<AgentStatus>,
    pub connections: usize,
    pub latest: Option<HealthMetricSample>,
}

struct Connection {
    channel: Arc<dyn AgentChannel>,
    last_ack: DateTime<Utc>,
    missed_reported: bool,
}

#[derive(Default)]
struct HealthState {
    agents: BTreeMap<String, AgentStatus>,
    history: VecDeque<HealthMetricSample>,
    connections: BTreeMap<String, Connection>,
}

pub struct HealthMonitor {
    config: HealthConfig,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    decision_log: Arc<dyn IncidentLog>,
    probe: Arc<dyn ResourceProbe>,
    state: Mutex<HealthState>,
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        decision_log: Arc<dyn IncidentLog>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        Self {
            config,
            bus,
            clock,
            decision_log,
            probe,
            state: Mutex::new(HealthState::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Last write wins. Returns `true` when the agent's color changed, which
    /// includes its first report.
    pub async fn update_agent_status(
        &self,
        agent_id: &str,
        color: StatusColor,
        message: impl Into<String>,
    ) -> bool {
        let message = message.into();
        let previous = lock(&self.state)
            .agents
            .insert(
                agent_id.to_string(),
                AgentStatus { agent_id: agent_id.to_string(), color, message: message.clone() },
            )
            .map(|status| status.color);

        if previous == Some(color) {
            return false;
        }

        info!(
            event_name = "health.agent.status_changed",
            agent_id,
            previous = previous.map(|c| c.as_str()).unwrap_or("NONE"),
            current = color.as_str(),
            message = %message,
            "agent status changed"
        );
        self.bus.status_changed.emit(AgentStatusChanged {
            agent_id: agent_id.to_string(),
            previous,
            current: color,
            message: message.clone(),
        });

        let entry = LogEntry::status_change(self.clock.now(), agent_id, previous, color, &message);
        if let Err(sink_error) = self.decision_log.append(entry).await {
            warn!(
                event_name = "health.decision_log.write_failed",
                agent_id,
                error = %sink_error,
                "could not record status change"
            );
        }
        true
    }

    /// Records a metrics report and publishes it when it is significant.
    pub fn process_health_report(&self, metrics: HealthMetrics) -> Option<MetricsReported> {
        if !metrics.cpu.is_finite() || !metrics.memory.is_finite() {
            warn!(
                event_name = "health.report.invalid",
                cpu = metrics.cpu,
                memory = metrics.memory,
                "dropping non-finite health report"
            );
            return None;
        }

        let now = self.clock.now();
        let color = StatusColor::from_load(metrics.cpu, metrics.memory);
        let sample = HealthMetricSample { timestamp: now, metrics: metrics.clone(), color };

        let significant = {
            let mut state = lock(&self.state);
            while state
                .history
                .front()
                .is_some_and(|oldest| elapsed(now, oldest.timestamp) > self.config.metrics_retention)
            {
                state.history.pop_front();
            }
            let significant = match state.history.back() {
                None => true,
                Some(previous) => {
                    (metrics.cpu - previous.metrics.cpu).abs() > self.config.significant_delta
                        || (metrics.memory - previous.metrics.memory).abs()
                            > self.config.significant_delta
                        || previous.color != color
                }
            };
            state.history.push_back(sample);
            significant
        };

        if !significant {
            return None;
        }

        debug!(
            event_name = "health.metrics.reported",
            cpu = metrics.cpu,
            memory = metrics.memory,
            color = color.as_str(),
            "significant health change"
        );
        let event = MetricsReported { metrics, color, timestamp: now };
        self.bus.metrics.emit(event.clone());
        Some(event)
    }

    pub fn connect(&self, channel: Arc<dyn AgentChannel>) {
        let channel_id = channel.channel_id().to_string();
        let connection = Connection { channel, last_ack: self.clock.now(), missed_reported: false };
        let replaced = lock(&self.state).connections.insert(channel_id.clone(), connection).is_some();
        info!(event_name = "health.channel.connected", channel_id = %channel_id, replaced, "agent channel connected");
    }

    pub async fn disconnect(&self, channel_id: &str) -> bool {
        let removed = lock(&self.state).connections.remove(channel_id);
        let Some(connection) = removed else {
            return false;
        };
        if let Err(close_error) = connection.channel.close().await {
            debug!(
                event_name = "health.channel.close_failed",
                channel_id,
                error = %close_error,
                "channel close failed"
            );
        }
        info!(event_name = "health.channel.disconnected", channel_id, "agent channel disconnected");
        true
    }

    pub async fn handle_message(&self, channel_id: &str, message: WireMessage) {
        match message {
            WireMessage::HeartbeatResponse { .. } => self.record_ack(channel_id),
            WireMessage::AgentStatus { agent_id, status, message } => {
                self.update_agent_status(&agent_id, status, message.unwrap_or_default()).await;
            }
            WireMessage::HealthReport { metrics } => {
                self.process_health_report(metrics);
            }
            WireMessage::Heartbeat { .. } => debug!(
                event_name = "health.message.ignored",
                channel_id,
                "inbound heartbeat request ignored"
            ),
        }
    }

    /// Parses a raw JSON frame. Malformed or unknown frames are logged and dropped.
    pub async fn handle_raw(&self, channel_id: &str, raw: &str) {
        match serde_json::from_str::<WireMessage>(raw) {
            Ok(message) => self.handle_message(channel_id, message).await,
            Err(parse_error) => warn!(
                event_name = "health.message.malformed",
                channel_id,
                error = %parse_error,
                "dropping malformed agent message"
            ),
        }
    }

    /// Reports silent channels, then sends a heartbeat on every channel.
    pub async fn heartbeat_tick(&self) -> Vec<HeartbeatMissed> {
        let now = self.clock.now();
        let deadline = self.config.heartbeat_interval.saturating_mul(2);

        let (missed, channels) = {
            let mut state = lock(&self.state);
            let mut missed = Vec::new();
            for (channel_id, connection) in state.connections.iter_mut() {
                if connection.missed_reported || elapsed(now, connection.last_ack) <= deadline {
                    continue;
                }
                connection.missed_reported = true;
                missed.push(HeartbeatMissed {
                    channel_id: channel_id.clone(),
                    last_acknowledged: connection.last_ack,
                    detected_at: now,
                });
            }
            let channels: Vec<Arc<dyn AgentChannel>> =
                state.connections.values().map(|connection| Arc::clone(&connection.channel)).collect();
            (missed, channels)
        };

        for event in &missed {
            warn!(
                event_name = "health.heartbeat.missed",
                channel_id = %event.channel_id,
                last_acknowledged = %event.last_acknowledged,
                "agent missed heartbeat"
            );
            self.bus.heartbeat_missed.emit(event.clone());
        }

        let heartbeat = WireMessage::Heartbeat { timestamp: now };
        for channel in channels {
            if let Err(send_error) = channel.send(&heartbeat).await {
                warn!(
                    event_name = "health.heartbeat.send_failed",
                    channel_id = channel.channel_id(),
                    error = %send_error,
                    "could not send heartbeat"
                );
            }
        }

        missed
    }

    /// Samples the resource probe once into the metrics history.
    pub async fn collect_once(&self) -> Option<MetricsReported> {
        match self.probe.sample().await {
            Ok(metrics) => self.process_health_report(metrics),
            Err(probe_error) => {
                warn!(
                    event_name = "health.collect.failed",
                    error = %probe_error,
                    "health probe failed; skipping sample"
                );
                None
            }
        }
    }

    pub fn start(self: &Arc<Self>) {
        let heartbeat = {
            let weak: Weak<Self> = Arc::downgrade(self);
            ScheduledTask::start("health.heartbeat", self.config.heartbeat_interval, move || {
                let weak = weak.clone();
                async move {
                    if let Some(monitor) = weak.upgrade() {
                        monitor.heartbeat_tick().await;
                    }
                }
            })
        };
        let collection = {
            let weak: Weak<Self> = Arc::downgrade(self);
            ScheduledTask::start("health.collect", self.config.health_check_interval, move || {
                let weak = weak.clone();
                async move {
                    if let Some(monitor) = weak.upgrade() {
                        monitor.collect_once().await;
                    }
                }
            })
        };

        let previous = std::mem::replace(&mut *lock(&self.tasks), vec![heartbeat, collection]);
        for task in previous {
            task.cancel();
        }
    }

    /// Cancels both tasks, closes every channel and clears all registries.
    pub async fn cleanup(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.cancel();
        }

        let connections: Vec<Connection> = {
            let mut state = lock(&self.state);
            state.agents.clear();
            state.history.clear();
            let connections = std::mem::take(&mut state.connections);
            connections.into_values().collect()
        };

        for connection in connections {
            if let Err(close_error) = connection.channel.close().await {
                debug!(
                    event_name = "health.channel.close_failed",
                    channel_id = connection.channel.channel_id(),
                    error = %close_error,
                    "channel close failed during cleanup"
                );
            }
        }
        info!(event_name = "health.cleanup.completed", "health monitor cleaned up");
    }

    /// Worst of the latest metrics color and every agent's reported color.
    pub fn aggregate_color(&self) -> StatusColor {
        let state = lock(&self.state);
        let latest = state.history.back().map(|sample| sample.color);
        state
            .agents
            .values()
            .map(|status| status.color)
            .chain(latest)
            .max()
            .unwrap_or(StatusColor::Blue)
    }

    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        lock(&self.state).agents.get(agent_id).cloned()
    }

    pub fn metrics_history(&self) -> Vec<HealthMetricSample> {
        lock(&self.state).history.iter().cloned().collect()
    }

    pub fn summary(&self) -> HealthSummary {
        let color = self.aggregate_color();
        let state = lock(&self.state);
        HealthSummary {
            color,
            agents: state.agents.values().cloned().collect(),
            connections: state.connections.len(),
            latest: state.history.back().cloned(),
        }
    }

    fn record_ack(&self, channel_id: &str) {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        match state.connections.get_mut(channel_id) {
            Some(connection) => {
                connection.last_ack = now;
                connection.missed_reported = false;
            }
            None => debug!(
                event_name = "health.heartbeat.unknown_channel",
                channel_id,
                "heartbeat response from unknown channel"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::audit::{InMemoryIncidentLog, STATUS_CHANGE};
    use crate::domain::health::{HealthMetrics, StatusColor};
    use crate::events::EventBus;
    use crate::health::{HealthConfig, HealthMonitor, RecordingChannel, WireMessage};
    use crate::ids::ManualClock;
    use crate::probe::StaticProbe;

    struct Fixture {
        monitor: Arc<HealthMonitor>,
        bus: EventBus,
        clock: Arc<ManualClock>,
        decisions: InMemoryIncidentLog,
        probe: StaticProbe,
    }

    fn fixture(config: HealthConfig) -> Fixture {
        let bus = EventBus::new();
        let clock = Arc::new(ManualClock::default());
        let decisions = InMemoryIncidentLog::new();
        let probe = StaticProbe::new(10.0, 10.0);
        let monitor = Arc::new(HealthMonitor::new(
            config,
            bus.clone(),
            clock.clone(),
            Arc::new(decisions.clone()),
            Arc::new(probe.clone()),
        ));
        Fixture { monitor, bus, clock, decisions, probe }
    }

    #[tokio::test]
    async fn only_color_changes_are_published() {
        let fx = fixture(HealthConfig::default());
        let mut changes = fx.bus.status_changed.subscribe();

        assert!(fx.monitor.update_agent_status("agent-a", StatusColor::Blue, "ready").await);
        assert!(!fx.monitor.update_agent_status("agent-a", StatusColor::Blue, "still ready").await);
        assert!(fx.monitor.update_agent_status("agent-a", StatusColor::Orange, "busy").await);

        let first = changes.recv().await.expect("first change");
        assert_eq!(first.previous, None);
        let second = changes.recv().await.expect("second change");
        assert_eq!(second.previous, Some(StatusColor::Blue));
        assert_eq!(second.current, StatusColor::Orange);
        assert!(changes.try_recv().is_err());

        let status = fx.monitor.agent_status("agent-a").expect("registered");
        assert_eq!(status.message, "busy");
    }

    #[tokio::test]
    async fn status_change_is_written_to_decision_log() {
        let fx = fixture(HealthConfig::default());
        fx.monitor.update_agent_status("agent-a", StatusColor::Blue, "ready").await;
        fx.monitor.update_agent_status("agent-a", StatusColor::Orange, "busy").await;

        let entries = fx.decisions.entries_of_kind(STATUS_CHANGE);
        assert_eq!(entries.len(), 2);
        assert!(entries[1].details.iter().any(|detail| detail == "Status: BLUE -> ORANGE"));
    }

    #[tokio::test]
    async fn same_message_last_write_wins() {
        let fx = fixture(HealthConfig::default());
        fx.monitor.update_agent_status("agent-a", StatusColor::Purple, "first").await;
        fx.monitor.update_agent_status("agent-a", StatusColor::Purple, "second").await;

        assert_eq!(fx.monitor.agent_status("agent-a").map(|s| s.message), Some("second".into()));
    }

    #[test]
    fn large_cpu_swing_publishes_both_reports() {
        let fx = fixture(HealthConfig::default());

        assert!(fx.monitor.process_health_report(HealthMetrics::new(10.0, 10.0)).is_some());
        assert!(fx.monitor.process_health_report(HealthMetrics::new(31.0, 10.0)).is_some());

        assert_eq!(fx.bus.metrics.emit_count(), 2);
    }

    #[test]
    fn small_cpu_swing_publishes_only_first_report() {
        let fx = fixture(HealthConfig::default());

        fx.monitor.process_health_report(HealthMetrics::new(10.0, 10.0));
        assert!(fx.monitor.process_health_report(HealthMetrics::new(15.0, 10.0)).is_none());

        assert_eq!(fx.bus.metrics.emit_count(), 1);
        assert_eq!(fx.monitor.metrics_history().len(), 2);
    }

    #[test]
    fn color_change_is_significant_even_for_small_swing() {
        let fx = fixture(HealthConfig::default());

        fx.monitor.process_health_report(HealthMetrics::new(48.0, 10.0));
        let event = fx
            .monitor
            .process_health_report(HealthMetrics::new(52.0, 10.0))
            .expect("BLUE -> PURPLE is significant");

        assert_eq!(event.color, StatusColor::Purple);
        assert_eq!(fx.monitor.aggregate_color(), StatusColor::Purple);
    }

    #[test]
    fn history_is_pruned_to_retention() {
        let fx = fixture(HealthConfig {
            metrics_retention: Duration::from_secs(60),
            ..HealthConfig::default()
        });

        fx.monitor.process_health_report(HealthMetrics::new(10.0, 10.0));
        fx.clock.advance(Duration::from_secs(61));
        fx.monitor.process_health_report(HealthMetrics::new(10.0, 10.0));

        assert_eq!(fx.monitor.metrics_history().len(), 1);
        assert_eq!(fx.bus.metrics.emit_count(), 2, "pruned history makes the report first again");
    }

    #[test]
    fn non_finite_report_is_dropped() {
        let fx = fixture(HealthConfig::default());
        assert!(fx.monitor.process_health_report(HealthMetrics::new(f64::NAN, 10.0)).is_none());
        assert!(fx.monitor.metrics_history().is_empty());
    }

    #[tokio::test]
    async fn silent_channel_is_reported_once_until_it_acks() {
        let fx = fixture(HealthConfig {
            heartbeat_interval: Duration::from_secs(30),
            ..HealthConfig::default()
        });
        let channel = RecordingChannel::new("agent-a");
        fx.monitor.connect(Arc::new(channel.clone()));

        assert!(fx.monitor.heartbeat_tick().await.is_empty());
        assert_eq!(channel.heartbeats_sent().await, 1);

        fx.clock.advance(Duration::from_secs(61));
        let missed = fx.monitor.heartbeat_tick().await;
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].channel_id, "agent-a");
        assert!(fx.monitor.heartbeat_tick().await.is_empty(), "reported once per silence");

        fx.monitor.handle_raw("agent-a", r#"{"type":"heartbeat:response"}"#).await;
        fx.clock.advance(Duration::from_secs(30));
        assert!(fx.monitor.heartbeat_tick().await.is_empty());
        assert_eq!(fx.bus.heartbeat_missed.emit_count(), 1);
        assert_eq!(channel.heartbeats_sent().await, 4);
    }

    #[tokio::test]
    async fn failed_send_does_not_stop_other_channels() {
        let fx = fixture(HealthConfig::default());
        let broken = RecordingChannel::new("agent-a");
        let healthy = RecordingChannel::new("agent-b");
        broken.fail_sends(true).await;
        fx.monitor.connect(Arc::new(broken.clone()));
        fx.monitor.connect(Arc::new(healthy.clone()));

        fx.monitor.heartbeat_tick().await;

        assert_eq!(broken.heartbeats_sent().await, 0);
        assert_eq!(healthy.heartbeats_sent().await, 1);
    }

    #[tokio::test]
    async fn raw_frames_update_status_and_metrics() {
        let fx = fixture(HealthConfig::default());

        fx.monitor
            .handle_raw(
                "agent-a",
                r#"{"type":"agent:status","agentId":"agent-a","status":"YELLOW","message":"overloaded"}"#,
            )
            .await;
        fx.monitor
            .handle_raw("agent-a", r#"{"type":"health:report","metrics":{"cpu":60,"memory":20}}"#)
            .await;
        fx.monitor.handle_raw("agent-a", "not json").await;
        fx.monitor.handle_raw("agent-a", r#"{"type":"agent:status"}"#).await;

        let status = fx.monitor.agent_status("agent-a").expect("status recorded");
        assert_eq!(status.color, StatusColor::Yellow);
        assert_eq!(status.message, "overloaded");
        assert_eq!(fx.monitor.metrics_history().len(), 1);
        assert_eq!(fx.monitor.aggregate_color(), StatusColor::Yellow);
    }

    #[tokio::test]
    async fn report_with_string_fields_is_recorded() {
        let fx = fixture(HealthConfig::default());

        fx.monitor
            .handle_raw(
                "agent-a",
                r#"{"type":"health:report","metrics":{"cpu":60,"memory":20,"agent":"agent-a"}}"#,
            )
            .await;

        let history = fx.monitor.metrics_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].metrics.cpu, 60.0);
        assert_eq!(history[0].color, StatusColor::Purple);
    }

    #[tokio::test]
    async fn probe_failure_skips_collection() {
        let fx = fixture(HealthConfig::default());
        assert!(fx.monitor.collect_once().await.is_some());

        fx.probe.fail_with("sampler offline");
        assert!(fx.monitor.collect_once().await.is_none());
        assert_eq!(fx.monitor.metrics_history().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_closes_channels_and_clears_registries() {
        let fx = fixture(HealthConfig::default());
        let channel = RecordingChannel::new("agent-a");
        fx.monitor.connect(Arc::new(channel.clone()));
        fx.monitor.update_agent_status("agent-a", StatusColor::Orange, "busy").await;
        fx.monitor.process_health_report(HealthMetrics::new(80.0, 10.0));

        fx.monitor.cleanup().await;

        assert!(channel.is_closed().await);
        let summary = fx.monitor.summary();
        assert_eq!(summary.connections, 0);
        assert!(summary.agents.is_empty());
        assert!(summary.latest.is_none());
        assert_eq!(summary.color, StatusColor::Blue);
        assert!(!fx.monitor.disconnect("agent-a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_tasks_send_heartbeats_and_collect_metrics() {
        let fx = fixture(HealthConfig {
            heartbeat_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            ..HealthConfig::default()
        });
        let channel = RecordingChannel::new("agent-a");
        fx.monitor.connect(Arc::new(channel.clone()));
        fx.monitor.start();

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(channel.heartbeats_sent().await, 2);
        assert_eq!(fx.monitor.metrics_history().len(), 6);

        fx.monitor.cleanup().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(fx.monitor.metrics_history().is_empty());
        assert!(matches!(channel.sent().await.last(), Some(WireMessage::Heartbeat { .. })));
    }
}
