use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EMERGENCY_SHUTDOWN: &str = "EMERGENCY_SHUTDOWN";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceMetric {
    Cost,
    Tokens,
    Cpu,
    Memory,
}

impl ResourceMetric {
    pub const ALL: [ResourceMetric; 4] = [Self::Cost, Self::Tokens, Self::Cpu, Self::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cost => "cost",
            Self::Tokens => "tokens",
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub metric: ResourceMetric,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// One ingestion for the kill switch. `cpu` and `memory` are percentages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub tokens: f64,
    pub cost: f64,
}

impl ResourceUsage {
    pub fn value_of(&self, metric: ResourceMetric) -> f64 {
        match metric {
            ResourceMetric::Cost => self.cost,
            ResourceMetric::Tokens => self.tokens,
            ResourceMetric::Cpu => self.cpu,
            ResourceMetric::Memory => self.memory,
        }
    }

    pub fn is_finite(&self) -> bool {
        ResourceMetric::ALL.iter().all(|metric| self.value_of(*metric).is_finite())
    }
}

/// Copy of every sample bucket at the moment of a shutdown.
pub type MetricsSnapshot = BTreeMap<ResourceMetric, Vec<ResourceSample>>;

/// Append-only record of one emergency shutdown.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    #[serde(rename = "type")]
    pub kind: String,
    pub reasons: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub metrics_snapshot: MetricsSnapshot,
}

impl Incident {
    pub fn emergency_shutdown(
        reasons: Vec<String>,
        timestamp: DateTime<Utc>,
        metrics_snapshot: MetricsSnapshot,
    ) -> Self {
        Self { kind: EMERGENCY_SHUTDOWN.to_string(), reasons, timestamp, metrics_snapshot }
    }
}

/// Durable marker meaning "halted until a human audit clears this".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActModeLock {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}
