use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Health color, ordered from healthy to most loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusColor {
    Blue,
    Purple,
    Orange,
    Yellow,
}

impl StatusColor {
    /// Aggregate color for a cpu/memory pair, using the highest of the two loads.
    pub fn from_load(cpu: f64, memory: f64) -> Self {
        let load = cpu.max(memory);
        if load > 90.0 {
            Self::Yellow
        } else if load > 70.0 {
            Self::Orange
        } else if load > 50.0 {
            Self::Purple
        } else {
            Self::Blue
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blue => "BLUE",
            Self::Purple => "PURPLE",
            Self::Orange => "ORANGE",
            Self::Yellow => "YELLOW",
        }
    }
}

impl std::str::FromStr for StatusColor {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "BLUE" => Ok(Self::Blue),
            "PURPLE" => Ok(Self::Purple),
            "ORANGE" => Ok(Self::Orange),
            "YELLOW" => Ok(Self::Yellow),
            other => Err(format!("unknown status color `{other}`")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub agent_id: String,
    pub color: StatusColor,
    pub message: String,
}

/// Raw report from an agent or the local probe. Fields other than `cpu` and
/// `memory` are carried through untouched, whatever their JSON type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub cpu: f64,
    pub memory: f64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl HealthMetrics {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self { cpu, memory, extra: BTreeMap::new() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthMetricSample {
    pub timestamp: DateTime<Utc>,
    pub metrics: HealthMetrics,
    pub color: StatusColor,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{HealthMetrics, StatusColor};

    #[test]
    fn color_thresholds_follow_highest_load() {
        assert_eq!(StatusColor::from_load(10.0, 20.0), StatusColor::Blue);
        assert_eq!(StatusColor::from_load(50.0, 50.0), StatusColor::Blue);
        assert_eq!(StatusColor::from_load(51.0, 0.0), StatusColor::Purple);
        assert_eq!(StatusColor::from_load(0.0, 71.0), StatusColor::Orange);
        assert_eq!(StatusColor::from_load(95.0, 10.0), StatusColor::Yellow);
    }

    #[test]
    fn color_parses_case_insensitively() {
        assert_eq!("purple".parse::<StatusColor>(), Ok(StatusColor::Purple));
        assert!("green".parse::<StatusColor>().is_err());
    }

    #[test]
    fn color_serializes_uppercase() {
        let json = serde_json::to_string(&StatusColor::Orange).expect("serialize color");
        assert_eq!(json, "\"ORANGE\"");
    }

    #[test]
    fn report_with_non_numeric_fields_still_parses() {
        let metrics: HealthMetrics = serde_json::from_value(json!({
            "cpu": 60,
            "memory": 20.5,
            "agent": "agent-a",
            "tags": ["gpu"]
        }))
        .expect("report with mixed extras");

        assert_eq!(metrics.cpu, 60.0);
        assert_eq!(metrics.memory, 20.5);
        assert_eq!(metrics.extra.get("agent"), Some(&json!("agent-a")));
        assert_eq!(metrics.extra.get("tags"), Some(&json!(["gpu"])));
    }
}
