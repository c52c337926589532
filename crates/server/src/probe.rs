//! Host load probe reading Linux procfs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use concord_core::domain::health::HealthMetrics;
use concord_core::probe::{ProbeError, ResourceProbe};

/// Cpu is the one-minute load average relative to available cores; memory is
/// the share of `MemTotal` that is not `MemAvailable`. Both are 0-100.
#[derive(Clone, Debug)]
pub struct ProcfsProbe {
    root: PathBuf,
    cores: f64,
}

impl Default for ProcfsProbe {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::with_root("/proc", cores)
    }
}

impl ProcfsProbe {
    pub fn with_root(root: impl Into<PathBuf>, cores: usize) -> Self {
        Self { root: root.into(), cores: cores.max(1) as f64 }
    }

    pub fn is_supported() -> bool {
        Path::new("/proc/loadavg").exists() && Path::new("/proc/meminfo").exists()
    }

    async fn read(&self, name: &str) -> Result<String, ProbeError> {
        let path = self.root.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|error| ProbeError::Unavailable(format!("{}: {error}", path.display())))
    }
}

#[async_trait]
impl ResourceProbe for ProcfsProbe {
    async fn sample(&self) -> Result<HealthMetrics, ProbeError> {
        let loadavg = self.read("loadavg").await?;
        let meminfo = self.read("meminfo").await?;

        let load = parse_load(&loadavg)?;
        let cpu = load / self.cores * 100.0;
        let memory = parse_memory_used(&meminfo)?;

        let mut metrics = HealthMetrics::new(cpu.clamp(0.0, 100.0), memory.clamp(0.0, 100.0));
        metrics.extra.insert("load_1m".to_string(), serde_json::Value::from(load));
        Ok(metrics)
    }
}

fn parse_load(loadavg: &str) -> Result<f64, ProbeError> {
    loadavg
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .ok_or_else(|| ProbeError::Unavailable(format!("unexpected loadavg format: `{loadavg}`")))
}

fn parse_memory_used(meminfo: &str) -> Result<f64, ProbeError> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|value| value.parse::<f64>().ok())
    };

    match (field("MemTotal"), field("MemAvailable")) {
        (Some(total), Some(available)) if total > 0.0 => Ok((1.0 - available / total) * 100.0),
        _ => Err(ProbeError::Unavailable("meminfo lacks MemTotal/MemAvailable".to_string())),
    }
}
