//! Pluggable resource readings: OS-level cpu/memory sampling and the
//! token/cost meter fed by whatever drives the agents.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::health::HealthMetrics;
use crate::sync::lock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("resource probe unavailable: {0}")]
    Unavailable(String),
}

/// Reads current cpu and memory load as 0-100 percentages.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> Result<HealthMetrics, ProbeError>;
}

/// Token and cost consumption since the previous `take`.
pub trait UsageMeter: Send + Sync {
    fn take(&self) -> (f64, f64);
}

/// Probe returning a fixed, replaceable reading.
#[derive(Clone)]
pub struct StaticProbe {
    reading: Arc<Mutex<Result<HealthMetrics, ProbeError>>>,
}

impl StaticProbe {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self { reading: Arc::new(Mutex::new(Ok(HealthMetrics::new(cpu, memory)))) }
    }

    pub fn set(&self, cpu: f64, memory: f64) {
        *lock(&self.reading) = Ok(HealthMetrics::new(cpu, memory));
    }

    pub fn fail_with(&self, message: impl Into<String>) {
        *lock(&self.reading) = Err(ProbeError::Unavailable(message.into()));
    }
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

#[async_trait]
impl ResourceProbe for StaticProbe {
    async fn sample(&self) -> Result<HealthMetrics, ProbeError> {
        lock(&self.reading).clone()
    }
}

/// Accumulates reported token/cost usage and drains it on `take`.
#[derive(Clone, Default)]
pub struct AccumulatingUsageMeter {
    pending: Arc<Mutex<(f64, f64)>>,
}

impl AccumulatingUsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tokens: f64, cost: f64) {
        let mut pending = lock(&self.pending);
        pending.0 += tokens;
        pending.1 += cost;
    }
}

impl UsageMeter for AccumulatingUsageMeter {
    fn take(&self) -> (f64, f64) {
        std::mem::take(&mut *lock(&self.pending))
    }
}
