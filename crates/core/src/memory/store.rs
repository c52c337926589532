use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::context::{VectorMatch, VectorRecord};
use crate::sync::lock;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
    #[error("durable store query failed: {0}")]
    Query(String),
    #[error("durable record is malformed: {0}")]
    Malformed(String),
}

/// Vector store holding the durable copy of every saved context.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn upsert(&self, record: VectorRecord) -> Result<(), StoreError>;

    /// Records stored under `id`, best match first, at most `top_k`.
    async fn query(&self, id: &str, top_k: usize) -> Result<Vec<VectorMatch>, StoreError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, content: &Value) -> Result<Vec<f32>, StoreError>;
}

/// Store backed by a map, with hooks to simulate outages and tampering.
#[derive(Clone, Default)]
pub struct InMemoryDurableStore {
    records: Arc<Mutex<BTreeMap<String, VectorRecord>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Rewrites the durable content of `id` behind the cache's back.
    pub fn tamper(&self, id: &str, content: Value) -> bool {
        match lock(&self.records).get_mut(id) {
            Some(record) => {
                record.metadata.content = content;
                true
            }
            None => false,
        }
    }

    pub fn record(&self, id: &str) -> Option<VectorRecord> {
        lock(&self.records).get(id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store configured to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn upsert(&self, record: VectorRecord) -> Result<(), StoreError> {
        self.check_available()?;
        lock(&self.records).insert(record.id.clone(), record);
        Ok(())
    }

    async fn query(&self, id: &str, top_k: usize) -> Result<Vec<VectorMatch>, StoreError> {
        self.check_available()?;
        let matches = lock(&self.records)
            .get(id)
            .map(|record| VectorMatch {
                id: record.id.clone(),
                score: 1.0,
                metadata: record.metadata.clone(),
            })
            .into_iter()
            .take(top_k)
            .collect();
        Ok(matches)
    }
}

/// Deterministic unit-length embedding derived from SHA-256 of the content.
/// Stable across runs; carries no semantic similarity.
#[derive(Clone, Copy, Debug)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(1) }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn vector_for(&self, payload: &[u8]) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.dimensions);
        let mut block: u32 = 0;
        while values.len() < self.dimensions {
            let mut hasher = Sha256::new();
            hasher.update(payload);
            hasher.update(block.to_le_bytes());
            for byte in hasher.finalize() {
                if values.len() == self.dimensions {
                    break;
                }
                values.push(f32::from(byte) / 127.5 - 1.0);
            }
            block = block.wrapping_add(1);
        }

        let norm = values.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut values {
                *value /= norm;
            }
        }
        values
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, content: &Value) -> Result<Vec<f32>, StoreError> {
        let payload =
            serde_json::to_vec(content).map_err(|error| StoreError::Malformed(error.to_string()))?;
        Ok(self.vector_for(&payload))
    }
}
