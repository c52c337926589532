//! Tiered context cache with checksum-backed integrity verification.
//!
//! Reads fall through current session -> recent sessions -> durable store; the
//! first hit wins and only durable hits are promoted into the recent tier.
//! Every save records a checksum. Verification always reads the durable copy,
//! never the caches, and mismatches are reported without repair.

mod store;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use store::{DurableStore, Embedder, HashEmbedder, InMemoryDurableStore, StoreError};

use crate::checksum::ChecksumStore;
use crate::domain::context::{ChecksumRecord, RecordMetadata, VectorRecord, CONTEXT_RECORD_TYPE};
use crate::events::{ContextUpdated, EventBus, IntegrityViolation};
use crate::ids::Clock;
use crate::schedule::ScheduledTask;
use crate::sync::lock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryConfig {
    pub integrity_interval: Duration,
    pub embedding_dimensions: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { integrity_interval: Duration::from_secs(300), embedding_dimensions: 384 }
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("context `{0}` not found in any tier")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("embedding failed for context `{context_id}`: {source}")]
    Embedding { context_id: String, source: StoreError },
    #[error("context could not be encoded: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Default)]
struct Tiers {
    current: HashMap<String, Value>,
    recent: HashMap<String, Value>,
    tracked: BTreeMap<String, ChecksumRecord>,
}

pub struct ContextMemory {
    config: MemoryConfig,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    store: Arc<dyn DurableStore>,
    embedder: Arc<dyn Embedder>,
    checksums: ChecksumStore,
    tiers: Mutex<Tiers>,
    sweep: Mutex<Option<ScheduledTask>>,
}

impl ContextMemory {
    pub fn new(
        config: MemoryConfig,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        store: Arc<dyn DurableStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            config,
            bus,
            clock,
            store,
            embedder,
            checksums: ChecksumStore::new(),
            tiers: Mutex::new(Tiers::default()),
            sweep: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub async fn load_context(&self, context_id: &str) -> Result<Value, MemoryError> {
        {
            let tiers = lock(&self.tiers);
            if let Some(content) = tiers.current.get(context_id) {
                return Ok(content.clone());
            }
            if let Some(content) = tiers.recent.get(context_id) {
                return Ok(content.clone());
            }
        }

        let matches = self.store.query(context_id, 1).await?;
        let Some(hit) = matches.into_iter().find(|candidate| candidate.id == context_id) else {
            return Err(MemoryError::NotFound(context_id.to_string()));
        };

        let content = hit.metadata.content;
        lock(&self.tiers).recent.insert(context_id.to_string(), content.clone());
        debug!(
            event_name = "memory.context.promoted",
            context_id,
            "durable context promoted into recent cache"
        );
        Ok(content)
    }

    pub async fn save_context(
        &self,
        context_id: &str,
        context: Value,
    ) -> Result<ChecksumRecord, MemoryError> {
        lock(&self.tiers).current.insert(context_id.to_string(), context.clone());

        let record = self.persist(context_id, context).await?;
        lock(&self.tiers).tracked.insert(context_id.to_string(), record.clone());

        debug!(
            event_name = "memory.context.saved",
            context_id,
            checksum = %record.digest,
            "context saved"
        );
        self.bus.context_updated.emit(ContextUpdated {
            context_id: context_id.to_string(),
            checksum: record.digest.clone(),
        });
        Ok(record)
    }

    /// Serializes `content` and saves it.
    pub async fn save_serialized<T>(
        &self,
        context_id: &str,
        content: &T,
    ) -> Result<ChecksumRecord, MemoryError>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(content)?;
        self.save_context(context_id, value).await
    }

    /// Recomputes the digest of the durable copy. `false` when the context is
    /// untracked, missing from the store, the store fails, or the digest changed.
    pub async fn verify_checksum(&self, context_id: &str) -> bool {
        let Some(record) = self.tracked_checksum(context_id) else {
            return false;
        };

        match self.durable_matches(context_id, &record).await {
            Ok(matches) => matches,
            Err(load_error) => {
                debug!(
                    event_name = "memory.integrity.load_failed",
                    context_id,
                    error = %load_error,
                    "durable copy could not be read for verification"
                );
                false
            }
        }
    }

    /// Verifies every tracked checksum and returns the ids that failed.
    pub async fn sweep_integrity(&self) -> Vec<String> {
        let tracked: Vec<String> = lock(&self.tiers).tracked.keys().cloned().collect();
        let mut failed = Vec::new();

        for context_id in tracked {
            if self.verify_checksum(&context_id).await {
                continue;
            }
            self.report_violation(&context_id);
            failed.push(context_id);
        }

        failed
    }

    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task =
            ScheduledTask::start("memory.integrity_sweep", self.config.integrity_interval, move || {
                let weak = weak.clone();
                async move {
                    if let Some(memory) = weak.upgrade() {
                        memory.sweep_integrity().await;
                    }
                }
            });

        if let Some(previous) = lock(&self.sweep).replace(task) {
            previous.cancel();
        }
    }

    /// Stops the sweep, flushes the current session to the durable store and
    /// empties both cache tiers. Tracked checksums are kept. A durable copy
    /// that no longer matches its tracked checksum is reported and left in
    /// place rather than overwritten.
    pub async fn cleanup(&self) {
        if let Some(task) = lock(&self.sweep).take() {
            task.cancel();
        }

        let pending: Vec<(String, Value)> = {
            let mut tiers = lock(&self.tiers);
            tiers.recent.clear();
            let drained = tiers.current.drain().collect();
            drained
        };

        let mut flushed = 0usize;
        for (context_id, content) in pending {
            if let Some(record) = self.tracked_checksum(&context_id) {
                if let Ok(false) = self.durable_matches(&context_id, &record).await {
                    self.report_violation(&context_id);
                    continue;
                }
            }
            match self.persist(&context_id, content).await {
                Ok(record) => {
                    lock(&self.tiers).tracked.insert(context_id, record);
                    flushed += 1;
                }
                Err(flush_error) => warn!(
                    event_name = "memory.flush.failed",
                    context_id = %context_id,
                    error = %flush_error,
                    "could not flush context during cleanup"
                ),
            }
        }

        info!(event_name = "memory.cleanup.completed", flushed, "context memory cleaned up");
    }

    pub fn tracked_checksum(&self, context_id: &str) -> Option<ChecksumRecord> {
        lock(&self.tiers).tracked.get(context_id).cloned()
    }

    /// Entry counts of the (current, recent) cache tiers.
    pub fn cache_sizes(&self) -> (usize, usize) {
        let tiers = lock(&self.tiers);
        (tiers.current.len(), tiers.recent.len())
    }

    async fn durable_matches(
        &self,
        context_id: &str,
        record: &ChecksumRecord,
    ) -> Result<bool, MemoryError> {
        let matches = self.store.query(context_id, 1).await?;
        let hit = matches
            .into_iter()
            .find(|candidate| candidate.id == context_id)
            .ok_or_else(|| MemoryError::NotFound(context_id.to_string()))?;
        Ok(self.checksums.matches(record, &hit.metadata.content))
    }

    fn report_violation(&self, context_id: &str) {
        let detected_at = self.clock.now();
        warn!(
            event_name = "memory.integrity.violation",
            context_id,
            "context failed checksum verification"
        );
        self.bus
            .integrity_violation
            .emit(IntegrityViolation { context_id: context_id.to_string(), detected_at });
    }

    async fn persist(
        &self,
        context_id: &str,
        content: Value,
    ) -> Result<ChecksumRecord, MemoryError> {
        let now: DateTime<Utc> = self.clock.now();
        let record = self.checksums.record(context_id, &content, now);

        let values = self.embedder.embed(&content).await.map_err(|source| {
            MemoryError::Embedding { context_id: context_id.to_string(), source }
        })?;

        self.store
            .upsert(VectorRecord {
                id: context_id.to_string(),
                values,
                metadata: RecordMetadata {
                    timestamp: now,
                    kind: CONTEXT_RECORD_TYPE.to_string(),
                    checksum: record.digest.clone(),
                    content,
                },
            })
            .await?;

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::checksum::ChecksumStore;
    use crate::domain::context::CONTEXT_RECORD_TYPE;
    use crate::events::EventBus;
    use crate::ids::ManualClock;
    use crate::memory::{
        ContextMemory, Embedder, HashEmbedder, InMemoryDurableStore, MemoryConfig, MemoryError,
        StoreError,
    };

    struct Fixture {
        memory: Arc<ContextMemory>,
        bus: EventBus,
        store: InMemoryDurableStore,
    }

    fn fixture_with_embedder(config: MemoryConfig, embedder: Arc<dyn Embedder>) -> Fixture {
        let bus = EventBus::new();
        let store = InMemoryDurableStore::new();
        let memory = Arc::new(ContextMemory::new(
            config,
            bus.clone(),
            Arc::new(ManualClock::default()),
            Arc::new(store.clone()),
            embedder,
        ));
        Fixture { memory, bus, store }
    }

    fn fixture() -> Fixture {
        fixture_with_embedder(MemoryConfig::default(), Arc::new(HashEmbedder::new(8)))
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _content: &Value) -> Result<Vec<f32>, StoreError> {
            Err(StoreError::Unavailable("embedding service down".to_string()))
        }
    }

    #[tokio::test]
    async fn saved_context_is_served_from_current_tier() {
        let fx = fixture();
        let context = json!({"topic": "renewal", "turn": 3});

        fx.memory.save_context("ctx-1", context.clone()).await.expect("save");

        assert_eq!(fx.memory.load_context("ctx-1").await.expect("load"), context);
        assert_eq!(fx.memory.cache_sizes(), (1, 0));
    }

    #[tokio::test]
    async fn durable_hit_is_promoted_into_recent_tier() {
        let fx = fixture();
        let context = json!({"topic": "renewal"});
        fx.memory.save_context("ctx-1", context.clone()).await.expect("save");
        fx.memory.cleanup().await;
        assert_eq!(fx.memory.cache_sizes(), (0, 0));

        assert_eq!(fx.memory.load_context("ctx-1").await.expect("durable load"), context);
        assert_eq!(fx.memory.cache_sizes(), (0, 1));

        fx.store.set_failing(true);
        assert_eq!(fx.memory.load_context("ctx-1").await.expect("recent hit"), context);
    }

    #[tokio::test]
    async fn unknown_context_is_not_found() {
        let fx = fixture();
        assert!(matches!(
            fx.memory.load_context("missing").await,
            Err(MemoryError::NotFound(id)) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn save_writes_durable_record_with_checksum_metadata() {
        let fx = fixture();
        let mut updates = fx.bus.context_updated.subscribe();
        let context = json!({"turn": 1});

        let record = fx.memory.save_context("ctx-1", context.clone()).await.expect("save");

        let durable = fx.store.record("ctx-1").expect("durable copy");
        assert_eq!(durable.values.len(), 8);
        assert_eq!(durable.metadata.kind, CONTEXT_RECORD_TYPE);
        assert_eq!(durable.metadata.checksum, record.digest);
        assert_eq!(durable.metadata.content, context);
        assert_eq!(record.digest, ChecksumStore::new().digest_value(&context));

        let event = updates.recv().await.expect("context updated event");
        assert_eq!(event.context_id, "ctx-1");
        assert_eq!(event.checksum, record.digest);
    }

    #[tokio::test]
    async fn store_failure_propagates_from_save() {
        let fx = fixture();
        fx.store.set_failing(true);

        let result = fx.memory.save_context("ctx-1", json!({"turn": 1})).await;

        assert!(matches!(result, Err(MemoryError::Store(StoreError::Unavailable(_)))));
        assert!(fx.memory.tracked_checksum("ctx-1").is_none());
        assert_eq!(fx.bus.context_updated.emit_count(), 0);
    }

    #[tokio::test]
    async fn embedding_failure_propagates_from_save() {
        let fx = fixture_with_embedder(MemoryConfig::default(), Arc::new(BrokenEmbedder));

        let result = fx.memory.save_context("ctx-1", json!({"turn": 1})).await;

        assert!(matches!(
            result,
            Err(MemoryError::Embedding { ref context_id, .. }) if context_id == "ctx-1"
        ));
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn verify_detects_tampered_durable_copy() {
        let fx = fixture();
        fx.memory.save_context("ctx-1", json!({"turn": 1})).await.expect("save");
        assert!(fx.memory.verify_checksum("ctx-1").await);

        fx.memory.cleanup().await;
        assert!(fx.store.tamper("ctx-1", json!({"turn": 99})));

        assert!(!fx.memory.verify_checksum("ctx-1").await);
    }

    #[tokio::test]
    async fn verify_reads_durable_copy_while_context_is_cached() {
        let fx = fixture();
        fx.memory.save_context("ctx-1", json!({"turn": 1})).await.expect("save");
        assert!(fx.store.tamper("ctx-1", json!({"turn": 99})));

        assert!(!fx.memory.verify_checksum("ctx-1").await);
        assert_eq!(fx.memory.load_context("ctx-1").await.expect("cached"), json!({"turn": 1}));
    }

    #[tokio::test]
    async fn verify_fails_after_durable_hit_was_promoted() {
        let fx = fixture();
        fx.memory.save_context("ctx-1", json!({"turn": 1})).await.expect("save");
        fx.memory.cleanup().await;
        fx.memory.load_context("ctx-1").await.expect("promote");
        assert_eq!(fx.memory.cache_sizes(), (0, 1));

        fx.store.tamper("ctx-1", json!({"turn": 2}));

        assert!(!fx.memory.verify_checksum("ctx-1").await);
    }

    #[tokio::test]
    async fn cleanup_leaves_tampered_durable_copy_in_place() {
        let fx = fixture();
        fx.memory.save_context("ctx-1", json!({"turn": 1})).await.expect("save");
        let tracked = fx.memory.tracked_checksum("ctx-1").expect("tracked");
        fx.store.tamper("ctx-1", json!({"turn": 99}));

        fx.memory.cleanup().await;

        let durable = fx.store.record("ctx-1").expect("durable copy");
        assert_eq!(durable.metadata.content, json!({"turn": 99}));
        assert_eq!(fx.memory.tracked_checksum("ctx-1"), Some(tracked));
        assert_eq!(fx.bus.integrity_violation.emit_count(), 1);
        assert!(!fx.memory.verify_checksum("ctx-1").await);
    }

    #[tokio::test]
    async fn verify_is_false_for_untracked_or_unloadable_contexts() {
        let fx = fixture();
        assert!(!fx.memory.verify_checksum("never-saved").await);

        fx.memory.save_context("ctx-1", json!({"turn": 1})).await.expect("save");
        fx.memory.cleanup().await;
        fx.store.set_failing(true);
        assert!(!fx.memory.verify_checksum("ctx-1").await);
    }

    #[tokio::test]
    async fn sweep_reports_and_publishes_violations() {
        let fx = fixture();
        let mut violations = fx.bus.integrity_violation.subscribe();
        fx.memory.save_context("ctx-ok", json!({"turn": 1})).await.expect("save");
        fx.memory.save_context("ctx-bad", json!({"turn": 2})).await.expect("save");
        fx.memory.cleanup().await;
        fx.store.tamper("ctx-bad", json!({"turn": 3}));

        let failed = fx.memory.sweep_integrity().await;

        assert_eq!(failed, vec!["ctx-bad".to_string()]);
        let event = violations.recv().await.expect("violation event");
        assert_eq!(event.context_id, "ctx-bad");
    }

    #[tokio::test]
    async fn cleanup_flush_is_best_effort() {
        let fx = fixture();
        fx.memory.save_context("ctx-1", json!({"turn": 1})).await.expect("save");
        fx.store.set_failing(true);

        fx.memory.cleanup().await;

        assert_eq!(fx.memory.cache_sizes(), (0, 0));
        assert!(fx.memory.tracked_checksum("ctx-1").is_some());
    }

    #[tokio::test]
    async fn typed_content_is_saved_as_json() {
        #[derive(serde::Serialize)]
        struct Note {
            body: &'static str,
        }

        let fx = fixture();
        fx.memory.save_serialized("note-1", &Note { body: "hello" }).await.expect("save");

        assert_eq!(fx.memory.load_context("note-1").await.expect("load"), json!({"body": "hello"}));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_runs_until_cleanup() {
        let fx = fixture_with_embedder(
            MemoryConfig { integrity_interval: Duration::from_secs(60), ..MemoryConfig::default() },
            Arc::new(HashEmbedder::new(8)),
        );
        fx.memory.save_context("ctx-1", json!({"turn": 1})).await.expect("save");
        fx.memory.cleanup().await;
        fx.store.tamper("ctx-1", json!({"turn": 2}));
        fx.memory.start();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fx.bus.integrity_violation.emit_count(), 1);

        fx.memory.cleanup().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fx.bus.integrity_violation.emit_count(), 1);
    }
}
