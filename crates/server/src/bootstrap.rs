use std::sync::Arc;

use concord_core::audit::IncidentLog;
use concord_core::config::{AppConfig, ConfigError, LoadOptions};
use concord_core::ids::{SystemClock, UuidIdGenerator};
use concord_core::memory::HashEmbedder;
use concord_core::probe::{AccumulatingUsageMeter, ResourceProbe, StaticProbe};
use concord_core::{Collaborators, GovernanceOrchestrator};
use concord_db::{open_storage, DbError, DbPool, FileIncidentLog, FileLockStore, SqlVectorStore};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::probe::ProcfsProbe;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub core: Arc<GovernanceOrchestrator>,
    pub usage: AccumulatingUsageMeter,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] DbError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting governance bootstrap"
    );

    let db_pool = open_storage(&config.storage).await?;
    info!(
        event_name = "system.bootstrap.storage_ready",
        correlation_id = "bootstrap",
        "durable storage connected and migrated"
    );

    let usage = AccumulatingUsageMeter::new();
    let log: Arc<dyn IncidentLog> =
        Arc::new(FileIncidentLog::new(config.storage.incident_log_path.clone()));
    let collaborators = Collaborators {
        incident_log: Arc::clone(&log),
        decision_log: log,
        lock_store: Arc::new(FileLockStore::new(config.storage.lock_path.clone())),
        store: Arc::new(SqlVectorStore::new(db_pool.clone())),
        embedder: Arc::new(HashEmbedder::new(config.memory.embedding_dimensions)),
        probe: select_probe(),
        usage: Arc::new(usage.clone()),
        ids: Arc::new(UuidIdGenerator),
        clock: Arc::new(SystemClock),
    };

    let core = Arc::new(GovernanceOrchestrator::from_app_config(&config, collaborators));
    match core.safety().is_locked().await {
        Ok(true) => warn!(
            event_name = "system.bootstrap.act_mode_locked",
            correlation_id = "bootstrap",
            lock_path = %config.storage.lock_path.display(),
            "act-mode lock present; an audit is pending"
        ),
        Ok(false) => {}
        Err(error) => warn!(
            event_name = "system.bootstrap.lock_unreadable",
            correlation_id = "bootstrap",
            error = %error,
            "could not read act-mode lock"
        ),
    }

    Ok(Application { config, db_pool, core, usage })
}

/// Feeds the token count of every accepted dialogue message into the usage
/// meter read by the kill switch.
pub fn feed_dialogue_tokens(app: &Application) -> JoinHandle<()> {
    let mut processed = app.core.bus().message_processed.subscribe();
    let usage = app.usage.clone();
    tokio::spawn(async move {
        loop {
            match processed.recv().await {
                Ok(event) => usage.record(event.tokens_added as f64, 0.0),
                Err(RecvError::Lagged(skipped)) => warn!(
                    event_name = "system.usage.lagged",
                    skipped,
                    "usage feed fell behind; token usage under-reported"
                ),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn select_probe() -> Arc<dyn ResourceProbe> {
    if ProcfsProbe::is_supported() {
        Arc::new(ProcfsProbe::default())
    } else {
        warn!(
            event_name = "system.bootstrap.probe_unavailable",
            correlation_id = "bootstrap",
            "procfs not available; resource probe reports zero load"
        );
        Arc::new(StaticProbe::default())
    }
}

#[cfg(test)]
mod tests {
    use concord_core::config::{ConfigOverrides, LoadOptions};
    use concord_core::domain::session::SessionPhase;
    use concord_core::probe::UsageMeter;
    use concord_core::DialogueMessage;

    use crate::bootstrap::{bootstrap, feed_dialogue_tokens};

    fn overrides(dir: &std::path::Path) -> LoadOptions {
        LoadOptions {
            config_path: Some(dir.join("missing.toml")),
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                lock_path: Some(dir.join("state").join("act_mode.lock")),
                incident_log_path: Some(dir.join("state").join("incidents.log")),
                max_turns: Some(2),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_invalid_limits() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut options = overrides(dir.path());
        options.overrides.max_turns = Some(0);

        let message = bootstrap(options).await.err().expect("invalid config").to_string();
        assert!(message.contains("max_turns"));
    }

    #[tokio::test]
    async fn bootstrapped_core_runs_a_bounded_dialogue() {
        let dir = tempfile::tempdir().expect("temp dir");
        let app = bootstrap(overrides(dir.path())).await.expect("bootstrap succeeds");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'context_vectors'",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema available");
        assert_eq!(table_count, 1);
        assert!(dir.path().join("state").is_dir());

        let feed = feed_dialogue_tokens(&app);
        app.core.start_session(["agent-a", "agent-b"]);
        app.core.submit(DialogueMessage::new("agent-a", "opening")).expect("first turn");
        app.core.submit(DialogueMessage::new("agent-b", "reply")).expect("second turn");
        assert!(app.core.submit(DialogueMessage::new("agent-a", "one more")).is_err());
        assert!(matches!(app.core.dialogue().phase(), SessionPhase::Halted(_)));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let (tokens, cost) = app.usage.take();
        assert_eq!(tokens, 4.0, "\"opening\" is 2 tokens and \"reply\" is 2");
        assert_eq!(cost, 0.0);
        feed.abort();

        app.core.shutdown().await;
        app.db_pool.close().await;
    }
}
