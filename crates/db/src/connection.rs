use std::path::{Path, PathBuf};
use std::time::Duration;

use concord_core::config::StorageConfig;
use sqlx::migrate::MigrateError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;
use tracing::info;

use crate::migrations;

pub type DbPool = sqlx::SqlitePool;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database connection failed: {0}")]
    Connect(#[from] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migrate(#[from] MigrateError),
    #[error("could not prepare storage directory `{path}`: {source}")]
    Prepare { path: PathBuf, source: std::io::Error },
}

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 5, 30).await
}

pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let options = database_url.parse::<SqliteConnectOptions>()?.create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
}

/// Creates the lock and log directories, connects, and applies pending migrations.
pub async fn open_storage(config: &StorageConfig) -> Result<DbPool, DbError> {
    for path in [&config.lock_path, &config.incident_log_path] {
        ensure_parent_dir(path).await?;
    }

    let pool =
        connect_with_settings(&config.database_url, config.max_connections, config.timeout_secs)
            .await?;
    migrations::run_pending(&pool).await?;

    info!(
        event_name = "storage.opened",
        database_url = %config.database_url,
        lock_path = %config.lock_path.display(),
        incident_log_path = %config.incident_log_path.display(),
        "durable storage ready"
    );
    Ok(pool)
}

pub(crate) async fn ensure_parent_dir(path: &Path) -> Result<(), DbError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| DbError::Prepare { path: parent.to_path_buf(), source }),
        _ => Ok(()),
    }
}
