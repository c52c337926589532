//! SQLite-backed durable context store.
//!
//! Embeddings and content are stored as JSON text. Lookup is by exact context
//! id, so every match carries a score of 1.0.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_core::domain::context::{RecordMetadata, VectorMatch, VectorRecord};
use concord_core::memory::{DurableStore, StoreError};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;

use crate::DbPool;

pub struct SqlVectorStore {
    pool: DbPool,
}

impl SqlVectorStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM context_vectors")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        row.try_get("count").map_err(store_error)
    }

    pub async fn fetch(&self, id: &str) -> Result<Option<VectorRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, embedding_json, record_type, checksum, content_json, recorded_at
            FROM context_vectors
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(|r| vector_record_from_row(&r)).transpose()
    }
}

#[async_trait]
impl DurableStore for SqlVectorStore {
    async fn upsert(&self, record: VectorRecord) -> Result<(), StoreError> {
        let embedding_json = serde_json::to_string(&record.values)
            .map_err(|e| StoreError::Malformed(format!("embedding: {e}")))?;
        let content_json = serde_json::to_string(&record.metadata.content)
            .map_err(|e| StoreError::Malformed(format!("content: {e}")))?;
        let dimensions = i64::try_from(record.values.len()).unwrap_or(i64::MAX);

        sqlx::query(
            r#"
            INSERT INTO context_vectors (
                id, embedding_json, dimensions, record_type, checksum,
                content_json, recorded_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                embedding_json = excluded.embedding_json,
                dimensions = excluded.dimensions,
                record_type = excluded.record_type,
                checksum = excluded.checksum,
                content_json = excluded.content_json,
                recorded_at = excluded.recorded_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(embedding_json)
        .bind(dimensions)
        .bind(&record.metadata.kind)
        .bind(&record.metadata.checksum)
        .bind(content_json)
        .bind(record.metadata.timestamp.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        debug!(event_name = "storage.vector.upserted", context_id = %record.id, dimensions, "context vector stored");
        Ok(())
    }

    async fn query(&self, id: &str, top_k: usize) -> Result<Vec<VectorMatch>, StoreError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(top_k).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            SELECT id, embedding_json, record_type, checksum, content_json, recorded_at
            FROM context_vectors
            WHERE id = ?
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter()
            .map(|row| {
                let record = vector_record_from_row(row)?;
                Ok(VectorMatch { id: record.id, score: 1.0, metadata: record.metadata })
            })
            .collect()
    }
}

fn vector_record_from_row(row: &SqliteRow) -> Result<VectorRecord, StoreError> {
    let id: String = row.try_get("id").map_err(store_error)?;
    let embedding_json: String = row.try_get("embedding_json").map_err(store_error)?;
    let content_json: String = row.try_get("content_json").map_err(store_error)?;
    let recorded_at: String = row.try_get("recorded_at").map_err(store_error)?;

    Ok(VectorRecord {
        values: serde_json::from_str(&embedding_json)
            .map_err(|e| StoreError::Malformed(format!("embedding for `{id}`: {e}")))?,
        metadata: RecordMetadata {
            timestamp: parse_timestamp("recorded_at", &recorded_at)?,
            kind: row.try_get("record_type").map_err(store_error)?,
            checksum: row.try_get("checksum").map_err(store_error)?,
            content: serde_json::from_str(&content_json)
                .map_err(|e| StoreError::Malformed(format!("content for `{id}`: {e}")))?,
        },
        id,
    })
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Malformed(format!("invalid timestamp in `{column}`: {e}")))
}

fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(error.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Malformed(error.to_string())
        }
        other => StoreError::Query(other.to_string()),
    }
}
