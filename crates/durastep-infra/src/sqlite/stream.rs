//! SQLite stream store.
//!
//! Implements `StreamStore` from `durastep-core`. Items live in
//! `stream_items` keyed by `(workflow_id, namespace, position)`; a row in
//! `stream_metadata` marks the stream closed or aborted.

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;

use durastep_core::repository::StreamStore;
use durastep_types::error::RepositoryError;
use durastep_types::stream::{StreamItem, StreamMetadata};

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, query_error};

/// SQLite-backed [`StreamStore`].
pub struct SqliteStreamStore {
    pool: DatabasePool,
}

impl SqliteStreamStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Private row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct ItemRow {
    position: i64,
    payload: String,
    written_at: String,
}

impl ItemRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            position: row.try_get("position")?,
            payload: row.try_get("payload")?,
            written_at: row.try_get("written_at")?,
        })
    }

    fn into_item(self) -> Result<StreamItem, RepositoryError> {
        let position = u64::try_from(self.position)
            .map_err(|_| {
                RepositoryError::Query(format!("invalid stream position: {}", self.position))
            })?;
        let payload: Value = serde_json::from_str(&self.payload)
            .map_err(|e| {
                RepositoryError::Serialization(format!("invalid stream payload JSON: {e}"))
            })?;
        Ok(StreamItem {
            position,
            payload,
            written_at: parse_datetime(&self.written_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// StreamStore implementation
// ---------------------------------------------------------------------------

impl StreamStore for SqliteStreamStore {
    async fn append(
        &self,
        workflow_id: &str,
        namespace: &str,
        payload: &Value,
    ) -> Result<u64, RepositoryError> {
        let document = serde_json::to_string(payload)
            .map_err(|e| {
                RepositoryError::Serialization(format!("failed to serialize stream item: {e}"))
            })?;
        let now = format_datetime(&Utc::now());

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let closed =
            sqlx::query("SELECT 1 FROM stream_metadata WHERE workflow_id = ? AND namespace = ?")
                .bind(workflow_id)
                .bind(namespace)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_error)?;
        if closed.is_some() {
            return Err(RepositoryError::Conflict(format!(
                "stream {workflow_id}/{namespace} is closed"
            )));
        }

        let row = sqlx::query(
            r#"INSERT INTO stream_items (workflow_id, namespace, position, payload, written_at)
               SELECT ?1, ?2, COALESCE(MAX(position) + 1, 0), ?3, ?4
               FROM stream_items WHERE workflow_id = ?1 AND namespace = ?2
               RETURNING position"#,
        )
        .bind(workflow_id)
        .bind(namespace)
        .bind(&document)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error)?;
        let position: i64 = row.try_get("position").map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        u64::try_from(position)
            .map_err(|_| RepositoryError::Query(format!("invalid stream position: {position}")))
    }

    async fn read(
        &self,
        workflow_id: &str,
        namespace: &str,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<StreamItem>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT position, payload, written_at FROM stream_items
               WHERE workflow_id = ? AND namespace = ? AND position >= ?
               ORDER BY position ASC LIMIT ?"#,
        )
        .bind(workflow_id)
        .bind(namespace)
        .bind(i64::try_from(from_position).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(ItemRow::from_row(row).map_err(query_error)?.into_item()?);
        }
        Ok(items)
    }

    async fn get_metadata(
        &self,
        workflow_id: &str,
        namespace: &str,
    ) -> Result<Option<StreamMetadata>, RepositoryError> {
        let row = sqlx::query(
            "SELECT closed, abort_reason, closed_at FROM stream_metadata
             WHERE workflow_id = ? AND namespace = ?",
        )
        .bind(workflow_id)
        .bind(namespace)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let closed: bool = row.try_get("closed").map_err(query_error)?;
        let abort_reason: Option<String> = row.try_get("abort_reason").map_err(query_error)?;
        let closed_at: String = row.try_get("closed_at").map_err(query_error)?;
        Ok(Some(StreamMetadata {
            closed,
            abort_reason,
            closed_at: Some(parse_datetime(&closed_at)?),
        }))
    }

    async fn close_stream(
        &self,
        workflow_id: &str,
        namespace: &str,
        abort_reason: Option<&str>,
    ) -> Result<(), RepositoryError> {
        // The first close wins; later closes are no-ops.
        sqlx::query(
            r#"INSERT INTO stream_metadata (workflow_id, namespace, closed, abort_reason, closed_at)
               VALUES (?, ?, 1, ?, ?)
               ON CONFLICT (workflow_id, namespace) DO NOTHING"#,
        )
        .bind(workflow_id)
        .bind(namespace)
        .bind(abort_reason)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        tracing::debug!(workflow_id, namespace, aborted = abort_reason.is_some(), "stream closed");
        Ok(())
    }
}
