//! SQLite snapshot store and workflow lease lock.
//!
//! Implements `SnapshotStore` and `WorkflowLock` from `durastep-core`. Each
//! workflow id holds one JSON document (a snapshot or a serialized resume
//! state) that is overwritten on save.

use std::time::Duration;

use chrono::Utc;
use sqlx::Row;

use durastep_core::repository::snapshot::new_lease;
use durastep_core::repository::{SnapshotStore, WorkflowLock};
use durastep_types::error::RepositoryError;
use durastep_types::snapshot::{ListOptions, LockLease, PersistedState, StoredEntry};

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, query_error};

/// SQLite-backed [`SnapshotStore`] + [`WorkflowLock`].
pub struct SqliteSnapshotStore {
    pool: DatabasePool,
}

impl SqliteSnapshotStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Current lease on `id`, expired or not.
    pub async fn lock_holder(&self, id: &str) -> Result<Option<LockLease>, RepositoryError> {
        let row = sqlx::query("SELECT owner_token, expires_at FROM workflow_locks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let owner_token: String = row.try_get("owner_token").map_err(query_error)?;
        let expires_at: Option<String> = row.try_get("expires_at").map_err(query_error)?;
        Ok(Some(LockLease {
            owner_token,
            expires_at: expires_at.as_deref().map(parse_datetime).transpose()?,
        }))
    }

    /// Drop the lease on `id` regardless of owner. Returns `true` if one existed.
    pub async fn force_unlock(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_locks WHERE id = ?")
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        if result.rows_affected() > 0 {
            tracing::warn!(workflow_id = id, "workflow lease force-released");
        }
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Private row type for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct StateRow {
    id: String,
    updated_at: String,
}

impl StateRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_entry(self) -> Result<StoredEntry, RepositoryError> {
        Ok(StoredEntry {
            id: self.id,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

/// Escape `%`, `_` and the escape char itself for a `LIKE ... ESCAPE '\'` prefix match.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

// ---------------------------------------------------------------------------
// SnapshotStore implementation
// ---------------------------------------------------------------------------

impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, id: &str, state: &PersistedState) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let document = serde_json::to_string(state)
            .map_err(|e| {
                RepositoryError::Serialization(format!("failed to serialize workflow state: {e}"))
            })?;
        let step_count = i64::try_from(state.step_count()).unwrap_or(i64::MAX);

        sqlx::query(
            r#"INSERT INTO workflow_state (id, kind, state, step_count, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT (id) DO UPDATE SET
                   kind = excluded.kind,
                   state = excluded.state,
                   step_count = excluded.step_count,
                   updated_at = excluded.updated_at"#,
        )
        .bind(id)
        .bind(state.kind())
        .bind(&document)
        .bind(step_count)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        tracing::debug!(workflow_id = id, kind = state.kind(), step_count, "saved workflow state");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<PersistedState>, RepositoryError> {
        let row = sqlx::query("SELECT state FROM workflow_state WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let document: String = row.try_get("state").map_err(query_error)?;
                let state = serde_json::from_str(&document)
                    .map_err(|e| {
                        RepositoryError::Serialization(format!("invalid workflow state JSON: {e}"))
                    })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_state WHERE id = ?")
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, options: &ListOptions) -> Result<Vec<StoredEntry>, RepositoryError> {
        let limit = options
            .limit
            .map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = match options.prefix.as_deref() {
            Some(prefix) => {
                sqlx::query(
                    r#"SELECT id, updated_at FROM workflow_state
                       WHERE id LIKE ? ESCAPE '\'
                       ORDER BY updated_at DESC, id ASC LIMIT ?"#,
                )
                .bind(like_prefix(prefix))
                .bind(limit)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, updated_at FROM workflow_state
                     ORDER BY updated_at DESC, id ASC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_error)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(StateRow::from_row(row).map_err(query_error)?.into_entry()?);
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// WorkflowLock implementation
// ---------------------------------------------------------------------------

impl WorkflowLock for SqliteSnapshotStore {
    async fn try_acquire(
        &self,
        id: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<LockLease>, RepositoryError> {
        let now = format_datetime(&Utc::now());
        let lease = new_lease(ttl);
        let expires_at = lease.expires_at.as_ref().map(format_datetime);

        // Inserts a fresh lease or takes over an expired one in a single statement.
        let result = sqlx::query(
            r#"INSERT INTO workflow_locks (id, owner_token, expires_at, acquired_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT (id) DO UPDATE SET
                   owner_token = excluded.owner_token,
                   expires_at = excluded.expires_at,
                   acquired_at = excluded.acquired_at
               WHERE workflow_locks.expires_at IS NOT NULL AND workflow_locks.expires_at <= ?4"#,
        )
        .bind(id)
        .bind(&lease.owner_token)
        .bind(&expires_at)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            tracing::debug!(workflow_id = id, "workflow lease held elsewhere");
            return Ok(None);
        }
        tracing::debug!(workflow_id = id, owner = %lease.owner_token, "workflow lease acquired");
        Ok(Some(lease))
    }

    async fn release(&self, id: &str, owner_token: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_locks WHERE id = ? AND owner_token = ?")
            .bind(id)
            .bind(owner_token)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durastep_core::resume::ResumeState;
    use durastep_core::{InMemoryStepCache, StepCache};
    use durastep_types::snapshot::SerializedResumeState;
    use durastep_types::step::StepResult;
    use serde_json::json;

    async fn test_store() -> SqliteSnapshotStore {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("test.db")).await.unwrap();
        std::mem::forget(dir);
        SqliteSnapshotStore::new(pool)
    }

    fn state(n: i64) -> PersistedState {
        PersistedState::ResumeState(SerializedResumeState::new(vec![
            ("a".to_string(), StepResult::ok(json!(n))),
            ("b".to_string(), StepResult::ok(json!("done"))),
        ]))
    }

    #[tokio::test]
    async fn save_overwrites_and_load_returns_latest() {
        let store = test_store().await;
        assert!(store.load("order-1").await.unwrap().is_none());

        store.save("order-1", &state(1)).await.unwrap();
        store.save("order-1", &state(2)).await.unwrap();
        let loaded = store.load("order-1").await.unwrap().unwrap();
        assert_eq!(loaded, state(2));
        assert_eq!(loaded.kind(), "resume_state");
    }

    #[tokio::test]
    async fn saved_resume_state_seeds_a_cache() {
        let store = test_store().await;
        let mut resume = ResumeState::new();
        resume.insert("charge", durastep_core::resume::ResumeEntry::ok(json!({ "amount": 42 })));
        let serialized = resume.serialize(None).unwrap();
        store
            .save("order-9", &PersistedState::ResumeState(serialized))
            .await
            .unwrap();

        let Some(PersistedState::ResumeState(loaded)) = store.load("order-9").await.unwrap() else {
            panic!("expected resume state");
        };
        let restored = ResumeState::deserialize(&loaded, None).unwrap();
        let cache = InMemoryStepCache::new();
        restored.seed(&cache);
        assert_eq!(cache.get("charge").unwrap().unwrap(), json!({ "amount": 42 }));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = test_store().await;
        store.save("order-1", &state(1)).await.unwrap();
        assert!(store.delete("order-1").await.unwrap());
        assert!(!store.delete("order-1").await.unwrap());
        assert!(store.load("order-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_orders_by_recency_and_filters_prefix() {
        let store = test_store().await;
        store.save("order-1", &state(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.save("order-2", &state(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.save("invoice_1", &state(1)).await.unwrap();

        let all = store.list(&ListOptions::default()).await.unwrap();
        assert_eq!(
            all.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["invoice_1", "order-2", "order-1"]
        );

        let orders = store
            .list(&ListOptions {
                prefix: Some("order-".into()),
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, "order-2");

        // `_` is literal, not a wildcard.
        let none = store
            .list(&ListOptions {
                prefix: Some("order_".into()),
                limit: None,
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = test_store().await;
        let lease = store.try_acquire("wf", None).await.unwrap().unwrap();
        assert!(store.try_acquire("wf", None).await.unwrap().is_none());
        assert!(!store.release("wf", "someone-else").await.unwrap());
        assert_eq!(store.lock_holder("wf").await.unwrap(), Some(lease.clone()));
        assert!(store.release("wf", &lease.owner_token).await.unwrap());
        assert!(store.try_acquire("wf", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let store = test_store().await;
        let first = store
            .try_acquire("wf", Some(Duration::from_millis(10)))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = store.try_acquire("wf", Some(Duration::from_secs(60))).await.unwrap().unwrap();
        assert_ne!(first.owner_token, second.owner_token);
        assert!(!store.release("wf", &first.owner_token).await.unwrap());
        assert!(store.force_unlock("wf").await.unwrap());
        assert!(store.lock_holder("wf").await.unwrap().is_none());
    }
}
