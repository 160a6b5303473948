//! Persistence ports for workflow state: a snapshot store and a workflow lock.
//!
//! The infrastructure layer (durastep-infra) implements these with SQLite.
//! In-memory implementations live here for tests and single-process use.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use durastep_types::error::RepositoryError;
use durastep_types::snapshot::{ListOptions, LockLease, PersistedState, StoredEntry};

/// Save/load/delete/list of persisted workflow state keyed by workflow id.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait SnapshotStore: Send + Sync {
    /// Upsert the state for `id`.
    fn save(
        &self,
        id: &str,
        state: &PersistedState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn load(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<PersistedState>, RepositoryError>> + Send;

    /// Returns `true` if the id existed.
    fn delete(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Most recently updated first.
    fn list(
        &self,
        options: &ListOptions,
    ) -> impl std::future::Future<Output = Result<Vec<StoredEntry>, RepositoryError>> + Send;
}

/// Mutual exclusion over a workflow id across processes.
pub trait WorkflowLock: Send + Sync {
    /// Acquire the lock unless another unexpired lease holds it.
    ///
    /// `ttl` of `None` means the lease never expires on its own.
    fn try_acquire(
        &self,
        id: &str,
        ttl: Option<Duration>,
    ) -> impl std::future::Future<Output = Result<Option<LockLease>, RepositoryError>> + Send;

    /// Release a lease. Only the holder of `owner_token` can release.
    fn release(
        &self,
        id: &str,
        owner_token: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

/// Build a new lease expiring `ttl` from now.
pub fn new_lease(ttl: Option<Duration>) -> LockLease {
    LockLease {
        owner_token: Uuid::now_v7().to_string(),
        expires_at: ttl.and_then(|t| chrono::Duration::from_std(t).ok()).map(|d| Utc::now() + d),
    }
}

/// Whether a lease is still held at `now`.
pub fn lease_active(lease: &LockLease, now: DateTime<Utc>) -> bool {
    lease.expires_at.is_none_or(|at| at > now)
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Process-local [`SnapshotStore`] + [`WorkflowLock`].
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    entries: DashMap<String, (PersistedState, DateTime<Utc>)>,
    locks: DashMap<String, LockLease>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, id: &str, state: &PersistedState) -> Result<(), RepositoryError> {
        self.entries.insert(id.to_string(), (state.clone(), Utc::now()));
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<PersistedState>, RepositoryError> {
        Ok(self.entries.get(id).map(|e| e.0.clone()))
    }

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.entries.remove(id).is_some())
    }

    async fn list(&self, options: &ListOptions) -> Result<Vec<StoredEntry>, RepositoryError> {
        let mut listed: Vec<StoredEntry> = self
            .entries
            .iter()
            .filter(|e| {
                options
                    .prefix
                    .as_deref()
                    .is_none_or(|p| e.key().starts_with(p))
            })
            .map(|e| StoredEntry {
                id: e.key().clone(),
                updated_at: e.value().1,
            })
            .collect();
        listed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = options.limit {
            listed.truncate(limit);
        }
        Ok(listed)
    }
}

impl WorkflowLock for InMemorySnapshotStore {
    async fn try_acquire(
        &self,
        id: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<LockLease>, RepositoryError> {
        let now = Utc::now();
        match self.locks.entry(id.to_string()) {
            Entry::Occupied(mut held) => {
                if lease_active(held.get(), now) {
                    return Ok(None);
                }
                let lease = new_lease(ttl);
                held.insert(lease.clone());
                Ok(Some(lease))
            }
            Entry::Vacant(slot) => {
                let lease = new_lease(ttl);
                slot.insert(lease.clone());
                Ok(Some(lease))
            }
        }
    }

    async fn release(&self, id: &str, owner_token: &str) -> Result<bool, RepositoryError> {
        Ok(self
            .locks
            .remove_if(id, |_, lease| lease.owner_token == owner_token)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durastep_types::snapshot::SerializedResumeState;
    use durastep_types::step::StepResult;
    use serde_json::json;

    fn state(n: i64) -> PersistedState {
        PersistedState::ResumeState(SerializedResumeState::new(vec![(
            "a".to_string(),
            StepResult::ok(json!(n)),
        )]))
    }

    #[tokio::test]
    async fn save_load_delete() {
        let store = InMemorySnapshotStore::new();
        assert!(store.load("wf-1").await.unwrap().is_none());
        store.save("wf-1", &state(1)).await.unwrap();
        store.save("wf-1", &state(2)).await.unwrap();
        assert_eq!(store.load("wf-1").await.unwrap(), Some(state(2)));
        assert!(store.delete("wf-1").await.unwrap());
        assert!(!store.delete("wf-1").await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_limits() {
        let store = InMemorySnapshotStore::new();
        store.save("order-1", &state(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        store.save("order-2", &state(1)).await.unwrap();
        store.save("invoice-1", &state(1)).await.unwrap();

        let orders = store
            .list(&ListOptions {
                prefix: Some("order-".into()),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(
            orders.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["order-2", "order-1"]
        );

        let limited = store
            .list(&ListOptions {
                prefix: None,
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = InMemorySnapshotStore::new();
        let lease = store.try_acquire("wf", None).await.unwrap().unwrap();
        assert!(store.try_acquire("wf", None).await.unwrap().is_none());
        assert!(!store.release("wf", "someone-else").await.unwrap());
        assert!(store.release("wf", &lease.owner_token).await.unwrap());
        assert!(store.try_acquire("wf", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = InMemorySnapshotStore::new();
        let first = store
            .try_acquire("wf", Some(Duration::from_millis(1)))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store.try_acquire("wf", None).await.unwrap().unwrap();
        assert_ne!(first.owner_token, second.owner_token);
        assert!(!store.release("wf", &first.owner_token).await.unwrap());
    }
}
