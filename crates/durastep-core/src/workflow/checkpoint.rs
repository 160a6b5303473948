//! After-step checkpoint hooks.
//!
//! A hook runs after every freshly executed keyed step (never on cache hits)
//! and once more when the run finishes. The typical hook is
//! [`SnapshotCheckpointer`], which persists the run's snapshot so a crashed
//! process can resume from the last completed step.
//!
//! Follows the same blanket-impl pattern as the repository ports:
//! 1. `CheckpointHook` uses native async fn in traits
//! 2. `CheckpointHookDyn` is the object-safe version with boxed futures
//! 3. `BoxCheckpointHook` wraps `Arc<dyn CheckpointHookDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use durastep_types::snapshot::{PersistedState, WorkflowSnapshot};
use durastep_types::step::StepResult;

use crate::repository::snapshot::SnapshotStore;

/// What a hook sees after a step.
#[derive(Debug, Clone)]
pub struct StepCheckpoint {
    pub workflow_id: String,
    pub step_key: String,
    pub result: StepResult,
    /// Snapshot of the run including this step.
    pub snapshot: WorkflowSnapshot,
}

pub trait CheckpointHook: Send + Sync {
    fn after_step(&self, checkpoint: &StepCheckpoint) -> impl Future<Output = ()> + Send;

    /// Called with the terminal snapshot when the run finishes.
    fn after_run(
        &self,
        _workflow_id: &str,
        _snapshot: &WorkflowSnapshot,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Object-safe version of [`CheckpointHook`] with boxed futures.
pub trait CheckpointHookDyn: Send + Sync {
    fn after_step_boxed<'a>(
        &'a self,
        checkpoint: &'a StepCheckpoint,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn after_run_boxed<'a>(
        &'a self,
        workflow_id: &'a str,
        snapshot: &'a WorkflowSnapshot,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

impl<T: CheckpointHook> CheckpointHookDyn for T {
    fn after_step_boxed<'a>(
        &'a self,
        checkpoint: &'a StepCheckpoint,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.after_step(checkpoint))
    }

    fn after_run_boxed<'a>(
        &'a self,
        workflow_id: &'a str,
        snapshot: &'a WorkflowSnapshot,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.after_run(workflow_id, snapshot))
    }
}

/// Type-erased checkpoint hook, cheap to clone.
#[derive(Clone)]
pub struct BoxCheckpointHook {
    inner: Arc<dyn CheckpointHookDyn>,
}

impl BoxCheckpointHook {
    pub fn new<T: CheckpointHook + 'static>(hook: T) -> Self {
        Self {
            inner: Arc::new(hook),
        }
    }

    pub async fn after_step(&self, checkpoint: &StepCheckpoint) {
        self.inner.after_step_boxed(checkpoint).await
    }

    pub async fn after_run(&self, workflow_id: &str, snapshot: &WorkflowSnapshot) {
        self.inner.after_run_boxed(workflow_id, snapshot).await
    }
}

impl std::fmt::Debug for BoxCheckpointHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCheckpointHook").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SnapshotCheckpointer
// ---------------------------------------------------------------------------

/// Persists the run snapshot to a [`SnapshotStore`] after every step.
///
/// Store failures are logged and never fail the step.
pub struct SnapshotCheckpointer<S: SnapshotStore> {
    store: Arc<S>,
}

impl<S: SnapshotStore> SnapshotCheckpointer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn persist(&self, workflow_id: &str, snapshot: &WorkflowSnapshot) {
        let state = PersistedState::Snapshot(snapshot.clone());
        if let Err(e) = self.store.save(workflow_id, &state).await {
            tracing::warn!(workflow_id, error = %e, "failed to persist workflow snapshot");
        } else {
            tracing::debug!(
                workflow_id,
                steps = snapshot.steps.len(),
                "checkpointed workflow snapshot"
            );
        }
    }
}

impl<S: SnapshotStore> CheckpointHook for SnapshotCheckpointer<S> {
    async fn after_step(&self, checkpoint: &StepCheckpoint) {
        self.persist(&checkpoint.workflow_id, &checkpoint.snapshot).await
    }

    async fn after_run(&self, workflow_id: &str, snapshot: &WorkflowSnapshot) {
        self.persist(workflow_id, snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::snapshot::InMemorySnapshotStore;
    use crate::resume::{SnapshotQuery, StepRegistry};
    use serde_json::json;

    #[tokio::test]
    async fn checkpointer_persists_snapshot() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let hook = BoxCheckpointHook::new(SnapshotCheckpointer::new(store.clone()));

        let mut registry = StepRegistry::new();
        registry.record("a", StepResult::ok(json!(1)), None);
        let checkpoint = StepCheckpoint {
            workflow_id: "wf-1".to_string(),
            step_key: "a".to_string(),
            result: StepResult::ok(json!(1)),
            snapshot: registry.snapshot(&SnapshotQuery::default()),
        };
        hook.after_step(&checkpoint).await;

        let saved = store.load("wf-1").await.unwrap().unwrap();
        assert_eq!(saved.kind(), "snapshot");
        assert_eq!(saved.step_count(), 1);
    }
}
