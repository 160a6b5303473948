//! Workflow runner: owns the per-run wiring and drives a workflow body.
//!
//! # Execution flow
//!
//! 1. Resolve the cache (a resumed run without one gets an in-memory cache).
//! 2. Restore a snapshot and/or seed resume state into cache and registry.
//! 3. Emit `workflow_start` and await the body with a fresh [`Step`] handle.
//! 4. Map the outcome to a terminal status, emit the terminal event, run the
//!    checkpoint hook's `after_run`, and return a [`WorkflowRun`].
//!
//! A body that finishes after its signal fired keeps its own outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::{Map, Value};
use uuid::Uuid;

use durastep_types::config::{DriftPolicy, EngineConfig, LossyValuePolicy};
use durastep_types::error::UnexpectedError;
use durastep_types::event::WorkflowEvent;
use durastep_types::snapshot::{DEFINITION_HASH_KEY, WorkflowSnapshot, WorkflowStatus};
use durastep_types::step::{Cause, FailureOrigin};

use crate::cache::{InMemoryStepCache, StepCache};
use crate::cancel::CancelSignal;
use crate::detached::DetachedTasks;
use crate::error::{SnapshotError, UnexpectedMapper, WorkflowError};
use crate::event::EventBus;
use crate::outcome::DomainError;
use crate::resume::{ResumeState, RestoreOptions, StepDecoder, StepRegistry, restore_snapshot};

use super::checkpoint::{BoxCheckpointHook, CheckpointHook};
use super::context::{RunContext, RunSetup};
use super::step::Step;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A configured workflow. Reusable across runs.
pub struct Workflow<E> {
    name: String,
    cache: Option<Arc<dyn StepCache>>,
    events: Option<EventBus>,
    mapper: Option<UnexpectedMapper<E>>,
    checkpoint: Option<BoxCheckpointHook>,
    detached: DetachedTasks,
    lossy: LossyValuePolicy,
    drift: DriftPolicy,
    definition_hash: Option<String>,
    metadata: Map<String, Value>,
}

pub struct WorkflowBuilder<E> {
    inner: Workflow<E>,
}

impl<E: DomainError> Workflow<E> {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder<E> {
        WorkflowBuilder {
            inner: Workflow {
                name: name.into(),
                cache: None,
                events: None,
                mapper: None,
                checkpoint: None,
                detached: DetachedTasks::new(),
                lossy: LossyValuePolicy::default(),
                drift: DriftPolicy::default(),
                definition_hash: None,
                metadata: Map::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache(&self) -> Option<&Arc<dyn StepCache>> {
        self.cache.as_ref()
    }

    pub fn detached(&self) -> &DetachedTasks {
        &self.detached
    }

    /// Run the body from scratch.
    pub async fn run<T, F, Fut>(&self, body: F) -> WorkflowRun<T, E>
    where
        F: FnOnce(Step<E>) -> Fut,
        Fut: std::future::Future<Output = Result<T, WorkflowError<E>>>,
    {
        self.start(
            Uuid::now_v7().to_string(),
            self.cache.clone(),
            CancelSignal::new(),
            StepRegistry::new(),
            body,
        )
        .await
    }

    /// Run the body with resume state, a snapshot to restore, an external
    /// cancellation signal or a fixed workflow id.
    ///
    /// Fails before the body starts when the snapshot cannot be restored.
    pub async fn run_with<T, F, Fut>(
        &self,
        options: RunOptions,
        body: F,
    ) -> Result<WorkflowRun<T, E>, SnapshotError>
    where
        F: FnOnce(Step<E>) -> Fut,
        Fut: std::future::Future<Output = Result<T, WorkflowError<E>>>,
    {
        let restoring = options.resume.is_some() || options.snapshot.is_some();
        let cache = match (&self.cache, restoring) {
            (Some(cache), _) => Some(cache.clone()),
            (None, true) => Some(Arc::new(InMemoryStepCache::new()) as Arc<dyn StepCache>),
            (None, false) => None,
        };

        let mut seeded = IndexMap::new();
        let mut drift = None;
        if let (Some(snapshot), Some(cache)) = (options.snapshot.as_ref(), cache.as_deref()) {
            let restore = RestoreOptions {
                definition_hash: self.definition_hash.clone(),
                drift_policy: self.drift,
                decoder: options.decoder.clone(),
            };
            let restored = restore_snapshot(snapshot, cache, &restore)?;
            seeded = restored.steps;
            drift = restored.drift;
        }
        if let (Some(state), Some(cache)) = (options.resume.as_ref(), cache.as_deref()) {
            state.seed(cache);
            for (key, entry) in state.iter() {
                seeded.insert(key.clone(), entry.to_step_result());
            }
        }
        if !seeded.is_empty() {
            tracing::info!(workflow = %self.name, steps = seeded.len(), "resuming workflow");
        }

        let workflow_id = options.workflow_id.unwrap_or_else(|| Uuid::now_v7().to_string());
        let signal = options.signal.unwrap_or_default();
        let mut run = self
            .start(workflow_id, cache, signal, StepRegistry::seeded(seeded), body)
            .await;
        run.drift = drift;
        Ok(run)
    }

    fn run_metadata(&self) -> Map<String, Value> {
        let mut metadata = self.metadata.clone();
        metadata.insert("workflowName".to_string(), Value::String(self.name.clone()));
        if let Some(hash) = &self.definition_hash {
            metadata.insert(DEFINITION_HASH_KEY.to_string(), Value::String(hash.clone()));
        }
        metadata
    }

    async fn start<T, F, Fut>(
        &self,
        workflow_id: String,
        cache: Option<Arc<dyn StepCache>>,
        signal: CancelSignal,
        mut registry: StepRegistry,
        body: F,
    ) -> WorkflowRun<T, E>
    where
        F: FnOnce(Step<E>) -> Fut,
        Fut: std::future::Future<Output = Result<T, WorkflowError<E>>>,
    {
        registry.set_metadata(Some(self.run_metadata()));
        let ctx = Arc::new(RunContext::new(RunSetup {
            workflow_id: workflow_id.clone(),
            cache,
            events: self.events.clone(),
            signal,
            mapper: self.mapper.clone(),
            checkpoint: self.checkpoint.clone(),
            detached: self.detached.clone(),
            lossy: self.lossy,
            registry,
        }));

        ctx.emit(WorkflowEvent::WorkflowStart {
            workflow_id: workflow_id.clone(),
        });
        tracing::info!(workflow = %self.name, workflow_id = %workflow_id, "workflow started");
        let started = Instant::now();

        let result = if ctx.signal.is_cancelled() {
            Err(ctx.cancelled_error())
        } else {
            body(Step::new(ctx.clone())).await
        };
        let duration = started.elapsed();
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

        let (failure_cause, failure_origin) = match &result {
            Ok(_) => {
                ctx.complete(WorkflowStatus::Completed);
                ctx.emit(WorkflowEvent::WorkflowSuccess {
                    workflow_id: workflow_id.clone(),
                    duration_ms,
                });
                tracing::info!(
                    workflow = %self.name,
                    workflow_id = %workflow_id,
                    duration_ms,
                    "workflow completed"
                );
                (None, None)
            }
            Err(error) => {
                ctx.complete(WorkflowStatus::Failed);
                match error {
                    WorkflowError::Cancelled(cancelled) => {
                        ctx.emit(WorkflowEvent::WorkflowCancelled {
                            workflow_id: workflow_id.clone(),
                            reason: cancelled.reason.clone(),
                            last_step_key: cancelled.last_step_key.clone(),
                        })
                    }
                    other => ctx.emit(WorkflowEvent::WorkflowError {
                        workflow_id: workflow_id.clone(),
                        error: serde_json::to_value(other).unwrap_or_default(),
                        duration_ms,
                    }),
                }
                tracing::warn!(
                    workflow = %self.name,
                    workflow_id = %workflow_id,
                    error = %error,
                    "workflow failed"
                );
                ctx.failure_details(error)
            }
        };

        let snapshot = ctx.lenient_snapshot();
        if let Some(hook) = &ctx.checkpoint {
            hook.after_run(&workflow_id, &snapshot).await;
        }

        WorkflowRun {
            workflow_id,
            result,
            failure_cause,
            failure_origin,
            snapshot,
            lossy: self.lossy,
            duration,
            drift: None,
        }
    }
}

impl<E: DomainError> WorkflowBuilder<E> {
    /// Use `cache` for keyed steps.
    pub fn cache<C: StepCache + 'static>(mut self, cache: C) -> Self {
        self.inner.cache = Some(Arc::new(cache));
        self
    }

    /// Share an existing cache with other workflows or the caller.
    pub fn shared_cache(mut self, cache: Arc<dyn StepCache>) -> Self {
        self.inner.cache = Some(cache);
        self
    }

    pub fn events(mut self, bus: EventBus) -> Self {
        self.inner.events = Some(bus);
        self
    }

    /// Map thrown errors into the domain error type.
    pub fn on_unexpected<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&UnexpectedError) -> E + Send + Sync + 'static,
    {
        self.inner.mapper = Some(Arc::new(mapper));
        self
    }

    pub fn checkpoint<H: CheckpointHook + 'static>(mut self, hook: H) -> Self {
        self.inner.checkpoint = Some(BoxCheckpointHook::new(hook));
        self
    }

    /// Track disconnect-timeout tasks in a caller-owned set.
    pub fn detached(mut self, detached: DetachedTasks) -> Self {
        self.inner.detached = detached;
        self
    }

    /// Apply the `[snapshot]` section of an engine configuration.
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.inner.lossy = config.snapshot.lossy_values;
        self.inner.drift = config.snapshot.drift_policy;
        self
    }

    pub fn lossy_values(mut self, policy: LossyValuePolicy) -> Self {
        self.inner.lossy = policy;
        self
    }

    pub fn drift_policy(mut self, policy: DriftPolicy) -> Self {
        self.inner.drift = policy;
        self
    }

    /// Fingerprint of the workflow code, recorded in every snapshot.
    pub fn definition_hash(mut self, hash: impl Into<String>) -> Self {
        self.inner.definition_hash = Some(hash.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inner.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Workflow<E> {
        self.inner
    }
}

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RunOptions {
    pub workflow_id: Option<String>,
    pub signal: Option<CancelSignal>,
    pub resume: Option<ResumeState>,
    pub snapshot: Option<WorkflowSnapshot>,
    /// Custom decoder for restored step values.
    pub decoder: Option<StepDecoder>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    pub fn signal(mut self, signal: CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn resume(mut self, state: ResumeState) -> Self {
        self.resume = Some(state);
        self
    }

    pub fn snapshot(mut self, snapshot: WorkflowSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn decoder(mut self, decoder: StepDecoder) -> Self {
        self.decoder = Some(decoder);
        self
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("workflow_id", &self.workflow_id)
            .field("resume", &self.resume.as_ref().map(ResumeState::len))
            .field("snapshot", &self.snapshot.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

/// Outcome of one workflow run.
#[derive(Debug)]
pub struct WorkflowRun<T, E> {
    pub workflow_id: String,
    pub result: Result<T, WorkflowError<E>>,
    /// Cause of the step failure the run failed with.
    pub failure_cause: Option<Cause>,
    pub failure_origin: Option<FailureOrigin>,
    snapshot: WorkflowSnapshot,
    lossy: LossyValuePolicy,
    pub duration: Duration,
    /// Set when the restored snapshot came from a different definition and
    /// the drift policy let the run continue with a warning.
    pub drift: Option<String>,
}

impl<T, E> WorkflowRun<T, E> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, WorkflowError<E>> {
        self.result
    }

    /// Terminal snapshot of the run. Fails under the strict lossy policy
    /// when a recorded value is not JSON-safe.
    pub fn snapshot(&self) -> Result<&WorkflowSnapshot, SnapshotError> {
        if self.lossy == LossyValuePolicy::Strict {
            if let Some(w) = self.snapshot.warnings.first() {
                return Err(SnapshotError::LossyValue {
                    step_id: w.step_id.clone(),
                    path: w.path.clone(),
                    reason: w.reason.clone(),
                });
            }
        }
        Ok(&self.snapshot)
    }

    /// Steps to pre-seed into a later run. Parked steps are left out.
    pub fn resume_state(&self) -> ResumeState {
        ResumeState::from_snapshot(&self.snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use futures_util::future::BoxFuture;
    use serde::{Deserialize, Serialize};

    use durastep_types::snapshot::PersistedState;

    use super::*;
    use crate::event::SubscribeOptions;
    use crate::repository::{InMemorySnapshotStore, SnapshotStore};
    use crate::workflow::SnapshotCheckpointer;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum ShipError {
        AddressInvalid,
    }

    fn event_names(bus: &EventBus) -> (Arc<Mutex<Vec<String>>>, crate::event::Subscription) {
        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = names.clone();
        let sub = bus.subscribe(
            move |e| sink.lock().unwrap().push(e.name().to_string()),
            SubscribeOptions::sync(),
        );
        (names, sub)
    }

    #[derive(Default)]
    struct Counters {
        a: AtomicUsize,
        b: AtomicUsize,
        c: AtomicUsize,
    }

    type ShipBody = BoxFuture<'static, Result<u32, WorkflowError<ShipError>>>;

    fn shipping(
        counters: Arc<Counters>,
        address_ok: bool,
    ) -> impl FnOnce(Step<ShipError>) -> ShipBody {
        move |step| {
            Box::pin(async move {
                let c = counters.clone();
                let weight = step
                    .run("a", move || {
                        c.a.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<_, ShipError>(3u32) }
                    })
                    .await?;
                let c = counters.clone();
                let zone = step
                    .run("b", move || {
                        c.b.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if address_ok {
                                Ok(2u32)
                            } else {
                                Err(ShipError::AddressInvalid)
                            }
                        }
                    })
                    .await?;
                let c = counters.clone();
                step.run("c", move || {
                    c.c.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, ShipError>(weight * zone) }
                })
                .await
            })
        }
    }

    #[tokio::test]
    async fn failed_run_resumes_from_the_failed_step() {
        let counters = Arc::new(Counters::default());
        let bus = EventBus::default();
        let (names, _sub) = event_names(&bus);
        let wf = Workflow::<ShipError>::builder("ship")
            .cache(InMemoryStepCache::new())
            .events(bus)
            .build();

        let first = wf.run(shipping(counters.clone(), false)).await;
        assert_eq!(first.result.as_ref().unwrap_err().domain(), Some(&ShipError::AddressInvalid));
        assert_eq!(first.snapshot().unwrap().execution.status, WorkflowStatus::Failed);
        assert_eq!(
            *names.lock().unwrap(),
            vec![
                "workflow_start",
                "cache_miss",
                "step_start",
                "step_success",
                "step_complete",
                "cache_miss",
                "step_start",
                "step_error",
                "step_complete",
                "workflow_error",
            ]
        );

        let mut state = first.resume_state();
        assert!(state.clear_step("b"));
        names.lock().unwrap().clear();

        // A fresh workflow without a cache of its own: state alone carries `a`.
        let bus = EventBus::default();
        let (names, _sub) = event_names(&bus);
        let resumed = Workflow::<ShipError>::builder("ship").events(bus).build();
        let second = resumed
            .run_with(RunOptions::new().resume(state), shipping(counters.clone(), true))
            .await
            .unwrap();

        assert_eq!(second.result.as_ref().unwrap(), &6);
        assert_eq!(counters.a.load(Ordering::SeqCst), 1);
        assert_eq!(counters.b.load(Ordering::SeqCst), 2);
        assert_eq!(counters.c.load(Ordering::SeqCst), 1);
        assert_eq!(names.lock().unwrap().iter().filter(|n| *n == "cache_hit").count(), 1);
        assert_eq!(names.lock().unwrap().last().map(String::as_str), Some("workflow_success"));

        let snapshot = second.snapshot().unwrap();
        assert_eq!(snapshot.execution.status, WorkflowStatus::Completed);
        assert_eq!(snapshot.steps.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn snapshot_survives_json_and_restores_steps() {
        let counters = Arc::new(Counters::default());
        let wf = Workflow::<ShipError>::builder("ship").definition_hash("v1").build();

        let first = wf.run(shipping(counters.clone(), false)).await;
        let mut snapshot = first.snapshot().unwrap().clone();
        assert_eq!(snapshot.definition_hash(), Some("v1"));
        snapshot.steps.shift_remove("b");

        let text = serde_json::to_string(&snapshot).unwrap();
        let restored: WorkflowSnapshot = serde_json::from_str(&text).unwrap();

        let second = wf
            .run_with(RunOptions::new().snapshot(restored), shipping(counters.clone(), true))
            .await
            .unwrap();
        assert_eq!(second.into_result().unwrap(), 6);
        assert_eq!(counters.a.load(Ordering::SeqCst), 1);
        assert_eq!(counters.b.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drifted_definition_is_rejected_under_error_policy() {
        let counters = Arc::new(Counters::default());
        let old = Workflow::<ShipError>::builder("ship").definition_hash("v1").build();
        let snapshot = old.run(shipping(counters.clone(), true)).await.snapshot().unwrap().clone();

        let new = Workflow::<ShipError>::builder("ship")
            .definition_hash("v2")
            .drift_policy(DriftPolicy::Error)
            .build();
        let err = new
            .run_with(RunOptions::new().snapshot(snapshot), shipping(counters.clone(), true))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::DefinitionDrift { .. }));
        // The body never ran a second time.
        assert_eq!(counters.a.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drifted_definition_is_reported_under_warn_policy() {
        let counters = Arc::new(Counters::default());
        let old = Workflow::<ShipError>::builder("ship").definition_hash("v1").build();
        let first = old.run(shipping(counters.clone(), true)).await;
        assert!(first.drift.is_none());
        let snapshot = first.snapshot().unwrap().clone();

        let new = Workflow::<ShipError>::builder("ship").definition_hash("v2").build();
        let second = new
            .run_with(RunOptions::new().snapshot(snapshot), shipping(counters.clone(), true))
            .await
            .unwrap();
        let drift = second.drift.as_deref().unwrap();
        assert!(drift.contains("v1") && drift.contains("v2"), "{drift}");
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn strict_policy_rejects_non_finite_values() {
        let body = |step: Step<ShipError>| async move {
            step.run("ratio", || async { Ok::<_, ShipError>(f64::NAN) }).await
        };

        let warn = Workflow::<ShipError>::builder("ratio").build().run(body).await;
        let snapshot = warn.snapshot().unwrap();
        assert_eq!(snapshot.warnings.len(), 1);
        assert_eq!(snapshot.warnings[0].step_id, "ratio");

        let strict = Workflow::<ShipError>::builder("ratio")
            .lossy_values(LossyValuePolicy::Strict)
            .build()
            .run(body)
            .await;
        assert!(strict.is_ok());
        assert!(matches!(strict.snapshot(), Err(SnapshotError::LossyValue { .. })));
    }

    #[tokio::test]
    async fn checkpointer_keeps_the_latest_snapshot() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let counters = Arc::new(Counters::default());
        let wf = Workflow::<ShipError>::builder("ship")
            .checkpoint(SnapshotCheckpointer::new(store.clone()))
            .build();

        let run = wf
            .run_with(RunOptions::new().workflow_id("order-17"), shipping(counters, true))
            .await
            .unwrap();
        assert!(run.is_ok());

        let Some(PersistedState::Snapshot(saved)) = store.load("order-17").await.unwrap() else {
            panic!("expected a persisted snapshot");
        };
        assert_eq!(saved.execution.status, WorkflowStatus::Completed);
        assert_eq!(saved.steps.len(), 3);
        assert_eq!(saved.metadata.unwrap()["workflowName"], "ship");
    }

    #[tokio::test]
    async fn cancelled_before_start_fails_without_running() {
        let counters = Arc::new(Counters::default());
        let signal = CancelSignal::new();
        signal.cancel(Some("shutdown".to_string()));
        let wf = Workflow::<ShipError>::builder("ship").build();

        let run = wf
            .run_with(RunOptions::new().signal(signal), shipping(counters.clone(), true))
            .await
            .unwrap();
        assert!(run.result.as_ref().unwrap_err().is_cancelled());
        assert_eq!(run.snapshot().unwrap().execution.status, WorkflowStatus::Failed);
        assert_eq!(counters.a.load(Ordering::SeqCst), 0);
    }
}
