//! Per-run state shared by every `Step` handle of one workflow invocation.
//!
//! Holds the cache, the event sink, the cancellation signal, the step
//! registry and output slots, and implements the failure classification
//! rules: returned failures keep origin `result`, thrown errors and panics
//! become origin `throw` and go through the unexpected-error mapper exactly
//! once per occurrence.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};

use durastep_types::config::LossyValuePolicy;
use durastep_types::error::{Aborted, StepTimeoutError, UnexpectedError, WorkflowCancelledError};
use durastep_types::event::WorkflowEvent;
use durastep_types::snapshot::{SnapshotWarning, WorkflowSnapshot, WorkflowStatus};
use durastep_types::step::{CacheEntry, Cause, FailureOrigin, StepFailureMeta, StepResult};

use crate::cache::StepCache;
use crate::cache::encoding::{decode_meta, encode_failure, entry_to_step_result};
use crate::cancel::CancelSignal;
use crate::detached::DetachedTasks;
use crate::error::{SnapshotError, UnexpectedMapper, WorkflowError};
use crate::event::EventBus;
use crate::outcome::{DomainError, Fault, StepValue, panic_cause, thrown_cause};
use crate::resume::lossy;
use crate::resume::{SnapshotQuery, StepRegistry};

use super::checkpoint::{BoxCheckpointHook, StepCheckpoint};
use super::timeout::OnTimeout;

/// Output of a caught operation: the operation's result, or a panic payload.
pub(crate) type Caught<T, R> = Result<Result<T, R>, Box<dyn Any + Send>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Classified
// ---------------------------------------------------------------------------

/// A step failure with its diagnostic cause and origin.
#[derive(Debug)]
pub(crate) struct Classified<E> {
    pub error: WorkflowError<E>,
    pub cause: Option<Cause>,
    pub origin: FailureOrigin,
}

impl<E> Classified<E> {
    /// A failure raised by the engine itself (timeout, cancellation, suspension).
    pub fn engine(error: WorkflowError<E>) -> Self {
        Self {
            error,
            cause: None,
            origin: FailureOrigin::Result,
        }
    }

    pub fn meta(&self) -> StepFailureMeta {
        match self.origin {
            FailureOrigin::Result => StepFailureMeta::Result {
                result_cause: self.cause.clone(),
            },
            FailureOrigin::Throw => StepFailureMeta::Throw {
                thrown: self.cause.clone().unwrap_or(Cause::Thrown { value: Value::Null }),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct LastFailure {
    error: Value,
    cause: Option<Cause>,
    origin: FailureOrigin,
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

pub(crate) struct RunContext<E> {
    pub workflow_id: String,
    pub cache: Option<Arc<dyn StepCache>>,
    pub events: Option<EventBus>,
    pub signal: CancelSignal,
    pub mapper: Option<UnexpectedMapper<E>>,
    pub checkpoint: Option<BoxCheckpointHook>,
    pub detached: DetachedTasks,
    pub lossy: LossyValuePolicy,
    registry: Mutex<StepRegistry>,
    outputs: DashMap<String, Value>,
    last_step_key: Mutex<Option<String>>,
    last_failure: Mutex<Option<LastFailure>>,
}

pub(crate) struct RunSetup<E> {
    pub workflow_id: String,
    pub cache: Option<Arc<dyn StepCache>>,
    pub events: Option<EventBus>,
    pub signal: CancelSignal,
    pub mapper: Option<UnexpectedMapper<E>>,
    pub checkpoint: Option<BoxCheckpointHook>,
    pub detached: DetachedTasks,
    pub lossy: LossyValuePolicy,
    pub registry: StepRegistry,
}

impl<E: DomainError> RunContext<E> {
    pub fn new(setup: RunSetup<E>) -> Self {
        Self {
            workflow_id: setup.workflow_id,
            cache: setup.cache,
            events: setup.events,
            signal: setup.signal,
            mapper: setup.mapper,
            checkpoint: setup.checkpoint,
            detached: setup.detached,
            lossy: setup.lossy,
            registry: Mutex::new(setup.registry),
            outputs: DashMap::new(),
            last_step_key: Mutex::new(None),
            last_failure: Mutex::new(None),
        }
    }

    pub fn emit(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    pub fn last_step_key(&self) -> Option<String> {
        lock(&self.last_step_key).clone()
    }

    pub fn cancelled_error(&self) -> WorkflowError<E> {
        WorkflowError::Cancelled(WorkflowCancelledError {
            reason: self.signal.reason(),
            last_step_key: self.last_step_key(),
        })
    }

    pub fn output(&self, slot: &str) -> Option<Value> {
        self.outputs.get(slot).map(|v| v.clone())
    }

    // -----------------------------------------------------------------------
    // Classification
    // -----------------------------------------------------------------------

    /// Route a thrown failure through the unexpected-error mapper.
    ///
    /// Without a custom mapper, an [`Aborted`] error becomes a cancellation.
    pub fn map_unexpected(
        &self,
        step_id: Option<&str>,
        cause: Cause,
        aborted: Option<Aborted>,
    ) -> WorkflowError<E> {
        let unexpected = UnexpectedError {
            cause,
            step_id: step_id.map(str::to_string),
        };
        match &self.mapper {
            Some(mapper) => WorkflowError::Domain(mapper(&unexpected)),
            None => match aborted {
                Some(aborted) => WorkflowError::Cancelled(WorkflowCancelledError {
                    reason: aborted.reason.or_else(|| self.signal.reason()),
                    last_step_key: self.last_step_key(),
                }),
                None => WorkflowError::Unexpected(unexpected),
            },
        }
    }

    pub fn classify_fault(&self, step_id: &str, fault: Fault<E>) -> Classified<E> {
        match fault {
            Fault::Returned(failure) => Classified {
                error: WorkflowError::Domain(failure.error),
                cause: failure.cause,
                origin: FailureOrigin::Result,
            },
            Fault::Thrown(err) => {
                let cause = thrown_cause(&err);
                let aborted = err.downcast_ref::<Aborted>().cloned();
                tracing::debug!(step_id, error = %err, "step operation threw");
                Classified {
                    error: self.map_unexpected(Some(step_id), cause.clone(), aborted),
                    cause: Some(cause),
                    origin: FailureOrigin::Throw,
                }
            }
            Fault::PendingApproval(p) => Classified::engine(WorkflowError::PendingApproval(p)),
            Fault::PendingHook(p) => Classified::engine(WorkflowError::PendingHook(p)),
            Fault::Rejected(r) => Classified::engine(WorkflowError::ApprovalRejected(r)),
        }
    }

    pub fn classify_panic(&self, step_id: &str, payload: &(dyn Any + Send)) -> Classified<E> {
        let cause = panic_cause(payload);
        tracing::warn!(step_id, cause = %cause.summary(), "step operation panicked");
        Classified {
            error: self.map_unexpected(Some(step_id), cause.clone(), None),
            cause: Some(cause),
            origin: FailureOrigin::Throw,
        }
    }

    pub fn classify_caught<T, R: Into<Fault<E>>>(
        &self,
        step_id: &str,
        caught: Caught<T, R>,
    ) -> Result<T, Classified<E>> {
        match caught {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(r)) => Err(self.classify_fault(step_id, r.into())),
            Err(payload) => Err(self.classify_panic(step_id, payload.as_ref())),
        }
    }

    pub fn classify_timeout(&self, info: StepTimeoutError, policy: &OnTimeout<E>) -> Classified<E> {
        let cause = Some(Cause::from_error(&info));
        let error = match policy {
            OnTimeout::Custom(build) => WorkflowError::Domain(build(&info)),
            OnTimeout::Error | OnTimeout::Disconnect => WorkflowError::Timeout(info),
        };
        Classified {
            error,
            cause,
            origin: FailureOrigin::Result,
        }
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    fn error_value(error: &WorkflowError<E>) -> Value {
        serde_json::to_value(error)
            .unwrap_or_else(|_| json!({ "unserializable": format!("{error:?}") }))
    }

    /// JSON form of a success value plus at most one lossy-value warning.
    fn encode_value<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> (Option<Value>, Option<SnapshotWarning>) {
        let warning_at = |path: String, reason: String| SnapshotWarning {
            step_id: key.to_string(),
            path,
            reason,
        };
        match serde_json::to_value(value) {
            Ok(json) => {
                let warning = match self.lossy {
                    LossyValuePolicy::Off => None,
                    _ => lossy::scan(value)
                        .into_iter()
                        .next()
                        .map(|f| warning_at(f.path, f.reason)),
                };
                if let Some(w) = &warning {
                    tracing::warn!(
                        step_key = key,
                        path = %w.path,
                        reason = %w.reason,
                        "step value is not JSON-safe"
                    );
                }
                (Some(json), warning)
            }
            Err(e) => {
                tracing::warn!(
                    step_key = key,
                    error = %e,
                    "step value could not be serialized; not cached"
                );
                let reason = format!("value could not be serialized: {e}");
                (None, Some(warning_at(String::new(), reason)))
            }
        }
    }

    fn record(&self, key: &str, result: StepResult, warning: Option<SnapshotWarning>) {
        lock(&self.registry).record(key, result, warning);
    }

    pub async fn complete_success<T: StepValue>(
        &self,
        step_id: &str,
        key: Option<&str>,
        value: &T,
        ttl: Option<std::time::Duration>,
        out: Option<&str>,
        duration_ms: u64,
    ) {
        let (json, warning) = self.encode_value(key.unwrap_or(step_id), value);
        if let (Some(slot), Some(json)) = (out, json.as_ref()) {
            self.outputs.insert(slot.to_string(), json.clone());
        }
        self.emit(WorkflowEvent::StepSuccess {
            workflow_id: self.workflow_id.clone(),
            step_id: step_id.to_string(),
            step_key: key.map(str::to_string),
            duration_ms,
        });
        tracing::debug!(step_id, step_key = ?key, duration_ms, "step succeeded");

        let Some(key) = key else {
            return;
        };
        if let (Some(cache), Some(json)) = (&self.cache, json.as_ref()) {
            cache.set(key, Ok(json.clone()), ttl);
        }
        let result = StepResult::ok(json.unwrap_or(Value::Null));
        self.record(key, result.clone(), warning);
        *lock(&self.last_step_key) = Some(key.to_string());
        self.emit(WorkflowEvent::StepComplete {
            workflow_id: self.workflow_id.clone(),
            step_key: key.to_string(),
            ok: true,
            duration_ms,
        });
        self.after_step(key, result).await;
    }

    pub async fn complete_failure(
        &self,
        step_id: &str,
        key: Option<&str>,
        failure: Classified<E>,
        ttl: Option<std::time::Duration>,
        duration_ms: u64,
    ) -> WorkflowError<E> {
        let error_json = Self::error_value(&failure.error);
        self.emit(WorkflowEvent::StepError {
            workflow_id: self.workflow_id.clone(),
            step_id: step_id.to_string(),
            step_key: key.map(str::to_string),
            error: error_json.clone(),
            origin: failure.origin,
            duration_ms,
        });
        tracing::debug!(
            step_id,
            step_key = ?key,
            origin = %failure.origin,
            error = %failure.error,
            "step failed"
        );
        *lock(&self.last_failure) = Some(LastFailure {
            error: error_json.clone(),
            cause: failure.cause.clone(),
            origin: failure.origin,
        });

        let Some(key) = key else {
            return failure.error;
        };
        if failure.error.is_cancelled() {
            return failure.error;
        }
        if !failure.error.is_suspension() {
            if let Some(cache) = &self.cache {
                let entry =
                    encode_failure(error_json.clone(), failure.meta(), failure.cause.clone());
                cache.set(key, Err(entry), ttl);
            }
        }
        let result = StepResult::err(error_json, failure.cause.clone(), failure.origin);
        self.record(key, result.clone(), None);
        self.emit(WorkflowEvent::StepComplete {
            workflow_id: self.workflow_id.clone(),
            step_key: key.to_string(),
            ok: false,
            duration_ms,
        });
        self.after_step(key, result).await;
        failure.error
    }

    /// Serve a step from a cache entry.
    pub fn replay<T: StepValue>(
        &self,
        step_id: &str,
        key: &str,
        entry: CacheEntry,
        out: Option<&str>,
    ) -> Result<T, WorkflowError<E>> {
        let result = entry_to_step_result(&entry);
        match entry {
            Ok(value) => {
                let typed: T = serde_json::from_value(value.clone())
                    .map_err(|e| self.map_unexpected(Some(step_id), Cause::from_error(&e), None))?;
                if let Some(slot) = out {
                    self.outputs.insert(slot.to_string(), value);
                }
                self.record(key, result, None);
                *lock(&self.last_step_key) = Some(key.to_string());
                Ok(typed)
            }
            Err(failure) => {
                let meta = decode_meta(failure.cause.as_ref());
                let error: WorkflowError<E> = serde_json::from_value(failure.error.clone())
                    .map_err(|e| self.map_unexpected(Some(step_id), Cause::from_error(&e), None))?;
                *lock(&self.last_failure) = Some(LastFailure {
                    error: failure.error,
                    cause: meta.cause().cloned(),
                    origin: meta.origin(),
                });
                self.record(key, result, None);
                Err(error)
            }
        }
    }

    /// Store a stream drain's resume cursor.
    ///
    /// Each checkpoint is recorded as its own sub-step `{key}:{processed}`, so
    /// incremental snapshots pick up every advance. The cache also keeps the
    /// latest value under `key` for runs sharing it.
    pub async fn write_cursor(&self, step_id: &str, key: &str, processed: u64) {
        let value = json!({ "processed": processed });
        let checkpoint_key = format!("{key}:{processed}");
        if let Some(cache) = &self.cache {
            cache.set(key, Ok(value.clone()), None);
            cache.set(&checkpoint_key, Ok(value.clone()), None);
        }
        let result = StepResult::ok(value);
        self.record(&checkpoint_key, result.clone(), None);
        self.emit(WorkflowEvent::StreamCheckpoint {
            workflow_id: self.workflow_id.clone(),
            step_id: step_id.to_string(),
            step_key: checkpoint_key.clone(),
            processed,
        });
        self.after_step(&checkpoint_key, result).await;
    }

    /// Highest cursor seen in the cache or among recorded checkpoints.
    pub fn read_cursor(&self, key: &str) -> Option<u64> {
        let cached = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get(key))
            .and_then(|entry| entry.ok())
            .and_then(|value| processed_count(&value));
        let prefix = format!("{key}:");
        let recorded = lock(&self.registry)
            .steps()
            .filter(|(k, _)| k.strip_prefix(&prefix).is_some_and(|n| n.parse::<u64>().is_ok()))
            .filter_map(|(_, result)| match result {
                StepResult::Ok { value } => processed_count(value),
                StepResult::Err { .. } => None,
            })
            .max();
        cached.max(recorded)
    }

    /// Raw cached success value at `key`, if any.
    pub fn cached_value(&self, key: &str) -> Option<Value> {
        self.cache.as_ref()?.get(key)?.ok()
    }

    async fn after_step(&self, key: &str, result: StepResult) {
        let Some(hook) = &self.checkpoint else {
            return;
        };
        let snapshot = lock(&self.registry).snapshot(&SnapshotQuery::default());
        if self.lossy == LossyValuePolicy::Strict && !snapshot.warnings.is_empty() {
            tracing::warn!(
                step_key = key,
                "skipping checkpoint: snapshot holds values JSON cannot represent"
            );
            return;
        }
        let checkpoint = StepCheckpoint {
            workflow_id: self.workflow_id.clone(),
            step_key: key.to_string(),
            result,
            snapshot,
        };
        hook.after_step(&checkpoint).await;
    }

    // -----------------------------------------------------------------------
    // Snapshot / completion
    // -----------------------------------------------------------------------

    pub fn snapshot(&self, query: &SnapshotQuery) -> Result<WorkflowSnapshot, SnapshotError> {
        let registry = lock(&self.registry);
        match self.lossy {
            LossyValuePolicy::Strict => registry.strict_snapshot(query),
            _ => Ok(registry.snapshot(query)),
        }
    }

    pub fn lenient_snapshot(&self) -> WorkflowSnapshot {
        lock(&self.registry).snapshot(&SnapshotQuery::default())
    }

    pub fn complete(&self, status: WorkflowStatus) {
        lock(&self.registry).complete(status);
    }

    /// Cause and origin of the step failure that produced `error`, if the
    /// workflow failed with a step's error.
    pub fn failure_details(
        &self,
        error: &WorkflowError<E>,
    ) -> (Option<Cause>, Option<FailureOrigin>) {
        let error_json = Self::error_value(error);
        match lock(&self.last_failure).as_ref() {
            Some(last) if last.error == error_json => (last.cause.clone(), Some(last.origin)),
            _ => (None, Some(FailureOrigin::Result)),
        }
    }
}

fn processed_count(value: &Value) -> Option<u64> {
    value.get("processed").and_then(Value::as_u64)
}

