//! The step handle passed to a workflow body.
//!
//! Every step goes through the same pipeline:
//! 1. Refuse to start once the run is cancelled.
//! 2. Serve keyed steps from the cache when an entry exists.
//! 3. Otherwise run the attempts (retry + per-attempt timeout).
//! 4. Record the outcome: cache write, registry, events, checkpoint hook.
//!
//! Operation futures must be `Send + 'static` because attempts with a
//! timeout run on their own task, which may outlive the step. Use `move`
//! closures that clone what they need.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use durastep_types::error::StepTimeoutError;
use durastep_types::event::WorkflowEvent;
use durastep_types::snapshot::WorkflowSnapshot;
use durastep_types::step::{Cause, FailureOrigin};

use crate::cancel::CancelSignal;
use crate::detached::DetachedTasks;
use crate::error::{SnapshotError, WorkflowError};
use crate::outcome::{DomainError, Fault, StepValue, thrown_cause};
use crate::resume::SnapshotQuery;

use super::context::{Caught, Classified, RunContext};
use super::options::StepOptions;
use super::retry::RetryOptions;
use super::timeout::{OnTimeout, TimeoutOptions};

/// Handle for running steps inside one workflow run. Cheap to clone.
pub struct Step<E> {
    pub(crate) run: Arc<RunContext<E>>,
}

impl<E> Clone for Step<E> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
        }
    }
}

enum Race<O> {
    Done(O),
    TimedOut(StepTimeoutError),
    Cancelled,
    Lost(Cause),
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl<E: DomainError> Step<E> {
    pub(crate) fn new(run: Arc<RunContext<E>>) -> Self {
        Self { run }
    }

    pub fn workflow_id(&self) -> &str {
        &self.run.workflow_id
    }

    /// The run's cancellation signal. Long operations should observe it and
    /// fail with `Aborted` when it fires.
    pub fn signal(&self) -> &CancelSignal {
        &self.run.signal
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.signal.is_cancelled()
    }

    /// Last keyed step that completed successfully in this run.
    pub fn last_step_key(&self) -> Option<String> {
        self.run.last_step_key()
    }

    /// Value written to the named output slot by a step's `out` option.
    pub fn output<T: DeserializeOwned>(&self, slot: &str) -> Option<T> {
        self.run
            .output(slot)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Snapshot of the steps recorded so far. Fails under the strict lossy
    /// policy when any recorded value is not JSON-safe.
    pub fn snapshot(&self, query: &SnapshotQuery) -> Result<WorkflowSnapshot, SnapshotError> {
        self.run.snapshot(query)
    }

    /// Tasks left running by disconnect timeouts.
    pub fn detached(&self) -> &DetachedTasks {
        &self.run.detached
    }

    // -----------------------------------------------------------------------
    // Step operations
    // -----------------------------------------------------------------------

    /// Run a step with default options (keyed by `id`).
    pub async fn run<T, R, F, Fut>(&self, id: &str, op: F) -> Result<T, WorkflowError<E>>
    where
        T: StepValue,
        R: Into<Fault<E>> + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, R>> + Send + 'static,
    {
        self.run_with(id, op, StepOptions::new()).await
    }

    pub async fn run_with<T, R, F, Fut>(
        &self,
        id: &str,
        mut op: F,
        options: StepOptions<E>,
    ) -> Result<T, WorkflowError<E>>
    where
        T: StepValue,
        R: Into<Fault<E>> + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, R>> + Send + 'static,
    {
        let retry = options.retry.clone();
        let timeout = options.timeout.clone();
        self.execute(id, &options, |_| async move {
            self.attempts(
                id,
                move || AssertUnwindSafe(op()).catch_unwind(),
                |caught: Caught<T, R>| self.run.classify_caught(id, caught),
                retry.as_ref(),
                timeout.as_ref(),
                |info, policy| Err(self.run.classify_timeout(info, policy)),
            )
            .await
        })
        .await
    }

    /// Run an operation whose errors are foreign; `on_error` maps them into
    /// the domain. Mapped failures keep origin `throw`.
    pub async fn try_run<T, X, F, Fut, M>(
        &self,
        id: &str,
        mut op: F,
        on_error: M,
        options: StepOptions<E>,
    ) -> Result<T, WorkflowError<E>>
    where
        T: StepValue,
        X: Into<anyhow::Error> + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, X>> + Send + 'static,
        M: Fn(&anyhow::Error) -> E,
    {
        let retry = options.retry.clone();
        let timeout = options.timeout.clone();
        let mapped = |err: anyhow::Error| Classified {
            error: WorkflowError::Domain(on_error(&err)),
            cause: Some(thrown_cause(&err)),
            origin: FailureOrigin::Throw,
        };
        self.execute(id, &options, |_| async move {
            self.attempts(
                id,
                move || AssertUnwindSafe(op()).catch_unwind(),
                |caught: Caught<T, X>| match caught {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(x)) => Err(mapped(x.into())),
                    Err(payload) => {
                        let cause = crate::outcome::panic_cause(payload.as_ref());
                        Err(mapped(anyhow::anyhow!(cause.summary())))
                    }
                },
                retry.as_ref(),
                timeout.as_ref(),
                |info, policy| Err(self.run.classify_timeout(info, policy)),
            )
            .await
        })
        .await
    }

    /// Run an operation returning a foreign typed failure; `map` turns it into
    /// the domain error and the original failure becomes the cause.
    pub async fn from_result<T, X, F, Fut, M>(
        &self,
        id: &str,
        mut op: F,
        map: M,
        options: StepOptions<E>,
    ) -> Result<T, WorkflowError<E>>
    where
        T: StepValue,
        X: Serialize + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, X>> + Send + 'static,
        M: Fn(X) -> E,
    {
        let retry = options.retry.clone();
        let timeout = options.timeout.clone();
        self.execute(id, &options, |_| async move {
            self.attempts(
                id,
                move || AssertUnwindSafe(op()).catch_unwind(),
                |caught: Caught<T, X>| match caught {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(failure)) => {
                        let cause = serde_json::to_value(&failure).ok().map(Cause::domain);
                        Err(Classified {
                            error: WorkflowError::Domain(map(failure)),
                            cause,
                            origin: FailureOrigin::Result,
                        })
                    }
                    Err(payload) => Err(self.run.classify_panic(id, payload.as_ref())),
                },
                retry.as_ref(),
                timeout.as_ref(),
                |info, policy| Err(self.run.classify_timeout(info, policy)),
            )
            .await
        })
        .await
    }

    /// Durable sleep. Keyed sleeps that already elapsed are not repeated on
    /// resume. Cancellation ends the sleep early.
    pub async fn sleep(
        &self,
        id: &str,
        duration: Duration,
        options: StepOptions<E>,
    ) -> Result<(), WorkflowError<E>> {
        self.execute(id, &options, |_| async move {
            tokio::select! {
                biased;
                _ = self.run.signal.cancelled() => {
                    Err(Classified::engine(self.run.cancelled_error()))
                }
                _ = tokio::time::sleep(duration) => Ok(()),
            }
        })
        .await
    }

    /// Like [`Step::run_with`] with a deadline, but a timeout yields
    /// `Ok(None)` instead of failing. Never retried.
    pub async fn with_timeout_option<T, R, F, Fut>(
        &self,
        id: &str,
        mut op: F,
        duration: Duration,
        options: StepOptions<E>,
    ) -> Result<Option<T>, WorkflowError<E>>
    where
        T: StepValue,
        R: Into<Fault<E>> + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, R>> + Send + 'static,
    {
        let deadline = TimeoutOptions::error(duration);
        self.execute(id, &options, |_| async move {
            self.attempts(
                id,
                move || AssertUnwindSafe(op()).catch_unwind(),
                |caught: Caught<T, R>| self.run.classify_caught(id, caught).map(Some),
                None,
                Some(&deadline),
                |_, _| Ok(None),
            )
            .await
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    /// Cache lookup, body execution and outcome recording for one step.
    ///
    /// `body` receives the resolved step key.
    pub(crate) async fn execute<T, B, BF>(
        &self,
        id: &str,
        options: &StepOptions<E>,
        body: B,
    ) -> Result<T, WorkflowError<E>>
    where
        T: StepValue,
        B: FnOnce(Option<String>) -> BF,
        BF: Future<Output = Result<T, Classified<E>>>,
    {
        let run = &self.run;
        if run.signal.is_cancelled() {
            tracing::debug!(step_id = id, "not starting step: workflow cancelled");
            return Err(run.cancelled_error());
        }

        let key = options.resolve_key(id);
        if let (Some(cache), Some(key)) = (run.cache.as_ref(), key.as_deref()) {
            match cache.get(key) {
                Some(entry) => {
                    run.emit(WorkflowEvent::CacheHit {
                        workflow_id: run.workflow_id.clone(),
                        step_id: id.to_string(),
                        step_key: key.to_string(),
                        ok: entry.is_ok(),
                    });
                    tracing::debug!(step_id = id, step_key = key, "step served from cache");
                    return run.replay(id, key, entry, options.out.as_deref());
                }
                None => run.emit(WorkflowEvent::CacheMiss {
                    workflow_id: run.workflow_id.clone(),
                    step_id: id.to_string(),
                    step_key: key.to_string(),
                }),
            }
        }

        run.emit(WorkflowEvent::StepStart {
            workflow_id: run.workflow_id.clone(),
            step_id: id.to_string(),
            step_key: key.clone(),
        });
        let started = Instant::now();
        let outcome = body(key.clone()).await;
        let took = elapsed_ms(started);

        match outcome {
            Ok(value) => {
                let out = options.out.as_deref();
                run.complete_success(id, key.as_deref(), &value, options.ttl, out, took)
                    .await;
                Ok(value)
            }
            Err(failure) => {
                Err(run.complete_failure(id, key.as_deref(), failure, options.ttl, took).await)
            }
        }
    }

    /// Single attempt of a one-shot operation, without retry or deadline.
    pub(crate) async fn execute_once<T, R, F, Fut>(
        &self,
        id: &str,
        options: &StepOptions<E>,
        op: F,
    ) -> Result<T, WorkflowError<E>>
    where
        T: StepValue,
        R: Into<Fault<E>>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, R>>,
    {
        self.execute(id, options, |_| async move {
            let caught = AssertUnwindSafe(async move { op().await }).catch_unwind().await;
            self.run.classify_caught(id, caught)
        })
        .await
    }

    /// Retry loop around `make`, each attempt raced against the deadline.
    async fn attempts<T, O, F, Fut, C, D>(
        &self,
        step_id: &str,
        mut make: F,
        classify: C,
        retry: Option<&RetryOptions<E>>,
        timeout: Option<&TimeoutOptions<E>>,
        on_deadline: D,
    ) -> Result<T, Classified<E>>
    where
        O: Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = O> + Send + 'static,
        C: Fn(O) -> Result<T, Classified<E>>,
        D: Fn(StepTimeoutError, &OnTimeout<E>) -> Result<T, Classified<E>>,
    {
        let run = &self.run;
        let max_attempts = retry.map_or(1, RetryOptions::max_attempts);
        let mut attempt: u32 = 1;
        loop {
            let outcome = match timeout {
                None => classify(make().await),
                Some(deadline) => match self.race(step_id, attempt, make(), deadline).await {
                    Race::Done(output) => classify(output),
                    Race::TimedOut(info) => {
                        run.emit(WorkflowEvent::StepTimeout {
                            workflow_id: run.workflow_id.clone(),
                            step_id: step_id.to_string(),
                            timeout_ms: info.timeout_ms,
                            attempt,
                        });
                        tracing::debug!(
                            step_id,
                            attempt,
                            timeout_ms = info.timeout_ms,
                            "step attempt timed out"
                        );
                        on_deadline(info, &deadline.on_timeout)
                    }
                    Race::Cancelled => Err(Classified::engine(run.cancelled_error())),
                    Race::Lost(cause) => Err(Classified {
                        error: run.map_unexpected(Some(step_id), cause.clone(), None),
                        cause: Some(cause),
                        origin: FailureOrigin::Throw,
                    }),
                },
            };

            let failure = match outcome {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };
            let Some(retry) = retry else {
                return Err(failure);
            };
            if !retry.should_retry(&failure.error, attempt) {
                if attempt >= max_attempts && max_attempts > 1 {
                    run.emit(WorkflowEvent::StepRetriesExhausted {
                        workflow_id: run.workflow_id.clone(),
                        step_id: step_id.to_string(),
                        attempts: attempt,
                        error: serde_json::to_value(&failure.error).unwrap_or_default(),
                    });
                    tracing::warn!(
                        step_id,
                        attempts = attempt,
                        error = %failure.error,
                        "step retries exhausted"
                    );
                }
                return Err(failure);
            }

            let delay = retry.delay_for(attempt);
            retry.notify_retry(&failure.error, attempt, delay);
            run.emit(WorkflowEvent::StepRetry {
                workflow_id: run.workflow_id.clone(),
                step_id: step_id.to_string(),
                attempt,
                max_attempts,
                delay_ms: duration_ms(delay),
                error: serde_json::to_value(&failure.error).unwrap_or_default(),
            });
            tracing::debug!(step_id, attempt, delay_ms = duration_ms(delay), "retrying step");

            tokio::select! {
                biased;
                _ = run.signal.cancelled() => return Err(Classified::engine(run.cancelled_error())),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Race one attempt against its deadline and the cancellation signal.
    async fn race<O, Fut>(
        &self,
        step_id: &str,
        attempt: u32,
        fut: Fut,
        timeout: &TimeoutOptions<E>,
    ) -> Race<O>
    where
        O: Send + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        let run = &self.run;
        let info = StepTimeoutError {
            step_name: step_id.to_string(),
            timeout_ms: timeout.millis(),
            attempt: Some(attempt),
        };
        let deadline = tokio::time::sleep(timeout.duration);

        // Cancellation is cooperative: the attempt keeps running detached.
        let mut handle = tokio::spawn(fut);
        tokio::select! {
            biased;
            joined = &mut handle => match joined {
                Ok(output) => Race::Done(output),
                Err(e) => Race::Lost(Cause::from_error(&e)),
            },
            _ = deadline => {
                match &timeout.on_timeout {
                    OnTimeout::Disconnect => run.detached.adopt(step_id, handle),
                    // A retried attempt never overlaps the one that timed out.
                    OnTimeout::Error | OnTimeout::Custom(_) => handle.abort(),
                }
                Race::TimedOut(info)
            }
            _ = run.signal.cancelled() => {
                run.detached.adopt(step_id, handle);
                Race::Cancelled
            }
        }
    }
}
