//! Resumable drain of an async source with bounded concurrency.
//!
//! Each checkpoint is recorded as the sub-step `{key}:cursor:{n}` holding
//! `{"processed": n}`, where `n` is the number of leading items known to be
//! fully processed. A resumed drain skips up to the highest checkpoint and
//! continues with the rest.

use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::stream::{FuturesUnordered, Stream, StreamExt};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::outcome::{DomainError, Fault};

use super::context::Classified;
use super::options::StepOptions;
use super::step::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEachOptions {
    /// Items processed concurrently. Zero is treated as one.
    pub concurrency: usize,
    /// Write the cursor every this many completed items (and at the end).
    pub checkpoint_interval: u64,
}

impl Default for StreamEachOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            checkpoint_interval: 1,
        }
    }
}

/// What a finished drain reports; cached under the step key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    /// Items processed by this run.
    pub processed: u64,
    /// Items skipped because an earlier run already processed them.
    pub resumed_from: u64,
}

pub(crate) fn cursor_key(step_key: &str) -> String {
    format!("{step_key}:cursor")
}

impl<E: DomainError> Step<E> {
    /// Process every item of `source` with `f(item, position)`.
    ///
    /// A source error or an item failure fails the step. The cursor keeps
    /// the contiguous prefix that completed, so a later run picks up there.
    pub async fn stream_for_each<I, X, S, R, F, Fut>(
        &self,
        id: &str,
        source: S,
        options: StreamEachOptions,
        f: F,
    ) -> Result<StreamSummary, WorkflowError<E>>
    where
        S: Stream<Item = Result<I, X>>,
        X: std::error::Error + Send + Sync + 'static,
        R: Into<Fault<E>>,
        F: Fn(I, u64) -> Fut,
        Fut: Future<Output = Result<(), R>>,
    {
        self.execute(id, &StepOptions::new(), |key| async move {
            self.drain(id, key.as_deref().map(cursor_key), source, options, f).await
        })
        .await
    }

    async fn drain<I, X, S, R, F, Fut>(
        &self,
        id: &str,
        cursor: Option<String>,
        source: S,
        options: StreamEachOptions,
        f: F,
    ) -> Result<StreamSummary, Classified<E>>
    where
        S: Stream<Item = Result<I, X>>,
        X: std::error::Error + Send + Sync + 'static,
        R: Into<Fault<E>>,
        F: Fn(I, u64) -> Fut,
        Fut: Future<Output = Result<(), R>>,
    {
        let run = &self.run;
        let resumed_from = cursor.as_deref().and_then(|k| run.read_cursor(k)).unwrap_or(0);
        let mut source = std::pin::pin!(source);

        let mut next_position: u64 = 0;
        while next_position < resumed_from {
            match source.next().await {
                Some(_) => next_position += 1,
                None => break,
            }
        }
        if resumed_from > 0 {
            tracing::debug!(step_id = id, resumed_from, "resuming stream drain");
        }

        let limit = options.concurrency.max(1);
        let interval = options.checkpoint_interval.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut finished: BTreeSet<u64> = BTreeSet::new();
        let mut watermark = next_position;
        let mut checkpointed = watermark;
        let mut exhausted = false;

        loop {
            let can_pull = !exhausted && in_flight.len() < limit;
            if !can_pull && in_flight.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                Some((position, caught)) = in_flight.next(), if !in_flight.is_empty() => {
                    run.classify_caught(id, caught)?;
                    finished.insert(position);
                    while finished.remove(&watermark) {
                        watermark += 1;
                    }
                    if watermark - checkpointed >= interval {
                        if let Some(key) = cursor.as_deref() {
                            run.write_cursor(id, key, watermark).await;
                        }
                        checkpointed = watermark;
                    }
                }
                next = source.next(), if can_pull => match next {
                    None => exhausted = true,
                    Some(Err(e)) => return Err(run.classify_fault(id, Fault::thrown(e))),
                    Some(Ok(item)) => {
                        if run.signal.is_cancelled() {
                            return Err(Classified::engine(run.cancelled_error()));
                        }
                        let position = next_position;
                        next_position += 1;
                        let fut = f(item, position);
                        in_flight.push(async move {
                            (position, AssertUnwindSafe(fut).catch_unwind().await)
                        });
                    }
                },
            }
        }

        if watermark > checkpointed {
            if let Some(key) = cursor.as_deref() {
                run.write_cursor(id, key, watermark).await;
            }
        }
        Ok(StreamSummary {
            processed: watermark - resumed_from.min(watermark),
            resumed_from,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures_util::stream;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::event::{EventBus, SubscribeOptions};
    use crate::resume::SnapshotQuery;
    use durastep_types::event::WorkflowEvent;
    use crate::workflow::{RunOptions, Workflow};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum IngestError {
        BadRecord(u32),
    }

    fn numbers(n: u32) -> impl Stream<Item = Result<u32, std::io::Error>> {
        stream::iter((0..n).map(Ok))
    }

    #[tokio::test]
    async fn drains_every_item_and_checkpoints() {
        let bus = EventBus::default();
        let checkpoints = Arc::new(Mutex::new(Vec::new()));
        let sink = checkpoints.clone();
        let _sub = bus.subscribe(
            move |e| {
                if let WorkflowEvent::StreamCheckpoint { processed, .. } = e {
                    sink.lock().unwrap().push(*processed);
                }
            },
            SubscribeOptions::sync(),
        );
        let wf = Workflow::<IngestError>::builder("ingest").events(bus).build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        let run = wf
            .run(|step| async move {
                step.stream_for_each(
                    "drain",
                    numbers(5),
                    StreamEachOptions {
                        concurrency: 2,
                        checkpoint_interval: 2,
                    },
                    move |item, _| {
                        let log = log.clone();
                        async move {
                            log.lock().unwrap().push(item);
                            Ok::<_, IngestError>(())
                        }
                    },
                )
                .await
            })
            .await;

        assert_eq!(
            run.result.unwrap(),
            StreamSummary {
                processed: 5,
                resumed_from: 0
            }
        );
        let mut items = seen.lock().unwrap().clone();
        items.sort_unstable();
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
        assert_eq!(checkpoints.lock().unwrap().last(), Some(&5));
    }

    #[tokio::test]
    async fn failed_drain_resumes_after_last_processed_item() {
        let wf = Workflow::<IngestError>::builder("ingest").build();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let body = |seen: Arc<Mutex<Vec<u32>>>, poison: Option<u32>| {
            move |step: Step<IngestError>| async move {
                let options = StreamEachOptions::default();
                step.stream_for_each("drain", numbers(6), options, move |item, position| {
                    let seen = seen.clone();
                    async move {
                        assert_eq!(u64::from(item), position);
                        if Some(item) == poison {
                            return Err(IngestError::BadRecord(item));
                        }
                        seen.lock().unwrap().push(item);
                        Ok(())
                    }
                })
                .await
            }
        };

        let first = wf.run(body(seen.clone(), Some(3))).await;
        assert_eq!(first.result.as_ref().unwrap_err().domain(), Some(&IngestError::BadRecord(3)));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

        let mut state = first.resume_state();
        assert!(state.contains("drain:cursor:3"));
        state.clear_step("drain");
        seen.lock().unwrap().clear();

        let second = wf
            .run_with(RunOptions::new().resume(state), body(seen.clone(), None))
            .await
            .unwrap();
        assert_eq!(
            second.result.unwrap(),
            StreamSummary {
                processed: 3,
                resumed_from: 3
            }
        );
        assert_eq!(*seen.lock().unwrap(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn source_error_fails_the_drain() {
        let wf = Workflow::<IngestError>::builder("ingest").build();
        let run = wf
            .run(|step| async move {
                let reset = std::io::Error::other("connection reset");
                let source = stream::iter(vec![Ok(1u32), Err(reset)]);
                step.stream_for_each("drain", source, StreamEachOptions::default(), |_, _| async {
                    Ok::<_, IngestError>(())
                })
                .await
            })
            .await;
        assert!(matches!(run.result, Err(WorkflowError::Unexpected(_))));
        assert_eq!(run.failure_origin, Some(durastep_types::step::FailureOrigin::Throw));
    }

    #[tokio::test]
    async fn incremental_snapshot_sees_every_cursor_advance() {
        let wf = Workflow::<IngestError>::builder("ingest").build();
        let run = wf
            .run(|step| async move {
                let since = Arc::new(Mutex::new(None::<String>));
                let observer = step.clone();
                let mark = since.clone();
                let options = StreamEachOptions::default();
                step.stream_for_each("drain", numbers(4), options, move |_, position| {
                    if position == 2 {
                        let snapshot = observer.snapshot(&SnapshotQuery::default()).unwrap();
                        *mark.lock().unwrap() = snapshot.execution.current_step_id;
                    }
                    async { Ok::<_, IngestError>(()) }
                })
                .await?;

                let since = since.lock().unwrap().clone().unwrap();
                let later = step.snapshot(&SnapshotQuery::default().since(since.clone())).unwrap();
                Ok((since, later.steps.keys().cloned().collect::<Vec<_>>()))
            })
            .await;

        let (since, keys) = run.result.unwrap();
        assert_eq!(since, "drain:cursor:2");
        assert_eq!(keys, vec!["drain:cursor:3", "drain:cursor:4", "drain"]);
    }
}
