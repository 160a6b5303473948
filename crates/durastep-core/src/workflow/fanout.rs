//! Bounded fan-out over sub-steps: `parallel`, `all` and `map`.
//!
//! Sub-steps run concurrently on the calling task and are keyed individually
//! (`{id}.{name}` for named branches, `{id}[{index}]` for mapped items), so a
//! resumed run re-executes only the branches that did not complete. The
//! first failure wins and the remaining in-flight branches are dropped.

use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use indexmap::IndexMap;

use crate::error::WorkflowError;
use crate::outcome::{DomainError, Fault, StepValue};

use super::options::StepOptions;
use super::step::Step;

/// A named branch for [`Step::parallel`].
pub struct Branch<T, E> {
    name: String,
    op: Box<dyn FnOnce() -> BoxFuture<'static, Result<T, Fault<E>>> + Send>,
}

impl<T, E> Branch<T, E> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T, E> std::fmt::Debug for Branch<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Build a branch from a one-shot operation.
pub fn branch<T, E, R, F, Fut>(name: impl Into<String>, op: F) -> Branch<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Into<Fault<E>> + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, R>> + Send + 'static,
{
    Branch {
        name: name.into(),
        op: Box::new(move || {
            op().map(|r: Result<T, R>| -> Result<T, Fault<E>> { r.map_err(Into::into) })
                .boxed()
        }),
    }
}

/// Options for [`Step::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    /// Maximum items in flight. Zero is treated as one.
    pub concurrency: usize,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

impl<E: DomainError> Step<E> {
    /// Run named branches concurrently; results keep the branch order.
    ///
    /// Branch names must be unique within one call.
    pub async fn parallel<T: StepValue>(
        &self,
        id: &str,
        branches: Vec<Branch<T, E>>,
    ) -> Result<IndexMap<String, T>, WorkflowError<E>> {
        let names: Vec<String> = branches.iter().map(|b| b.name.clone()).collect();
        let mut slots: Vec<Option<T>> =
            std::iter::repeat_with(|| None).take(branches.len()).collect();

        let mut pending = FuturesUnordered::new();
        for (index, branch) in branches.into_iter().enumerate() {
            let sub_id = format!("{id}.{}", branch.name);
            let op = branch.op;
            pending.push(async move {
                let result = self.execute_once(&sub_id, &StepOptions::new(), op).await;
                (index, result)
            });
        }

        while let Some((index, result)) = pending.next().await {
            match result {
                Ok(value) => slots[index] = Some(value),
                Err(e) => {
                    tracing::debug!(
                        step_id = id,
                        branch = %names[index],
                        "parallel branch failed; dropping the rest"
                    );
                    return Err(e);
                }
            }
        }

        let mut results = IndexMap::with_capacity(names.len());
        for (name, slot) in names.into_iter().zip(slots) {
            if let Some(value) = slot {
                results.insert(name, value);
            }
        }
        Ok(results)
    }

    /// Positional form of [`Step::parallel`]: branch `i` is keyed `{id}.{i}`.
    pub async fn all<T, R, F, Fut>(&self, id: &str, ops: Vec<F>) -> Result<Vec<T>, WorkflowError<E>>
    where
        T: StepValue,
        R: Into<Fault<E>> + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, R>> + Send + 'static,
    {
        let branches = ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| branch(i.to_string(), op))
            .collect();
        let results = self.parallel(id, branches).await?;
        Ok(results.into_values().collect())
    }

    /// Apply `f` to every item with at most `options.concurrency` in flight.
    /// Results are returned in input order.
    pub async fn map<I, T, R, F, Fut>(
        &self,
        id: &str,
        items: Vec<I>,
        options: MapOptions,
        f: F,
    ) -> Result<Vec<T>, WorkflowError<E>>
    where
        T: StepValue,
        R: Into<Fault<E>>,
        F: Fn(I, usize) -> Fut,
        Fut: Future<Output = Result<T, R>>,
    {
        let limit = options.concurrency.max(1);
        let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(items.len()).collect();
        let mut items = items.into_iter().enumerate();
        let mut pending = FuturesUnordered::new();

        loop {
            while pending.len() < limit {
                let Some((index, item)) = items.next() else {
                    break;
                };
                let fut = f(item, index);
                let sub_id = format!("{id}[{index}]");
                pending.push(async move {
                    let result = self.execute_once(&sub_id, &StepOptions::new(), move || fut).await;
                    (index, result)
                });
            }
            let Some((index, result)) = pending.next().await else {
                break;
            };
            match result {
                Ok(value) => slots[index] = Some(value),
                Err(e) => {
                    tracing::debug!(step_id = id, index, "map item failed; dropping the rest");
                    return Err(e);
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }
}
