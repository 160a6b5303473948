//! Human-in-the-loop steps.
//!
//! A step that needs a human (or an external callback) fails with a
//! *suspension* error: `PendingApproval` or `PendingHook`. Suspensions are
//! recorded in the registry but never cached, so a resumed run re-checks
//! them. The decision is delivered by injecting a value into resume state:
//! - approval steps: at the step key, the approved value
//! - gated steps: at [`approval_key`] of the step key, the approved arguments
//! - hook waits: at the step key, the hook's payload

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Either, ready};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use durastep_types::error::{ApprovalRejected, PendingApproval, PendingHook};

use crate::error::WorkflowError;
use crate::outcome::{DomainError, Fault, StepValue};
use crate::workflow::options::StepOptions;
use crate::workflow::step::Step;

/// Where a gated step looks for its approved arguments.
pub fn approval_key(step_key: &str) -> String {
    format!("{step_key}:approval")
}

/// What an approval check reports.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalStatus<T> {
    Pending { reason: Option<String> },
    Approved(T),
    Rejected { reason: Option<String> },
}

/// Turn an approval check into a step operation.
///
/// `Pending` suspends the step, `Rejected` fails it with `ApprovalRejected`.
pub fn approval_step<T, E, F, Fut>(
    step_key: impl Into<String>,
    mut check: F,
) -> impl FnMut() -> BoxFuture<'static, Result<T, Fault<E>>>
where
    T: Send + 'static,
    E: Send + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ApprovalStatus<T>, E>> + Send + 'static,
{
    let step_key = step_key.into();
    move || {
        let step_key = step_key.clone();
        let status = check();
        async move {
            match status.await {
                Ok(ApprovalStatus::Approved(value)) => Ok(value),
                Ok(ApprovalStatus::Pending { reason }) => {
                    Err(Fault::PendingApproval(PendingApproval {
                        step_key,
                        reason,
                        metadata: None,
                    }))
                }
                Ok(ApprovalStatus::Rejected { reason }) => {
                    Err(Fault::Rejected(ApprovalRejected { step_key, reason }))
                }
                Err(e) => Err(Fault::returned(e)),
            }
        }
        .boxed()
    }
}

/// Decides which calls of a gated step need a human decision.
pub struct ApprovalGate<A> {
    requires_approval: Arc<dyn Fn(&A) -> bool + Send + Sync>,
    reason: Option<String>,
}

impl<A> ApprovalGate<A> {
    /// Every call needs approval.
    pub fn always() -> Self {
        Self::when(|_| true)
    }

    /// Calls for which `predicate` holds need approval.
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&A) -> bool + Send + Sync + 'static,
    {
        Self {
            requires_approval: Arc::new(predicate),
            reason: None,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn requires_approval(&self, args: &A) -> bool {
        (self.requires_approval)(args)
    }
}

impl<A> Clone for ApprovalGate<A> {
    fn clone(&self) -> Self {
        Self {
            requires_approval: self.requires_approval.clone(),
            reason: self.reason.clone(),
        }
    }
}

impl<A> std::fmt::Debug for ApprovalGate<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl<E: DomainError> Step<E> {
    /// Run an approval check as a step.
    pub async fn approval<T, F, Fut>(
        &self,
        id: &str,
        check: F,
        options: StepOptions<E>,
    ) -> Result<T, WorkflowError<E>>
    where
        T: StepValue,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ApprovalStatus<T>, E>> + Send + 'static,
    {
        let step_key = options.resolve_key(id).unwrap_or_else(|| id.to_string());
        self.run_with(id, approval_step(step_key, check), options).await
    }

    /// Suspend until an external callback identified by `hook_id` delivers a
    /// value for this step.
    pub async fn wait_for_hook<T: StepValue>(
        &self,
        id: &str,
        hook_id: &str,
        options: StepOptions<E>,
    ) -> Result<T, WorkflowError<E>> {
        let pending = PendingHook {
            hook_id: hook_id.to_string(),
            step_key: options.resolve_key(id),
            metadata: None,
        };
        self.run_with(
            id,
            move || ready(Err::<T, Fault<E>>(Fault::PendingHook(pending.clone()))),
            options,
        )
        .await
    }

    /// Run `op(args)`, but only once approved when the gate requires it.
    ///
    /// Without an approval the step suspends with the arguments under
    /// `pendingArgs`. The approver may inject modified arguments.
    pub async fn gated<A, T, R, F, Fut>(
        &self,
        id: &str,
        args: A,
        gate: &ApprovalGate<A>,
        mut op: F,
        options: StepOptions<E>,
    ) -> Result<T, WorkflowError<E>>
    where
        A: Serialize + DeserializeOwned + Clone + Send + 'static,
        T: StepValue,
        R: Into<Fault<E>> + Send + 'static,
        F: FnMut(A) -> Fut,
        Fut: Future<Output = Result<T, R>> + Send + 'static,
    {
        let step_key = options.resolve_key(id).unwrap_or_else(|| id.to_string());
        let approved = if gate.requires_approval(&args) {
            self.run
                .cached_value(&approval_key(&step_key))
                .and_then(|value| match serde_json::from_value::<A>(value) {
                    Ok(approved) => Some(approved),
                    Err(e) => {
                        tracing::warn!(
                            step_key = %step_key,
                            error = %e,
                            "ignoring undecodable approval"
                        );
                        None
                    }
                })
        } else {
            Some(args.clone())
        };
        let pending = PendingApproval {
            step_key,
            reason: gate.reason.clone(),
            metadata: Some(json!({
                "pendingArgs": serde_json::to_value(&args).unwrap_or_default()
            })),
        };

        self.run_with(
            id,
            move || match approved.clone() {
                Some(args) => Either::Left(op(args).map(
                    |r: Result<T, R>| -> Result<T, Fault<E>> { r.map_err(Into::into) },
                )),
                None => Either::Right(ready(Err(Fault::PendingApproval(pending.clone())))),
            },
            options,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStepCache;
    use crate::resume::ResumeState;
    use crate::workflow::{RunOptions, Workflow};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum PayError {
        Declined,
    }

    #[test]
    fn approval_key_suffix() {
        assert_eq!(approval_key("transfer"), "transfer:approval");
    }

    #[tokio::test]
    async fn pending_approval_then_injected_decision() {
        let wf = Workflow::<PayError>::builder("approve").build();

        let first = wf
            .run(|step| async move {
                step.approval(
                    "manager",
                    || async {
                        Ok::<_, PayError>(ApprovalStatus::<String>::Pending {
                            reason: Some("waiting".into()),
                        })
                    },
                    StepOptions::new(),
                )
                .await
            })
            .await;
        match &first.result {
            Err(WorkflowError::PendingApproval(p)) => {
                assert_eq!(p.step_key, "manager");
                assert_eq!(p.reason.as_deref(), Some("waiting"));
            }
            other => panic!("expected pending approval, got {other:?}"),
        }
        // Parked steps are not carried into resume state.
        let mut state = first.resume_state();
        assert!(!state.contains("manager"));

        state.inject_approval("manager", "alice").unwrap();
        let second = wf
            .run_with(RunOptions::new().resume(state), |step| async move {
                step.approval(
                    "manager",
                    || async {
                        Ok::<_, PayError>(ApprovalStatus::<String>::Pending { reason: None })
                    },
                    StepOptions::new(),
                )
                .await
            })
            .await
            .unwrap();
        assert_eq!(second.result.unwrap(), "alice");
    }

    #[tokio::test]
    async fn rejected_approval_fails_step() {
        let wf = Workflow::<PayError>::builder("reject").cache(InMemoryStepCache::new()).build();
        let run = wf
            .run(|step| async move {
                step.approval(
                    "review",
                    || async {
                        Ok::<_, PayError>(ApprovalStatus::<u32>::Rejected {
                            reason: Some("no".into()),
                        })
                    },
                    StepOptions::new(),
                )
                .await
            })
            .await;
        assert!(matches!(
            run.result,
            Err(WorkflowError::ApprovalRejected(ref r)) if r.reason.as_deref() == Some("no")
        ));
    }

    #[tokio::test]
    async fn gated_step_suspends_until_args_are_approved() {
        let gate = ApprovalGate::when(|amount: &u64| *amount > 100).reason("large transfer");
        let wf = Workflow::<PayError>::builder("gated").build();

        let small = wf
            .run(|step| {
                let gate = gate.clone();
                async move {
                    let double = |amount: u64| async move { Ok::<_, PayError>(amount * 2) };
                    step.gated("pay", 50u64, &gate, double, StepOptions::new()).await
                }
            })
            .await;
        assert_eq!(small.result.unwrap(), 100);

        let large = wf
            .run(|step| {
                let gate = gate.clone();
                async move {
                    let double = |amount: u64| async move { Ok::<_, PayError>(amount * 2) };
                    step.gated("pay", 500u64, &gate, double, StepOptions::new()).await
                }
            })
            .await;
        let pending = match &large.result {
            Err(WorkflowError::PendingApproval(p)) => p.clone(),
            other => panic!("expected pending approval, got {other:?}"),
        };
        assert_eq!(pending.metadata.unwrap()["pendingArgs"], serde_json::json!(500));

        // The approver lowers the amount.
        let mut state = ResumeState::new();
        state.inject_approval(approval_key("pay"), &300u64).unwrap();
        let resumed = wf
            .run_with(RunOptions::new().resume(state), |step| {
                let gate = gate.clone();
                async move {
                    let double = |amount: u64| async move { Ok::<_, PayError>(amount * 2) };
                    step.gated("pay", 500u64, &gate, double, StepOptions::new()).await
                }
            })
            .await
            .unwrap();
        assert_eq!(resumed.result.unwrap(), 600);
    }

    #[tokio::test]
    async fn hook_wait_resumes_with_payload() {
        let wf = Workflow::<PayError>::builder("hook").build();
        let parked = wf
            .run(|step| async move {
                step.wait_for_hook::<String>("callback", "hook-1", StepOptions::new()).await
            })
            .await;
        assert!(matches!(
            parked.result,
            Err(WorkflowError::PendingHook(ref h)) if h.hook_id == "hook-1"
        ));

        let mut state = parked.resume_state();
        state.inject_approval("callback", "payload").unwrap();
        let resumed = wf
            .run_with(RunOptions::new().resume(state), |step| async move {
                step.wait_for_hook::<String>("callback", "hook-1", StepOptions::new()).await
            })
            .await
            .unwrap();
        assert_eq!(resumed.result.unwrap(), "payload");
    }
}
