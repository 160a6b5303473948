//! Durable workflow execution for async Rust.
//!
//! A workflow body runs steps through a [`Step`] handle. Keyed steps are
//! memoized in a [`StepCache`], recorded in a snapshot-able registry and
//! replayed on resume, so a re-run only executes what did not complete.
//!
//! This crate defines the engine and the storage "ports" (repository traits)
//! that the infrastructure layer implements. It depends only on
//! `durastep-types` -- never on `durastep-infra` or any database crate.

pub mod cache;
pub mod cancel;
pub mod detached;
pub mod error;
pub mod event;
pub mod hitl;
pub mod outcome;
pub mod repository;
pub mod resume;
pub mod stream;
pub mod workflow;

pub use cache::{InMemoryStepCache, StepCache};
pub use cancel::CancelSignal;
pub use error::{SnapshotError, WorkflowError};
pub use event::EventBus;
pub use hitl::{ApprovalGate, ApprovalStatus, approval_key};
pub use outcome::{DomainError, Failure, Fault, Outcome, StepValue};
pub use resume::{ResumeState, SnapshotQuery};
pub use workflow::{
    RetryOptions, RunOptions, Step, StepOptions, TimeoutOptions, Workflow, WorkflowRun,
};
