//! Error types surfaced by the engine.
//!
//! [`WorkflowError`] is the closed union a step (and a whole workflow) fails
//! with: the author's domain errors plus the engine's well-known shapes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use durastep_types::error::{
    ApprovalRejected, PendingApproval, PendingHook, StepTimeoutError, UnexpectedError,
    WorkflowCancelledError,
};

/// Failure of a step or a workflow run.
///
/// Serialized externally tagged (`{"domain": ...}`, `{"cancelled": ...}`) so
/// cached failures replay into the same variant.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowError<E> {
    #[error("step failed: {0:?}")]
    Domain(E),

    #[error(transparent)]
    Cancelled(WorkflowCancelledError),

    #[error(transparent)]
    Timeout(StepTimeoutError),

    #[error(transparent)]
    PendingApproval(PendingApproval),

    #[error(transparent)]
    PendingHook(PendingHook),

    #[error(transparent)]
    ApprovalRejected(ApprovalRejected),

    #[error(transparent)]
    Unexpected(UnexpectedError),
}

impl<E> WorkflowError<E> {
    pub fn domain(&self) -> Option<&E> {
        match self {
            WorkflowError::Domain(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkflowError::Cancelled(_))
    }

    /// Pending approval or pending hook: the run is parked, not broken.
    pub fn is_suspension(&self) -> bool {
        matches!(
            self,
            WorkflowError::PendingApproval(_) | WorkflowError::PendingHook(_)
        )
    }
}

impl<E> From<E> for WorkflowError<E> {
    fn from(error: E) -> Self {
        WorkflowError::Domain(error)
    }
}

/// True when a serialized [`WorkflowError`] is a suspension.
///
/// Restore works on untyped JSON and uses this to skip parked steps.
pub fn is_suspension_value(error: &Value) -> bool {
    error
        .as_object()
        .is_some_and(|o| o.contains_key("pending_approval") || o.contains_key("pending_hook"))
}

/// Maps an unexpected (thrown) failure into the author's domain error type.
pub type UnexpectedMapper<E> = Arc<dyn Fn(&UnexpectedError) -> E + Send + Sync>;

// ---------------------------------------------------------------------------
// SnapshotError
// ---------------------------------------------------------------------------

/// Errors from capturing, serializing or restoring workflow state.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("unsupported snapshot format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error(
        "workflow definition changed since the snapshot (snapshot {snapshot}, current {current})"
    )]
    DefinitionDrift { snapshot: String, current: String },

    #[error("step '{step_id}' holds a value JSON cannot represent at '{path}': {reason}")]
    LossyValue {
        step_id: String,
        path: String,
        reason: String,
    },

    #[error("failed to decode step '{key}': {reason}")]
    Decode { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
