//! Well-known failure shapes raised by the engine itself, and storage errors.
//!
//! The engine-raised shapes (cancellation, timeout, pending approval/hook,
//! rejection, unexpected) are serde types so they can be cached and replayed
//! like any other step failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::step::Cause;

/// The run's cancellation signal fired.
///
/// `last_step_key` is the last *successfully completed* keyed step, used to
/// resume after cancellation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("workflow cancelled{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
pub struct WorkflowCancelledError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step_key: Option<String>,
}

/// A step attempt exceeded its deadline.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("step '{step_name}' timed out after {timeout_ms}ms")]
pub struct StepTimeoutError {
    pub step_name: String,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

/// A step is waiting on a human decision.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("step '{step_key}' is pending approval")]
pub struct PendingApproval {
    pub step_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Inspection data for the approver (for gated steps: `pendingArgs`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A step is waiting on an external callback identified by `hook_id`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("waiting for hook '{hook_id}'")]
pub struct PendingHook {
    pub hook_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A human rejected an approval step.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error(
    "step '{step_key}' was rejected{}",
    .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
)]
pub struct ApprovalRejected {
    pub step_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// An exception no domain error accounts for, as produced by the default mapper.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error(
    "unexpected error{}: {}",
    .step_id.as_deref().map(|s| format!(" in step '{s}'")).unwrap_or_default(),
    .cause.summary()
)]
pub struct UnexpectedError {
    pub cause: Cause,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Thrown by an operation that observed the run's cancellation signal.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("operation aborted{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
pub struct Aborted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Errors from persistence adapters.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors from stream writers, readers and stores.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream {namespace} is closed")]
    Closed { namespace: String },

    #[error("stream {namespace} was already closed")]
    AlreadyClosed { namespace: String },

    #[error("stream {namespace} was aborted: {reason}")]
    Aborted { namespace: String, reason: String },

    #[error("stream read timed out after {0}ms")]
    ReadTimeout(u64),

    #[error("stream store error: {0}")]
    Store(#[from] RepositoryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_display_includes_reason() {
        let err = WorkflowCancelledError {
            reason: Some("user request".to_string()),
            last_step_key: Some("a".to_string()),
        };
        assert_eq!(err.to_string(), "workflow cancelled: user request");

        let bare = WorkflowCancelledError {
            reason: None,
            last_step_key: None,
        };
        assert_eq!(bare.to_string(), "workflow cancelled");
    }

    #[test]
    fn timeout_display() {
        let err = StepTimeoutError {
            step_name: "fetch".to_string(),
            timeout_ms: 250,
            attempt: Some(1),
        };
        assert_eq!(err.to_string(), "step 'fetch' timed out after 250ms");
    }

    #[test]
    fn unexpected_display_names_step() {
        let err = UnexpectedError {
            cause: Cause::thrown("boom"),
            step_id: Some("charge".to_string()),
        };
        assert_eq!(err.to_string(), "unexpected error in step 'charge': boom");
    }

    #[test]
    fn repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn stream_error_wraps_repository_error() {
        let err: StreamError = RepositoryError::Connection.into();
        assert!(err.to_string().contains("database connection error"));
    }
}
