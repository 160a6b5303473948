//! Lifecycle events emitted during a workflow run.
//!
//! `WorkflowEvent` is the unified event type delivered by the event bus.
//! All variants are Clone + Send + Sync so they can be queued for async
//! subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::step::FailureOrigin;

/// Events emitted by the step executor and the workflow runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// The workflow body started.
    WorkflowStart { workflow_id: String },

    /// The workflow body completed successfully.
    WorkflowSuccess {
        workflow_id: String,
        duration_ms: u64,
    },

    /// The workflow body failed.
    WorkflowError {
        workflow_id: String,
        error: Value,
        duration_ms: u64,
    },

    /// The workflow was cancelled through its signal.
    WorkflowCancelled {
        workflow_id: String,
        reason: Option<String>,
        last_step_key: Option<String>,
    },

    /// A step began executing its operation.
    StepStart {
        workflow_id: String,
        step_id: String,
        step_key: Option<String>,
    },

    /// A step's operation produced a value.
    StepSuccess {
        workflow_id: String,
        step_id: String,
        step_key: Option<String>,
        duration_ms: u64,
    },

    /// A step's operation failed (after retries, if any).
    StepError {
        workflow_id: String,
        step_id: String,
        step_key: Option<String>,
        error: Value,
        origin: FailureOrigin,
        duration_ms: u64,
    },

    /// A keyed step finished and its outcome was recorded.
    StepComplete {
        workflow_id: String,
        step_key: String,
        ok: bool,
        duration_ms: u64,
    },

    /// A failed attempt is about to be retried after `delay_ms`.
    StepRetry {
        workflow_id: String,
        step_id: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error: Value,
    },

    /// All retry attempts failed; the last error propagates.
    StepRetriesExhausted {
        workflow_id: String,
        step_id: String,
        attempts: u32,
        error: Value,
    },

    /// An attempt hit its deadline.
    StepTimeout {
        workflow_id: String,
        step_id: String,
        timeout_ms: u64,
        attempt: u32,
    },

    /// A keyed step was served from cache.
    CacheHit {
        workflow_id: String,
        step_id: String,
        step_key: String,
        ok: bool,
    },

    /// A keyed step was not in cache and will execute.
    CacheMiss {
        workflow_id: String,
        step_id: String,
        step_key: String,
    },

    /// A stream drain recorded its resume cursor.
    StreamCheckpoint {
        workflow_id: String,
        step_id: String,
        step_key: String,
        processed: u64,
    },
}

impl WorkflowEvent {
    /// Terminal events close a run and are never dropped by coalescing subscribers.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::WorkflowSuccess { .. }
                | WorkflowEvent::WorkflowError { .. }
                | WorkflowEvent::WorkflowCancelled { .. }
        )
    }

    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::WorkflowStart { workflow_id }
            | WorkflowEvent::WorkflowSuccess { workflow_id, .. }
            | WorkflowEvent::WorkflowError { workflow_id, .. }
            | WorkflowEvent::WorkflowCancelled { workflow_id, .. }
            | WorkflowEvent::StepStart { workflow_id, .. }
            | WorkflowEvent::StepSuccess { workflow_id, .. }
            | WorkflowEvent::StepError { workflow_id, .. }
            | WorkflowEvent::StepComplete { workflow_id, .. }
            | WorkflowEvent::StepRetry { workflow_id, .. }
            | WorkflowEvent::StepRetriesExhausted { workflow_id, .. }
            | WorkflowEvent::StepTimeout { workflow_id, .. }
            | WorkflowEvent::CacheHit { workflow_id, .. }
            | WorkflowEvent::CacheMiss { workflow_id, .. }
            | WorkflowEvent::StreamCheckpoint { workflow_id, .. } => workflow_id,
        }
    }

    /// Snake-case event name, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStart { .. } => "workflow_start",
            WorkflowEvent::WorkflowSuccess { .. } => "workflow_success",
            WorkflowEvent::WorkflowError { .. } => "workflow_error",
            WorkflowEvent::WorkflowCancelled { .. } => "workflow_cancelled",
            WorkflowEvent::StepStart { .. } => "step_start",
            WorkflowEvent::StepSuccess { .. } => "step_success",
            WorkflowEvent::StepError { .. } => "step_error",
            WorkflowEvent::StepComplete { .. } => "step_complete",
            WorkflowEvent::StepRetry { .. } => "step_retry",
            WorkflowEvent::StepRetriesExhausted { .. } => "step_retries_exhausted",
            WorkflowEvent::StepTimeout { .. } => "step_timeout",
            WorkflowEvent::CacheHit { .. } => "cache_hit",
            WorkflowEvent::CacheMiss { .. } => "cache_miss",
            WorkflowEvent::StreamCheckpoint { .. } => "stream_checkpoint",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_matches_serialized_tag() {
        let event = WorkflowEvent::CacheHit {
            workflow_id: "wf".to_string(),
            step_id: "a".to_string(),
            step_key: "a".to_string(),
            ok: true,
        };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], serde_json::json!(event.name()));
    }

    #[test]
    fn only_workflow_outcomes_are_terminal() {
        let done = WorkflowEvent::WorkflowSuccess {
            workflow_id: "wf".to_string(),
            duration_ms: 3,
        };
        let step = WorkflowEvent::StepStart {
            workflow_id: "wf".to_string(),
            step_id: "a".to_string(),
            step_key: None,
        };
        assert!(done.is_terminal());
        assert!(!step.is_terminal());
        assert_eq!(step.workflow_id(), "wf");
    }
}
