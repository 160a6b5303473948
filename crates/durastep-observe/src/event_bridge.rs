//! Workflow events as tracing events.
//!
//! [`bridge_events`] subscribes to an [`EventBus`] with synchronous delivery
//! and re-emits every [`WorkflowEvent`] under the `durastep::events` target
//! with stable dotted attribute names (`workflow.id`, `step.id`, `step.key`,
//! ...), so any tracing subscriber or OpenTelemetry pipeline picks them up.

use durastep_core::event::{EventBus, SubscribeOptions, Subscription};
use durastep_types::event::WorkflowEvent;

/// Forward every event on `bus` to tracing until the subscription drops.
pub fn bridge_events(bus: &EventBus) -> Subscription {
    bus.subscribe(log_event, SubscribeOptions::sync())
}

/// Emit one workflow event as a tracing event.
///
/// Run boundaries log at `info`, failures and timeouts at `warn`, step
/// traffic at `debug`.
pub fn log_event(event: &WorkflowEvent) {
    let kind = event.name();
    match event {
        WorkflowEvent::WorkflowStart { workflow_id } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::INFO,
                event.kind = kind,
                workflow.id = %workflow_id,
                "workflow started"
            );
        }
        WorkflowEvent::WorkflowSuccess { workflow_id, duration_ms } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::INFO,
                event.kind = kind,
                workflow.id = %workflow_id,
                duration_ms,
                "workflow succeeded"
            );
        }
        WorkflowEvent::WorkflowError {
            workflow_id,
            error,
            duration_ms,
        } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::WARN,
                event.kind = kind,
                workflow.id = %workflow_id,
                error = %error,
                duration_ms,
                "workflow failed"
            );
        }
        WorkflowEvent::WorkflowCancelled {
            workflow_id,
            reason,
            last_step_key,
        } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::WARN,
                event.kind = kind,
                workflow.id = %workflow_id,
                reason = reason.as_deref().unwrap_or(""),
                step.key = last_step_key.as_deref().unwrap_or(""),
                "workflow cancelled"
            );
        }
        WorkflowEvent::StepStart {
            workflow_id,
            step_id,
            step_key,
        } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::DEBUG,
                event.kind = kind,
                workflow.id = %workflow_id,
                step.id = %step_id,
                step.key = step_key.as_deref().unwrap_or(""),
                "step started"
            );
        }
        WorkflowEvent::StepSuccess {
            workflow_id,
            step_id,
            step_key,
            duration_ms,
        } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::DEBUG,
                event.kind = kind,
                workflow.id = %workflow_id,
                step.id = %step_id,
                step.key = step_key.as_deref().unwrap_or(""),
                duration_ms,
                "step succeeded"
            );
        }
        WorkflowEvent::StepError {
            workflow_id,
            step_id,
            step_key,
            error,
            origin,
            duration_ms,
        } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::WARN,
                event.kind = kind,
                workflow.id = %workflow_id,
                step.id = %step_id,
                step.key = step_key.as_deref().unwrap_or(""),
                step.origin = ?origin,
                error = %error,
                duration_ms,
                "step failed"
            );
        }
        WorkflowEvent::StepComplete {
            workflow_id,
            step_key,
            ok,
            duration_ms,
        } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::DEBUG,
                event.kind = kind,
                workflow.id = %workflow_id,
                step.key = %step_key,
                step.ok = ok,
                duration_ms,
                "step recorded"
            );
        }
        WorkflowEvent::StepRetry {
            workflow_id,
            step_id,
            attempt,
            max_attempts,
            delay_ms,
            error,
        } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::INFO,
                event.kind = kind,
                workflow.id = %workflow_id,
                step.id = %step_id,
                retry.attempt = attempt,
                retry.max_attempts = max_attempts,
                retry.delay_ms = delay_ms,
                error = %error,
                "retrying step"
            );
        }
        WorkflowEvent::StepRetriesExhausted {
            workflow_id,
            step_id,
            attempts,
            error,
        } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::WARN,
                event.kind = kind,
                workflow.id = %workflow_id,
                step.id = %step_id,
                retry.attempts = attempts,
                error = %error,
                "step retries exhausted"
            );
        }
        WorkflowEvent::StepTimeout {
            workflow_id,
            step_id,
            timeout_ms,
            attempt,
        } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::WARN,
                event.kind = kind,
                workflow.id = %workflow_id,
                step.id = %step_id,
                timeout_ms,
                retry.attempt = attempt,
                "step timed out"
            );
        }
        WorkflowEvent::CacheHit {
            workflow_id,
            step_id,
            step_key,
            ok,
        } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::DEBUG,
                event.kind = kind,
                workflow.id = %workflow_id,
                step.id = %step_id,
                step.key = %step_key,
                step.ok = ok,
                "cache hit"
            );
        }
        WorkflowEvent::CacheMiss {
            workflow_id,
            step_id,
            step_key,
        } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::DEBUG,
                event.kind = kind,
                workflow.id = %workflow_id,
                step.id = %step_id,
                step.key = %step_key,
                "cache miss"
            );
        }
        WorkflowEvent::StreamCheckpoint {
            workflow_id,
            step_id,
            step_key,
            processed,
        } => {
            tracing::event!(
                target: "durastep::events",
                tracing::Level::DEBUG,
                event.kind = kind,
                workflow.id = %workflow_id,
                step.id = %step_id,
                step.key = %step_key,
                stream.processed = processed,
                "stream checkpoint"
            );
        }
    }
}
