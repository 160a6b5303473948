//! Observability for durastep: subscriber setup with optional OpenTelemetry
//! export, and a bridge that turns workflow lifecycle events into tracing
//! events.

pub mod event_bridge;
pub mod tracing_setup;

pub use event_bridge::{bridge_events, log_event};
