//! Event delivery for workflow lifecycle events.
//!
//! Provides an `EventBus` that distributes `WorkflowEvent`s to listeners with
//! per-listener sync/async delivery and optional coalescing.

pub mod bus;

pub use bus::{Coalesce, DeliveryMode, EventBus, SubscribeOptions, Subscription};
