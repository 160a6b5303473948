//! Step execution engine.
//!
//! - `options` -- per-step key, TTL, output slot, retry and timeout
//! - `retry` -- backoff strategies and retry predicates
//! - `timeout` -- per-attempt deadlines and what happens on expiry
//! - `context` -- per-run state and failure classification
//! - `step` -- the `Step` handle: cache, attempts, recording
//! - `fanout` -- `parallel`, `all` and `map`
//! - `stream_each` -- resumable drain of an async source
//! - `checkpoint` -- after-step persistence hooks
//! - `executor` -- `Workflow` runner and run results

pub mod checkpoint;
pub(crate) mod context;
pub mod executor;
pub mod fanout;
pub mod options;
pub mod retry;
pub mod step;
pub mod stream_each;
pub mod timeout;

pub use checkpoint::{BoxCheckpointHook, CheckpointHook, SnapshotCheckpointer, StepCheckpoint};
pub use executor::{RunOptions, Workflow, WorkflowBuilder, WorkflowRun};
pub use fanout::{Branch, MapOptions, branch};
pub use options::{StepKey, StepOptions};
pub use retry::{RetryOptions, backoff_delay};
pub use step::Step;
pub use stream_each::{StreamEachOptions, StreamSummary};
pub use timeout::{OnTimeout, TimeoutOptions};
