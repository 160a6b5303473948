//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (durastep-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod snapshot;
pub mod stream;

pub use snapshot::{InMemorySnapshotStore, SnapshotStore, WorkflowLock};
pub use stream::{InMemoryStreamStore, StreamStore};
