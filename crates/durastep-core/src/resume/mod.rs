//! Resume and snapshot subsystem.
//!
//! - `registry`: ordered record of completed steps and execution status
//! - `snapshot`: snapshot validation and restore into a cache
//! - `state`: editable resume state and its wire form
//! - `lossy`: detection of values JSON cannot hold faithfully

pub mod lossy;
pub mod registry;
pub mod snapshot;
pub mod state;

pub use registry::{SnapshotQuery, StepFilter, StepRegistry};
pub use snapshot::{
    RestoreOptions, RestoredSnapshot, StepDecoder, definition_hash, restore_snapshot,
    validate_snapshot,
};
pub use state::{ResumeEntry, ResumeState, ValueCodec};
