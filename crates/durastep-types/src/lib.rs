//! Shared data model for the durastep workflow engine.
//!
//! This crate contains the JSON-safe types every other crate exchanges:
//! step outcomes and their wire form, snapshots and resume state, lifecycle
//! events, the engine's well-known failure shapes, stream records, and
//! configuration.
//!
//! Zero infrastructure dependencies -- only serde, chrono, indexmap, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod snapshot;
pub mod step;
pub mod stream;
