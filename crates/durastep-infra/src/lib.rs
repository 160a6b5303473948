//! Infrastructure layer for durastep.
//!
//! Contains implementations of the storage ports defined in `durastep-core`:
//! a SQLite snapshot store with workflow leases, a SQLite stream store, and
//! the `config.toml` loader.

pub mod config;
pub mod sqlite;
