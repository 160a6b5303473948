//! CLI command definitions for the `durastep` binary.
//!
//! Commands address persisted workflow state by workflow id.

pub mod status;
pub mod stream;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Inspect and manage persisted durastep workflow state.
#[derive(Parser)]
#[command(name = "durastep", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database file (default: `$DURASTEP_DATA_DIR/durastep.db` or `~/.durastep/durastep.db`).
    #[arg(long, global = true, env = "DURASTEP_DB")]
    pub db: Option<PathBuf>,

    /// Export traces to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List persisted workflows, most recently updated first.
    #[command(alias = "ls")]
    List {
        /// Only ids starting with this prefix.
        #[arg(long)]
        prefix: Option<String>,

        /// Maximum number of entries.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show the steps and status of a persisted workflow.
    Show {
        /// Workflow id.
        id: String,
    },

    /// Write the persisted state of a workflow as JSON.
    Export {
        /// Workflow id.
        id: String,

        /// Output file (stdout when omitted).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Store a snapshot or resume state JSON file under a workflow id.
    Import {
        /// Workflow id.
        id: String,

        /// JSON file produced by `export`.
        file: PathBuf,
    },

    /// Delete the persisted state of a workflow.
    #[command(alias = "rm")]
    Delete {
        /// Workflow id.
        id: String,

        /// Delete even while a lease is held.
        #[arg(long)]
        force: bool,
    },

    /// Release a stale workflow lease regardless of owner.
    Unlock {
        /// Workflow id.
        id: String,
    },

    /// Print the items of a workflow stream.
    Stream {
        /// Workflow id.
        id: String,

        /// Stream namespace.
        namespace: String,

        /// First position to print.
        #[arg(long, default_value = "0")]
        from: u64,
    },

    /// Show database location, counts and effective engine configuration.
    Status,
}
