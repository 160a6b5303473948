//! durastep CLI entry point.
//!
//! Binary name: `durastep`
//!
//! Parses CLI arguments, opens the workflow database, then dispatches to the
//! matching command handler.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,durastep=debug",
        _ => "trace",
    };
    durastep_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init(cli.db.clone()).await?;

    let outcome = match cli.command {
        Commands::List { prefix, limit } => {
            cli::workflow::list(&state, prefix, limit, cli.json).await
        }
        Commands::Show { id } => cli::workflow::show(&state, &id, cli.json).await,
        Commands::Export { id, output } => {
            cli::workflow::export(&state, &id, output.as_deref()).await
        }
        Commands::Import { id, file } => cli::workflow::import(&state, &id, &file, cli.json).await,
        Commands::Delete { id, force } => cli::workflow::delete(&state, &id, force, cli.json).await,
        Commands::Unlock { id } => cli::workflow::unlock(&state, &id, cli.json).await,
        Commands::Stream { id, namespace, from } => {
            cli::stream::cat(&state, &id, &namespace, from, cli.json).await
        }
        Commands::Status => cli::status::status(&state, cli.json).await,
    };

    durastep_observe::tracing_setup::shutdown_tracing();
    outcome
}
