//! Database and configuration status command.

use anyhow::Result;
use console::style;

use durastep_core::repository::SnapshotStore;
use durastep_types::snapshot::{ListOptions, PersistedState, WorkflowStatus};

use crate::state::AppState;

/// Show where state lives, how many workflows are persisted by status, and
/// the engine configuration in effect.
pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let entries = state
        .snapshots
        .list(&ListOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list workflows: {e}"))?;

    let (mut completed, mut failed, mut running, mut resumable) = (0usize, 0usize, 0usize, 0usize);
    for entry in &entries {
        match state.snapshots.load(&entry.id).await {
            Ok(Some(PersistedState::Snapshot(s))) => match s.execution.status {
                WorkflowStatus::Completed => completed += 1,
                WorkflowStatus::Failed => failed += 1,
                WorkflowStatus::Running => running += 1,
            },
            Ok(Some(PersistedState::ResumeState(_))) => resumable += 1,
            Ok(None) => {}
            Err(e) => tracing::warn!(
                workflow_id = %entry.id,
                error = %e,
                "skipping unreadable workflow state"
            ),
        }
    }

    if json {
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "database": state.db_path.display().to_string(),
            "workflows": {
                "total": entries.len(),
                "completed": completed,
                "failed": failed,
                "running": running,
                "resumable": resumable,
            },
            "config": state.config,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("  {} durastep v{}", style("*").bold(), env!("CARGO_PKG_VERSION"));
    println!();

    println!("  {}", style("── Workflows ──").dim());
    println!("  Total:     {}", style(entries.len()).bold());
    println!("  Completed: {}", style(completed).green());
    if failed > 0 {
        println!("  Failed:    {}", style(failed).red());
    }
    if running > 0 {
        println!("  Running:   {}", style(running).yellow());
    }
    if resumable > 0 {
        println!("  Resumable: {}", resumable);
    }
    println!();

    let config = &state.config;
    println!("  {}", style("── Engine ──").dim());
    println!(
        "  Retry:     {} attempts, {:?} backoff from {}ms{}",
        config.retry.attempts,
        config.retry.backoff,
        config.retry.initial_delay_ms,
        if config.retry.jitter { ", jitter" } else { "" }
    );
    println!(
        "  Snapshot:  lossy values {:?}, drift {:?}",
        config.snapshot.lossy_values, config.snapshot.drift_policy
    );
    println!(
        "  Streams:   high water mark {}, poll {}ms, read timeout {}ms",
        config.stream.high_water_mark, config.stream.poll_interval_ms, config.stream.read_timeout_ms
    );
    println!();

    println!("  {}", style("── Storage ──").dim());
    println!("  Data dir:  {}", state.data_dir.display());
    println!("  Database:  {}", state.db_path.display());
    println!();

    Ok(())
}
