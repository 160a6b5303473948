//! Persisted workflow state subcommands: list, show, export, import, delete
//! and unlock.

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;

use durastep_core::repository::SnapshotStore;
use durastep_core::repository::snapshot::lease_active;
use durastep_types::snapshot::{ListOptions, PersistedState};
use durastep_types::step::StepResult;

use crate::state::AppState;

/// Longest value preview shown in the steps table.
const PREVIEW_CHARS: usize = 48;

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list(
    state: &AppState,
    prefix: Option<String>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let entries = state
        .snapshots
        .list(&ListOptions { prefix, limit })
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list workflows: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!();
        println!("  No persisted workflows in {}.", style(state.db_path.display()).dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Workflow").fg(Color::Cyan),
            Cell::new("Kind"),
            Cell::new("Steps"),
            Cell::new("Status"),
            Cell::new("Updated"),
        ]);

    for entry in &entries {
        let loaded = state
            .snapshots
            .load(&entry.id)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load '{}': {e}", entry.id))?;
        let (kind, steps, status) = match &loaded {
            Some(persisted) => (
                persisted.kind(),
                persisted.step_count().to_string(),
                status_cell(persisted),
            ),
            None => ("-", "-".to_string(), Cell::new("-")),
        };
        table.add_row(vec![
            Cell::new(&entry.id).fg(Color::Cyan),
            Cell::new(kind),
            Cell::new(steps),
            status,
            Cell::new(entry.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn status_cell(persisted: &PersistedState) -> Cell {
    match persisted {
        PersistedState::Snapshot(snapshot) => {
            let status = snapshot.execution.status.to_string();
            let color = match status.as_str() {
                "completed" => Color::Green,
                "failed" => Color::Red,
                _ => Color::Yellow,
            };
            Cell::new(status).fg(color)
        }
        PersistedState::ResumeState(_) => Cell::new("resumable"),
    }
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

pub async fn show(state: &AppState, id: &str, json: bool) -> Result<()> {
    let persisted = load_required(state, id).await?;
    let lease = state
        .snapshots
        .lock_holder(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read lease: {e}"))?;
    let locked = lease.as_ref().is_some_and(|l| lease_active(l, Utc::now()));

    if json {
        let out = serde_json::json!({
            "id": id,
            "kind": persisted.kind(),
            "locked": locked,
            "lease": lease,
            "state": persisted,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Workflow").bold(), style(id).cyan());
    println!("  Kind: {}", persisted.kind());
    let steps: Vec<(&str, &StepResult)> = match &persisted {
        PersistedState::Snapshot(snapshot) => {
            println!("  Status: {}", snapshot.execution.status);
            println!("  Updated: {}", snapshot.execution.last_updated.format("%Y-%m-%d %H:%M:%S"));
            if let Some(current) = &snapshot.execution.current_step_id {
                println!("  Last step: {current}");
            }
            if let Some(hash) = snapshot.definition_hash() {
                println!("  Definition: {}", style(short_hash(hash)).dim());
            }
            for warning in &snapshot.warnings {
                println!(
                    "  {} {} at '{}': {}",
                    style("!").yellow().bold(),
                    warning.step_id,
                    warning.path,
                    warning.reason
                );
            }
            snapshot.steps.iter().map(|(k, v)| (k.as_str(), v)).collect()
        }
        PersistedState::ResumeState(resume) => {
            resume.steps.iter().map(|(k, v)| (k.as_str(), v)).collect()
        }
    };
    if locked {
        println!("  Lease: {}", style("held").yellow());
    }
    println!();

    if steps.is_empty() {
        println!("  No recorded steps.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Outcome"),
            Cell::new("Origin"),
            Cell::new("Value"),
        ]);
    for (key, result) in steps {
        let (outcome, origin, value) = match result {
            StepResult::Ok { value } => (Cell::new("ok").fg(Color::Green), String::new(), value),
            StepResult::Err { error, meta, .. } => (
                Cell::new("err").fg(Color::Red),
                meta.origin.to_string(),
                error,
            ),
        };
        table.add_row(vec![
            Cell::new(key),
            outcome,
            Cell::new(origin),
            Cell::new(preview(value)),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Compact single-line JSON, cut to [`PREVIEW_CHARS`].
fn preview(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= PREVIEW_CHARS {
        return text;
    }
    let cut: String = text.chars().take(PREVIEW_CHARS - 1).collect();
    format!("{cut}…")
}

// ---------------------------------------------------------------------------
// Export / import
// ---------------------------------------------------------------------------

pub async fn export(state: &AppState, id: &str, output: Option<&Path>) -> Result<()> {
    let persisted = load_required(state, id).await?;
    let text = serde_json::to_string_pretty(&persisted)?;
    match output {
        Some(path) => {
            tokio::fs::write(path, text)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!(
                "  {} Exported '{}' to {}",
                style("*").green().bold(),
                style(id).cyan(),
                path.display()
            );
        }
        None => println!("{text}"),
    }
    Ok(())
}

pub async fn import(state: &AppState, id: &str, file: &Path, json: bool) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let persisted = parse_persisted(&text)?;
    state
        .snapshots
        .save(id, &persisted)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to save '{id}': {e}"))?;

    if json {
        let out = serde_json::json!({
            "id": id,
            "kind": persisted.kind(),
            "steps": persisted.step_count(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Imported {} with {} steps as '{}'",
            style("*").green().bold(),
            persisted.kind(),
            persisted.step_count(),
            style(id).cyan()
        );
        println!();
    }
    Ok(())
}

fn parse_persisted(text: &str) -> Result<PersistedState> {
    serde_json::from_str(text)
        .context("File is neither a workflow snapshot nor a serialized resume state")
}

// ---------------------------------------------------------------------------
// Delete / unlock
// ---------------------------------------------------------------------------

pub async fn delete(state: &AppState, id: &str, force: bool, json: bool) -> Result<()> {
    if !force {
        let lease = state
            .snapshots
            .lock_holder(id)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read lease: {e}"))?;
        if lease.is_some_and(|l| lease_active(&l, Utc::now())) {
            bail!("Workflow '{id}' is locked by a running process (use --force to delete anyway)");
        }
    }

    let deleted = state
        .snapshots
        .delete(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to delete '{id}': {e}"))?;
    if force {
        state
            .snapshots
            .force_unlock(id)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to release lease: {e}"))?;
    }
    if !deleted {
        bail!("Workflow '{id}' not found");
    }

    if json {
        println!("{}", serde_json::json!({ "id": id, "deleted": true }));
    } else {
        println!("  {} Deleted '{}'", style("*").green().bold(), style(id).cyan());
    }
    Ok(())
}

pub async fn unlock(state: &AppState, id: &str, json: bool) -> Result<()> {
    let released = state
        .snapshots
        .force_unlock(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to release lease: {e}"))?;

    if json {
        println!("{}", serde_json::json!({ "id": id, "released": released }));
    } else if released {
        println!("  {} Released lease on '{}'", style("*").green().bold(), style(id).cyan());
    } else {
        println!("  No lease held on '{}'.", style(id).cyan());
    }
    Ok(())
}

async fn load_required(state: &AppState, id: &str) -> Result<PersistedState> {
    state
        .snapshots
        .load(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load '{id}': {e}"))?
        .with_context(|| format!("Workflow '{id}' not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preview_keeps_short_values() {
        assert_eq!(preview(&json!({ "total": 42 })), r#"{"total":42}"#);
    }

    #[test]
    fn preview_cuts_long_values() {
        let long = json!("x".repeat(200));
        let shown = preview(&long);
        assert_eq!(shown.chars().count(), PREVIEW_CHARS);
        assert!(shown.ends_with('…'));
    }

    #[test]
    fn exported_resume_state_parses_back() {
        let text = r#"{"kind":"ResumeState","steps":[["a",{"ok":true,"value":1}]]}"#;
        let parsed = parse_persisted(text).unwrap();
        assert_eq!(parsed.kind(), "resume_state");
        assert_eq!(parsed.step_count(), 1);
        assert!(parse_persisted(r#"{"nope":1}"#).is_err());
    }

    #[test]
    fn short_hash_tolerates_short_input() {
        assert_eq!(short_hash("abc"), "abc");
        assert_eq!(short_hash("0123456789abcdef"), "0123456789ab");
    }
}
