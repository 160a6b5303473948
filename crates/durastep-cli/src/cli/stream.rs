//! Print the items of a persisted workflow stream.

use anyhow::Result;
use console::style;

use durastep_core::repository::StreamStore;

use crate::state::AppState;

/// Print every stored item from `from` onward, then the stream's terminal state.
///
/// Does not wait for new items; an open stream prints what is stored so far.
pub async fn cat(state: &AppState, id: &str, namespace: &str, from: u64, json: bool) -> Result<()> {
    let batch = state.config.stream.read_batch_size.max(1);
    let mut position = from;
    let mut count = 0usize;

    loop {
        let items = state
            .streams
            .read(id, namespace, position, batch)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read stream {id}/{namespace}: {e}"))?;
        let Some(last) = items.last() else {
            break;
        };
        position = last.position + 1;
        for item in &items {
            if json {
                println!("{}", serde_json::to_string(item)?);
            } else {
                println!("  {} {}", style(format!("{:>5}", item.position)).dim(), item.payload);
            }
        }
        count += items.len();
        if items.len() < batch {
            break;
        }
    }

    let metadata = state
        .streams
        .get_metadata(id, namespace)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read stream metadata: {e}"))?;
    if json {
        return Ok(());
    }

    let ending = match metadata {
        None => style("open".to_string()).yellow(),
        Some(meta) => match meta.abort_reason {
            Some(reason) => style(format!("aborted: {reason}")).red(),
            None => style("closed".to_string()).green(),
        },
    };
    println!();
    println!("  {count} items, stream {ending}");
    Ok(())
}
