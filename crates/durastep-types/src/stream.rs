//! Stream records exchanged between writers, readers and stream stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One appended stream item with its position in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamItem {
    /// Zero-based position assigned by the store on append.
    pub position: u64,
    pub payload: Value,
    pub written_at: DateTime<Utc>,
}

/// Persisted terminal state of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub closed: bool,
    /// Set when the writer aborted instead of closing cleanly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}
