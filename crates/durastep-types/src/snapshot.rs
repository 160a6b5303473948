//! Snapshot and resume-state wire formats, plus persistence-adapter records.
//!
//! A [`WorkflowSnapshot`] is a JSON-safe, point-in-time capture of a run's
//! ordered step registry and execution status. A [`SerializedResumeState`] is
//! the lighter form used to pre-seed a cache: an ordered array of
//! `[key, StepResult]` pairs tagged with `kind: "ResumeState"`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::step::StepResult;

/// Current snapshot wire format version.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Discriminator value of a serialized resume state.
pub const RESUME_STATE_KIND: &str = "ResumeState";

/// Metadata key holding the workflow definition fingerprint.
pub const DEFINITION_HASH_KEY: &str = "definitionHash";

// ---------------------------------------------------------------------------
// WorkflowSnapshot
// ---------------------------------------------------------------------------

/// Terminal state machine of a workflow run: `running -> {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Execution status block of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub status: WorkflowStatus,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recently completed step while running; cleared on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
}

/// A value that could not be captured faithfully in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotWarning {
    pub step_id: String,
    /// JSON-pointer-like path inside the step value (`""` is the root).
    pub path: String,
    pub reason: String,
}

/// Point-in-time capture of a workflow's step registry and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub format_version: u32,
    pub steps: IndexMap<String, StepResult>,
    pub execution: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SnapshotWarning>,
}

impl WorkflowSnapshot {
    /// The definition fingerprint recorded in metadata, if any.
    pub fn definition_hash(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(DEFINITION_HASH_KEY))
            .and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// SerializedResumeState
// ---------------------------------------------------------------------------

/// Wire form of a resume state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResumeState")]
pub struct SerializedResumeState {
    pub kind: String,
    pub steps: Vec<(String, StepResult)>,
}

impl SerializedResumeState {
    pub fn new(steps: Vec<(String, StepResult)>) -> Self {
        Self {
            kind: RESUME_STATE_KIND.to_string(),
            steps,
        }
    }
}

#[derive(Deserialize)]
struct RawResumeState {
    kind: String,
    steps: Vec<(String, StepResult)>,
}

impl TryFrom<RawResumeState> for SerializedResumeState {
    type Error = String;

    fn try_from(raw: RawResumeState) -> Result<Self, Self::Error> {
        if raw.kind != RESUME_STATE_KIND {
            return Err(format!(
                "expected kind '{RESUME_STATE_KIND}', got '{}'",
                raw.kind
            ));
        }
        Ok(Self {
            kind: raw.kind,
            steps: raw.steps,
        })
    }
}

// ---------------------------------------------------------------------------
// Persistence adapter records
// ---------------------------------------------------------------------------

/// What a persistence adapter stores per workflow id.
///
/// Deserialization tries the `kind`-tagged resume state first; anything else
/// must parse as a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PersistedState {
    ResumeState(SerializedResumeState),
    Snapshot(WorkflowSnapshot),
}

impl PersistedState {
    pub fn kind(&self) -> &'static str {
        match self {
            PersistedState::ResumeState(_) => "resume_state",
            PersistedState::Snapshot(_) => "snapshot",
        }
    }

    /// Number of recorded steps regardless of representation.
    pub fn step_count(&self) -> usize {
        match self {
            PersistedState::ResumeState(s) => s.steps.len(),
            PersistedState::Snapshot(s) => s.steps.len(),
        }
    }
}

/// Listing entry returned by a persistence adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntry {
    pub id: String,
    pub updated_at: DateTime<Utc>,
}

/// Filters for listing persisted workflow state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
}

/// A held workflow lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockLease {
    pub owner_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}
