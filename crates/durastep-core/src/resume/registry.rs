//! Ordered record of every completed keyed step in a run.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value};

use durastep_types::snapshot::{
    ExecutionState, SNAPSHOT_FORMAT_VERSION, SnapshotWarning, WorkflowSnapshot, WorkflowStatus,
};
use durastep_types::step::StepResult;

use crate::error::SnapshotError;

/// Which recorded steps a snapshot includes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepFilter {
    #[default]
    All,
    Successful,
    Failed,
}

impl StepFilter {
    fn accepts(self, result: &StepResult) -> bool {
        match self {
            StepFilter::All => true,
            StepFilter::Successful => result.is_ok(),
            StepFilter::Failed => !result.is_ok(),
        }
    }
}

/// Options for [`StepRegistry::snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotQuery {
    pub filter: StepFilter,
    /// Only include steps recorded after this key. An unknown key includes everything.
    pub since_step_id: Option<String>,
    pub limit: Option<usize>,
}

impl SnapshotQuery {
    pub fn filter(mut self, filter: StepFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn since(mut self, step_id: impl Into<String>) -> Self {
        self.since_step_id = Some(step_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// The run's step registry plus its execution state.
#[derive(Debug, Clone)]
pub struct StepRegistry {
    steps: IndexMap<String, StepResult>,
    warnings: IndexMap<String, SnapshotWarning>,
    status: WorkflowStatus,
    last_updated: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    current_step_id: Option<String>,
    metadata: Option<Map<String, Value>>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            steps: IndexMap::new(),
            warnings: IndexMap::new(),
            status: WorkflowStatus::Running,
            last_updated: Utc::now(),
            completed_at: None,
            current_step_id: None,
            metadata: None,
        }
    }

    /// Pre-seed from a restored set of steps. Status starts as running.
    pub fn seeded(steps: IndexMap<String, StepResult>) -> Self {
        Self {
            steps,
            ..Self::new()
        }
    }

    pub fn set_metadata(&mut self, metadata: Option<Map<String, Value>>) {
        self.metadata = metadata;
    }

    /// Record a completed step. Re-recording a key keeps its original position.
    pub fn record(&mut self, key: &str, result: StepResult, warning: Option<SnapshotWarning>) {
        self.steps.insert(key.to_string(), result);
        if let Some(warning) = warning {
            self.warnings.entry(key.to_string()).or_insert(warning);
        }
        self.current_step_id = Some(key.to_string());
        self.last_updated = Utc::now();
    }

    /// Move to a terminal status. Later calls are ignored.
    pub fn complete(&mut self, status: WorkflowStatus) {
        if self.status.is_terminal() || !status.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.last_updated = now;
        self.current_step_id = None;
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn get(&self, key: &str) -> Option<&StepResult> {
        self.steps.get(key)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> impl Iterator<Item = (&String, &StepResult)> {
        self.steps.iter()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &SnapshotWarning> {
        self.warnings.values()
    }

    /// Capture a snapshot. Never fails; lossy values surface as warnings.
    pub fn snapshot(&self, query: &SnapshotQuery) -> WorkflowSnapshot {
        let start = query
            .since_step_id
            .as_deref()
            .and_then(|id| self.steps.get_index_of(id))
            .map(|i| i + 1)
            .unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);

        let steps: IndexMap<String, StepResult> = self
            .steps
            .iter()
            .skip(start)
            .filter(|(_, r)| query.filter.accepts(r))
            .take(limit)
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        let warnings = self
            .warnings
            .iter()
            .filter(|(k, _)| steps.contains_key(k.as_str()))
            .map(|(_, w)| w.clone())
            .collect();

        WorkflowSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            steps,
            execution: ExecutionState {
                status: self.status,
                last_updated: self.last_updated,
                completed_at: self.completed_at,
                current_step_id: self.current_step_id.clone(),
            },
            metadata: self.metadata.clone(),
            warnings,
        }
    }

    /// Like [`snapshot`](Self::snapshot) but fails on the first lossy value.
    pub fn strict_snapshot(
        &self,
        query: &SnapshotQuery,
    ) -> Result<WorkflowSnapshot, SnapshotError> {
        let snapshot = self.snapshot(query);
        match snapshot.warnings.first() {
            Some(w) => Err(SnapshotError::LossyValue {
                step_id: w.step_id.clone(),
                path: w.path.clone(),
                reason: w.reason.clone(),
            }),
            None => Ok(snapshot),
        }
    }
}
