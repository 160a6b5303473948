//! Resume state: a keyed set of step outcomes used to pre-seed a cache.
//!
//! A run that stopped (failed, was cancelled, or parked on an approval) can be
//! continued by collecting its completed steps into a [`ResumeState`],
//! optionally editing it (inject an approval, clear a step), and handing it to
//! the next run. Every key present replays from cache instead of executing.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use durastep_types::snapshot::{SerializedResumeState, WorkflowSnapshot};
use durastep_types::step::{CacheEntry, CachedFailure, StepFailureMeta, StepResult};

use crate::cache::StepCache;
use crate::cache::encoding::{decode_meta, encode_failure, original_cause};
use crate::error::{SnapshotError, is_suspension_value};

/// Optional transform applied to success values on (de)serialization, for
/// values that need more than plain JSON (encryption, compression, custom
/// type tags).
pub trait ValueCodec: Send + Sync {
    fn encode(&self, key: &str, value: &Value) -> Result<Value, SnapshotError>;
    fn decode(&self, key: &str, value: &Value) -> Result<Value, SnapshotError>;
}

/// One resumable step.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeEntry {
    /// Failures hold the original (unwrapped) cause.
    pub result: CacheEntry,
    pub meta: Option<StepFailureMeta>,
}

impl ResumeEntry {
    pub fn ok(value: Value) -> Self {
        Self {
            result: Ok(value),
            meta: None,
        }
    }

    pub fn failure(error: Value, meta: StepFailureMeta) -> Self {
        Self {
            result: Err(CachedFailure {
                error,
                cause: meta.cause().cloned(),
            }),
            meta: Some(meta),
        }
    }

    /// Build from a cache entry, unwrapping any cache wrapper cause.
    pub fn from_cache_entry(entry: &CacheEntry) -> Self {
        match entry {
            Ok(value) => Self::ok(value.clone()),
            Err(failure) => {
                let meta = decode_meta(failure.cause.as_ref());
                Self {
                    result: Err(CachedFailure {
                        error: failure.error.clone(),
                        cause: original_cause(failure.cause.as_ref()),
                    }),
                    meta: Some(meta),
                }
            }
        }
    }

    /// The entry as a step cache stores it.
    pub fn to_cache_entry(&self) -> CacheEntry {
        match &self.result {
            Ok(value) => Ok(value.clone()),
            Err(failure) => Err(encode_failure(
                failure.error.clone(),
                self.failure_meta(failure),
                failure.cause.clone(),
            )),
        }
    }

    fn failure_meta(&self, failure: &CachedFailure) -> StepFailureMeta {
        self.meta.clone().unwrap_or_else(|| StepFailureMeta::Result {
            result_cause: failure.cause.clone(),
        })
    }

    pub(crate) fn to_step_result(&self) -> StepResult {
        match &self.result {
            Ok(value) => StepResult::ok(value.clone()),
            Err(failure) => StepResult::err(
                failure.error.clone(),
                failure.cause.clone(),
                self.failure_meta(failure).origin(),
            ),
        }
    }

    fn from_step_result(result: &StepResult) -> Self {
        match result {
            StepResult::Ok { value } => Self::ok(value.clone()),
            StepResult::Err { error, cause, meta } => Self {
                result: Err(CachedFailure {
                    error: error.clone(),
                    cause: cause.clone(),
                }),
                meta: Some(StepFailureMeta::from_wire(meta.origin, cause.clone())),
            },
        }
    }
}

/// Ordered map of step key to resumable outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumeState {
    steps: IndexMap<String, ResumeEntry>,
}

impl ResumeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: ResumeEntry) {
        self.steps.insert(key.into(), entry);
    }

    pub fn get(&self, key: &str) -> Option<&ResumeEntry> {
        self.steps.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.steps.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResumeEntry)> {
        self.steps.iter()
    }

    /// Record a human decision so the step at `key` replays `value`.
    ///
    /// For gated steps the key is [`crate::hitl::approval_key`] of the step key
    /// and the value is the approved arguments.
    pub fn inject_approval<T: Serialize + ?Sized>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), SnapshotError> {
        let value = serde_json::to_value(value)?;
        self.steps.insert(key.into(), ResumeEntry::ok(value));
        Ok(())
    }

    /// Drop a step so it executes again on resume.
    pub fn clear_step(&mut self, key: &str) -> bool {
        self.steps.shift_remove(key).is_some()
    }

    /// Resumable steps of a snapshot. Parked (pending) steps are left out so
    /// they re-check their condition.
    pub fn from_snapshot(snapshot: &WorkflowSnapshot) -> Self {
        let steps = snapshot
            .steps
            .iter()
            .filter(|(_, r)| !is_parked(r))
            .map(|(k, r)| (k.clone(), ResumeEntry::from_step_result(r)))
            .collect();
        Self { steps }
    }

    /// Write every entry into `cache`.
    pub fn seed(&self, cache: &dyn StepCache) {
        for (key, entry) in &self.steps {
            cache.set(key, entry.to_cache_entry(), None);
        }
    }

    /// JSON-safe wire form. `codec` transforms success values.
    pub fn serialize(
        &self,
        codec: Option<&dyn ValueCodec>,
    ) -> Result<SerializedResumeState, SnapshotError> {
        let mut steps = Vec::with_capacity(self.steps.len());
        for (key, entry) in &self.steps {
            let mut result = entry.to_step_result();
            if let (Some(codec), StepResult::Ok { value }) = (codec, &mut result) {
                *value = codec.encode(key, value)?;
            }
            steps.push((key.clone(), result));
        }
        Ok(SerializedResumeState::new(steps))
    }

    /// Inverse of [`serialize`](Self::serialize).
    pub fn deserialize(
        wire: &SerializedResumeState,
        codec: Option<&dyn ValueCodec>,
    ) -> Result<Self, SnapshotError> {
        let mut steps = IndexMap::with_capacity(wire.steps.len());
        for (key, result) in &wire.steps {
            let mut entry = ResumeEntry::from_step_result(result);
            if let (Some(codec), Ok(value)) = (codec, &mut entry.result) {
                *value = codec.decode(key, value)?;
            }
            steps.insert(key.clone(), entry);
        }
        Ok(Self { steps })
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(&self.serialize(None)?)?)
    }

    pub fn from_json(text: &str) -> Result<Self, SnapshotError> {
        let wire: SerializedResumeState = serde_json::from_str(text)?;
        Self::deserialize(&wire, None)
    }
}

impl FromIterator<(String, ResumeEntry)> for ResumeState {
    fn from_iter<I: IntoIterator<Item = (String, ResumeEntry)>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

fn is_parked(result: &StepResult) -> bool {
    match result {
        StepResult::Err { error, .. } => is_suspension_value(error),
        StepResult::Ok { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStepCache;
    use durastep_types::step::{Cause, FailureOrigin};
    use serde_json::json;

    fn sample() -> ResumeState {
        let mut state = ResumeState::new();
        state.insert("a", ResumeEntry::ok(json!(10)));
        state.insert(
            "b",
            ResumeEntry::failure(
                json!({"domain": "FAILED"}),
                StepFailureMeta::Throw {
                    thrown: Cause::thrown("boom"),
                },
            ),
        );
        state.insert(
            "c",
            ResumeEntry::failure(
                json!({"domain": "DECLINED"}),
                StepFailureMeta::Result {
                    result_cause: Some(Cause::domain(json!({"code": 402}))),
                },
            ),
        );
        state
    }

    #[test]
    fn serialize_then_deserialize_is_identity() {
        let state = sample();
        let wire = state.serialize(None).unwrap();
        assert_eq!(wire.steps[1].1.origin(), Some(FailureOrigin::Throw));
        let back = ResumeState::deserialize(&wire, None).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn json_round_trip_preserves_order() {
        let text = sample().to_json().unwrap();
        let back = ResumeState::from_json(&text).unwrap();
        assert_eq!(back.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn json_round_trip_keeps_both_failure_origins() {
        let text = sample().to_json().unwrap();
        let back = ResumeState::from_json(&text).unwrap();

        let origins: Vec<_> = back
            .keys()
            .map(|k| back.get(k).unwrap().to_step_result().origin())
            .collect();
        assert_eq!(origins, vec![None, Some(FailureOrigin::Throw), Some(FailureOrigin::Result)]);
        assert_eq!(
            back.get("c").unwrap().to_step_result(),
            StepResult::err(
                json!({"domain": "DECLINED"}),
                Some(Cause::domain(json!({"code": 402}))),
                FailureOrigin::Result,
            )
        );
        assert_eq!(back, sample());
    }

    #[test]
    fn seeded_cache_keeps_origin() {
        let cache = InMemoryStepCache::new();
        sample().seed(&cache);
        let entry = cache.get("b").unwrap();
        let failure = entry.unwrap_err();
        assert_eq!(decode_meta(failure.cause.as_ref()).origin(), FailureOrigin::Throw);
        assert_eq!(ResumeEntry::from_cache_entry(&cache.get("b").unwrap()), sample().steps["b"]);
    }

    #[test]
    fn inject_and_clear() {
        let mut state = sample();
        state.inject_approval("approve", &json!({"amount": 5})).unwrap();
        assert_eq!(state.get("approve"), Some(&ResumeEntry::ok(json!({"amount": 5}))));
        assert!(state.clear_step("a"));
        assert!(!state.clear_step("a"));
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["b", "c", "approve"]);
    }

    #[test]
    fn codec_transforms_success_values_only() {
        struct Wrap;
        impl ValueCodec for Wrap {
            fn encode(&self, _: &str, value: &Value) -> Result<Value, SnapshotError> {
                Ok(json!({ "wrapped": value }))
            }
            fn decode(&self, key: &str, value: &Value) -> Result<Value, SnapshotError> {
                value.get("wrapped").cloned().ok_or_else(|| SnapshotError::Decode {
                    key: key.to_string(),
                    reason: "missing wrapper".to_string(),
                })
            }
        }

        let state = sample();
        let wire = state.serialize(Some(&Wrap)).unwrap();
        assert_eq!(wire.steps[0].1, StepResult::ok(json!({ "wrapped": 10 })));
        let back = ResumeState::deserialize(&wire, Some(&Wrap)).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn from_snapshot_skips_parked_steps() {
        use durastep_types::snapshot::{ExecutionState, WorkflowStatus};
        let mut steps = IndexMap::new();
        steps.insert("a".to_string(), StepResult::ok(json!(1)));
        steps.insert(
            "approve".to_string(),
            StepResult::err(
                json!({"pending_approval": {"step_key": "approve"}}),
                None,
                FailureOrigin::Result,
            ),
        );
        let snapshot = WorkflowSnapshot {
            format_version: 1,
            steps,
            execution: ExecutionState {
                status: WorkflowStatus::Failed,
                last_updated: chrono::Utc::now(),
                completed_at: None,
                current_step_id: None,
            },
            metadata: None,
            warnings: vec![],
        };
        let state = ResumeState::from_snapshot(&snapshot);
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["a"]);
    }
}
