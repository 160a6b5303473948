//! Restoring a run from a [`WorkflowSnapshot`].
//!
//! Restore validates the format version, compares the recorded definition
//! fingerprint with the current one, then decodes every step into a cache
//! entry. Parked (pending approval or hook) steps are not seeded so they
//! re-evaluate on the next run.

use std::sync::Arc;

use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use durastep_types::config::DriftPolicy;
use durastep_types::snapshot::{SNAPSHOT_FORMAT_VERSION, WorkflowSnapshot};
use durastep_types::step::{CacheEntry, StepResult};

use crate::cache::StepCache;
use crate::cache::encoding::step_result_to_entry;
use crate::error::{SnapshotError, is_suspension_value};

/// Decodes one wire step into a cache entry.
pub type StepDecoder =
    Arc<dyn Fn(&str, &StepResult) -> Result<CacheEntry, SnapshotError> + Send + Sync>;

/// Fingerprint of a workflow definition: hex SHA-256 over its parts.
///
/// Pass whatever identifies the code shape (workflow name, ordered step ids,
/// a version string).
pub fn definition_hash<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Options for [`restore_snapshot`].
#[derive(Clone, Default)]
pub struct RestoreOptions {
    /// Fingerprint of the code doing the restore.
    pub definition_hash: Option<String>,
    pub drift_policy: DriftPolicy,
    pub decoder: Option<StepDecoder>,
}

impl std::fmt::Debug for RestoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreOptions")
            .field("definition_hash", &self.definition_hash)
            .field("drift_policy", &self.drift_policy)
            .field("decoder", &self.decoder.is_some())
            .finish()
    }
}

/// Check version and definition drift without touching any cache.
///
/// Returns a drift message when the policy is `Warn` and the fingerprints differ.
pub fn validate_snapshot(
    snapshot: &WorkflowSnapshot,
    options: &RestoreOptions,
) -> Result<Option<String>, SnapshotError> {
    if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedVersion {
            found: snapshot.format_version,
            expected: SNAPSHOT_FORMAT_VERSION,
        });
    }

    let (Some(recorded), Some(current)) =
        (snapshot.definition_hash(), options.definition_hash.as_deref())
    else {
        return Ok(None);
    };
    if recorded == current {
        return Ok(None);
    }
    match options.drift_policy {
        DriftPolicy::Ignore => Ok(None),
        DriftPolicy::Error => Err(SnapshotError::DefinitionDrift {
            snapshot: recorded.to_string(),
            current: current.to_string(),
        }),
        DriftPolicy::Warn => {
            tracing::warn!(
                snapshot_hash = recorded,
                current_hash = current,
                "restoring snapshot produced by a different workflow definition"
            );
            Ok(Some(format!(
                "definition drift: snapshot {recorded}, current {current}"
            )))
        }
    }
}

/// What [`restore_snapshot`] seeded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoredSnapshot {
    /// Restored steps in recorded order.
    pub steps: IndexMap<String, StepResult>,
    /// Drift message when the definition changed under `DriftPolicy::Warn`.
    pub drift: Option<String>,
}

/// Seed `cache` from `snapshot` and return the restored steps in order.
pub fn restore_snapshot(
    snapshot: &WorkflowSnapshot,
    cache: &dyn StepCache,
    options: &RestoreOptions,
) -> Result<RestoredSnapshot, SnapshotError> {
    let drift = validate_snapshot(snapshot, options)?;

    let mut restored = IndexMap::with_capacity(snapshot.steps.len());
    for (key, result) in &snapshot.steps {
        let parked = matches!(result, StepResult::Err { error, .. } if is_suspension_value(error));
        if parked {
            tracing::debug!(step_key = %key, "skipping parked step on restore");
            continue;
        }
        let entry = match &options.decoder {
            Some(decode) => decode(key, result)?,
            None => step_result_to_entry(result),
        };
        cache.set(key, entry, None);
        restored.insert(key.clone(), result.clone());
    }

    tracing::debug!(steps = restored.len(), "snapshot restored");
    Ok(RestoredSnapshot {
        steps: restored,
        drift,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStepCache;
    use crate::cache::encoding::decode_meta;
    use durastep_types::snapshot::{DEFINITION_HASH_KEY, ExecutionState, WorkflowStatus};
    use durastep_types::step::{Cause, FailureOrigin};
    use serde_json::{Map, json};

    fn snapshot(hash: Option<&str>) -> WorkflowSnapshot {
        let mut steps = IndexMap::new();
        steps.insert("a".to_string(), StepResult::ok(json!(10)));
        steps.insert(
            "b".to_string(),
            StepResult::err(
                json!({"domain": "FAILED"}),
                Some(Cause::thrown("boom")),
                FailureOrigin::Throw,
            ),
        );
        steps.insert(
            "gate".to_string(),
            StepResult::err(
                json!({"pending_hook": {"hook_id": "h1"}}),
                None,
                FailureOrigin::Result,
            ),
        );
        let metadata = hash.map(|h| {
            let mut m = Map::new();
            m.insert(DEFINITION_HASH_KEY.to_string(), json!(h));
            m
        });
        WorkflowSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            steps,
            execution: ExecutionState {
                status: WorkflowStatus::Failed,
                last_updated: chrono::Utc::now(),
                completed_at: None,
                current_step_id: None,
            },
            metadata,
            warnings: vec![],
        }
    }

    #[test]
    fn hash_is_stable_and_order_sensitive() {
        let a = definition_hash(["checkout", "charge", "ship"]);
        assert_eq!(a, definition_hash(["checkout", "charge", "ship"]));
        assert_ne!(a, definition_hash(["checkout", "ship", "charge"]));
        assert_ne!(definition_hash(["ab", "c"]), definition_hash(["a", "bc"]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn restore_seeds_cache_and_skips_parked_steps() {
        let cache = InMemoryStepCache::new();
        let restored =
            restore_snapshot(&snapshot(None), &cache, &RestoreOptions::default()).unwrap();
        assert_eq!(restored.steps.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(restored.drift.is_none());
        assert_eq!(cache.get("a"), Some(Ok(json!(10))));
        let failure = cache.get("b").unwrap().unwrap_err();
        assert_eq!(decode_meta(failure.cause.as_ref()).origin(), FailureOrigin::Throw);
        assert!(cache.get("gate").is_none());
    }

    #[test]
    fn rejects_unknown_version() {
        let mut snap = snapshot(None);
        snap.format_version = 99;
        let err = restore_snapshot(&snap, &InMemoryStepCache::new(), &RestoreOptions::default());
        assert!(matches!(err, Err(SnapshotError::UnsupportedVersion { found: 99, .. })));
    }

    #[test]
    fn drift_policies() {
        let snap = snapshot(Some("old"));
        let mut options = RestoreOptions {
            definition_hash: Some("new".to_string()),
            ..RestoreOptions::default()
        };
        assert!(validate_snapshot(&snap, &options).unwrap().is_some());

        options.drift_policy = DriftPolicy::Ignore;
        assert!(validate_snapshot(&snap, &options).unwrap().is_none());

        options.drift_policy = DriftPolicy::Error;
        assert!(matches!(
            validate_snapshot(&snap, &options),
            Err(SnapshotError::DefinitionDrift { .. })
        ));

        options.definition_hash = Some("old".to_string());
        assert!(validate_snapshot(&snap, &options).unwrap().is_none());
    }

    #[test]
    fn custom_decoder_is_used() {
        let cache = InMemoryStepCache::new();
        let options = RestoreOptions {
            decoder: Some(Arc::new(|_key: &str, result: &StepResult| match result {
                StepResult::Ok { value } => Ok(Ok(json!({ "restored": value }))),
                other => Ok(step_result_to_entry(other)),
            })),
            ..RestoreOptions::default()
        };
        restore_snapshot(&snapshot(None), &cache, &options).unwrap();
        assert_eq!(cache.get("a"), Some(Ok(json!({ "restored": 10 }))));
    }

    #[test]
    fn restore_reports_drift_under_warn() {
        let options = RestoreOptions {
            definition_hash: Some("new".to_string()),
            ..RestoreOptions::default()
        };
        let restored =
            restore_snapshot(&snapshot(Some("old")), &InMemoryStepCache::new(), &options)
                .unwrap();
        let drift = restored.drift.unwrap();
        assert!(drift.contains("old") && drift.contains("new"), "{drift}");
        assert_eq!(restored.steps.len(), 2);
    }
}
