//! Conversions between cache entries and the `StepResult` wire form.
//!
//! A failure stored in cache has its cause wrapped in a
//! [`CachedErrorCause`] so that replay can recover the original origin and
//! cause. Entries written by other producers have no wrapper; those decode as
//! origin `result` with their raw cause.

use durastep_types::step::{
    CacheEntry, CachedErrorCause, CachedFailure, Cause, StepFailureMeta, StepResult,
};
use serde_json::Value;

/// Wrap a failure for storage in a step cache.
pub fn encode_failure(
    error: Value,
    meta: StepFailureMeta,
    original_cause: Option<Cause>,
) -> CachedFailure {
    CachedFailure {
        error,
        cause: Some(Cause::Cached(Box::new(CachedErrorCause {
            original_cause,
            meta,
        }))),
    }
}

/// Recover replay metadata from a cached failure's cause.
pub fn decode_meta(cause: Option<&Cause>) -> StepFailureMeta {
    match cause {
        Some(Cause::Cached(wrapper)) => wrapper.meta.clone(),
        other => StepFailureMeta::Result {
            result_cause: other.cloned(),
        },
    }
}

/// The cause as the operation produced it, with any cache wrapper removed.
pub fn original_cause(cause: Option<&Cause>) -> Option<Cause> {
    match cause {
        Some(Cause::Cached(wrapper)) => wrapper.original_cause.clone(),
        other => other.cloned(),
    }
}

/// Wire form of a cache entry.
pub fn entry_to_step_result(entry: &CacheEntry) -> StepResult {
    match entry {
        Ok(value) => StepResult::ok(value.clone()),
        Err(failure) => {
            let meta = decode_meta(failure.cause.as_ref());
            StepResult::err(
                failure.error.clone(),
                original_cause(failure.cause.as_ref()),
                meta.origin(),
            )
        }
    }
}

/// Cache entry for a wire result. Used as the default restore decoder.
pub fn step_result_to_entry(result: &StepResult) -> CacheEntry {
    match result {
        StepResult::Ok { value } => Ok(value.clone()),
        StepResult::Err { error, cause, meta } => Err(encode_failure(
            error.clone(),
            StepFailureMeta::from_wire(meta.origin, cause.clone()),
            cause.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durastep_types::step::FailureOrigin;
    use serde_json::json;

    #[test]
    fn thrown_failure_round_trips_origin() {
        let meta = StepFailureMeta::Throw {
            thrown: Cause::thrown("boom"),
        };
        let cached = encode_failure(json!("FAILED"), meta.clone(), Some(Cause::thrown("boom")));
        assert_eq!(decode_meta(cached.cause.as_ref()), meta);
        assert_eq!(original_cause(cached.cause.as_ref()), Some(Cause::thrown("boom")));

        let wire = entry_to_step_result(&Err(cached));
        assert_eq!(wire.origin(), Some(FailureOrigin::Throw));
        match wire {
            StepResult::Err { cause, .. } => assert_eq!(cause, Some(Cause::thrown("boom"))),
            StepResult::Ok { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn unwrapped_cause_decodes_as_result_origin() {
        let cause = Cause::domain("raw");
        let meta = decode_meta(Some(&cause));
        assert_eq!(meta.origin(), FailureOrigin::Result);
        assert_eq!(meta.cause(), Some(&cause));
        assert_eq!(decode_meta(None).origin(), FailureOrigin::Result);
    }

    #[test]
    fn wire_to_entry_and_back() {
        let wire = StepResult::err(
            json!({"domain": "X"}),
            Some(Cause::domain(1)),
            FailureOrigin::Result,
        );
        let entry = step_result_to_entry(&wire);
        assert_eq!(entry_to_step_result(&entry), wire);

        let ok = StepResult::ok(json!([1, 2]));
        assert_eq!(step_result_to_entry(&ok), Ok(json!([1, 2])));
    }
}
