//! Per-attempt deadlines.
//!
//! Each attempt is raced against its deadline. What happens to the operation
//! when the deadline wins depends on [`OnTimeout`]:
//! - `Error` / `Custom`: the operation future is dropped (cancelled) and the
//!   attempt fails.
//! - `Disconnect`: the operation keeps running as a detached task; the attempt
//!   fails immediately and the late outcome is only logged.

use std::sync::Arc;
use std::time::Duration;

use durastep_types::error::StepTimeoutError;

pub enum OnTimeout<E> {
    /// Fail with `WorkflowError::Timeout`.
    Error,
    /// Fail with `WorkflowError::Timeout` but let the operation finish in the background.
    Disconnect,
    /// Fail with the domain error built from the timeout details.
    Custom(Arc<dyn Fn(&StepTimeoutError) -> E + Send + Sync>),
}

impl<E> Clone for OnTimeout<E> {
    fn clone(&self) -> Self {
        match self {
            OnTimeout::Error => OnTimeout::Error,
            OnTimeout::Disconnect => OnTimeout::Disconnect,
            OnTimeout::Custom(f) => OnTimeout::Custom(f.clone()),
        }
    }
}

impl<E> std::fmt::Debug for OnTimeout<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnTimeout::Error => f.write_str("Error"),
            OnTimeout::Disconnect => f.write_str("Disconnect"),
            OnTimeout::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

pub struct TimeoutOptions<E> {
    pub duration: Duration,
    pub on_timeout: OnTimeout<E>,
}

impl<E> TimeoutOptions<E> {
    pub fn error(duration: Duration) -> Self {
        Self {
            duration,
            on_timeout: OnTimeout::Error,
        }
    }

    pub fn disconnect(duration: Duration) -> Self {
        Self {
            duration,
            on_timeout: OnTimeout::Disconnect,
        }
    }

    pub fn custom<F>(duration: Duration, build: F) -> Self
    where
        F: Fn(&StepTimeoutError) -> E + Send + Sync + 'static,
    {
        Self {
            duration,
            on_timeout: OnTimeout::Custom(Arc::new(build)),
        }
    }

    pub fn millis(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

impl<E> std::fmt::Debug for TimeoutOptions<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutOptions")
            .field("duration", &self.duration)
            .field("on_timeout", &self.on_timeout)
            .finish()
    }
}

impl<E> Clone for TimeoutOptions<E> {
    fn clone(&self) -> Self {
        Self {
            duration: self.duration,
            on_timeout: self.on_timeout.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_policy_builds_domain_error_from_details() {
        let options = TimeoutOptions::custom(Duration::from_millis(250), |t: &StepTimeoutError| {
            format!("{} took longer than {}ms", t.step_name, t.timeout_ms)
        });
        let info = StepTimeoutError {
            step_name: "fetch".into(),
            timeout_ms: options.millis(),
            attempt: Some(1),
        };
        match options.clone().on_timeout {
            OnTimeout::Custom(build) => assert_eq!(build(&info), "fetch took longer than 250ms"),
            other => panic!("expected custom policy, got {other:?}"),
        }
    }

    #[test]
    fn millis_saturates_for_huge_durations() {
        let options = TimeoutOptions::<()>::disconnect(Duration::MAX);
        assert_eq!(options.millis(), u64::MAX);
        assert!(matches!(options.on_timeout, OnTimeout::Disconnect));
    }
}
