//! Retry policy for step attempts.
//!
//! `attempts` counts total executions including the first. The delay before
//! attempt `n + 1` follows the backoff strategy, capped by `max_delay`:
//! - fixed: `d`
//! - linear: `d * n`
//! - exponential: `d * 2^(n - 1)`

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use durastep_types::config::{BackoffStrategy, RetryDefaults};

use crate::error::WorkflowError;

/// Decides whether a failure is retried. Receives the 1-based attempt that failed.
pub type RetryPredicate<E> = Arc<dyn Fn(&WorkflowError<E>, u32) -> bool + Send + Sync>;

/// Observes each retry: `(error, failed attempt, delay before next attempt)`.
pub type RetryListener<E> = Arc<dyn Fn(&WorkflowError<E>, u32, Duration) + Send + Sync>;

/// Delay after the failed `attempt` (1-based), before jitter.
pub fn backoff_delay(
    strategy: BackoffStrategy,
    initial: Duration,
    attempt: u32,
    max_delay: Option<Duration>,
) -> Duration {
    let attempt = attempt.max(1);
    let delay = match strategy {
        BackoffStrategy::Fixed => initial,
        BackoffStrategy::Linear => initial.saturating_mul(attempt),
        BackoffStrategy::Exponential => {
            initial.saturating_mul(2u32.saturating_pow(attempt - 1))
        }
    };
    match max_delay {
        Some(max) => delay.min(max),
        None => delay,
    }
}

// ---------------------------------------------------------------------------
// RetryOptions
// ---------------------------------------------------------------------------

pub struct RetryOptions<E> {
    pub attempts: u32,
    pub backoff: BackoffStrategy,
    pub initial_delay: Duration,
    pub max_delay: Option<Duration>,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
    retry_on: Option<RetryPredicate<E>>,
    on_retry: Option<RetryListener<E>>,
}

impl<E> RetryOptions<E> {
    pub fn new(attempts: u32, backoff: BackoffStrategy, initial_delay: Duration) -> Self {
        Self {
            attempts,
            backoff,
            initial_delay,
            max_delay: None,
            jitter: false,
            retry_on: None,
            on_retry: None,
        }
    }

    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self::new(attempts, BackoffStrategy::Fixed, delay)
    }

    pub fn linear(attempts: u32, delay: Duration) -> Self {
        Self::new(attempts, BackoffStrategy::Linear, delay)
    }

    pub fn exponential(attempts: u32, delay: Duration) -> Self {
        Self::new(attempts, BackoffStrategy::Exponential, delay)
    }

    /// Build from the `[retry]` section of the engine config.
    pub fn from_defaults(defaults: &RetryDefaults) -> Self {
        Self {
            max_delay: defaults.max_delay_ms.map(Duration::from_millis),
            jitter: defaults.jitter,
            ..Self::new(
                defaults.attempts,
                defaults.backoff,
                Duration::from_millis(defaults.initial_delay_ms),
            )
        }
    }

    pub fn max_delay(mut self, max: Duration) -> Self {
        self.max_delay = Some(max);
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&WorkflowError<E>, u32) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    pub fn on_retry<F>(mut self, listener: F) -> Self
    where
        F: Fn(&WorkflowError<E>, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(listener));
        self
    }

    /// Total attempts, never less than one.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Whether the failure of `attempt` gets another try.
    ///
    /// Cancellation is never retried.
    pub fn should_retry(&self, error: &WorkflowError<E>, attempt: u32) -> bool {
        if attempt >= self.max_attempts() || error.is_cancelled() {
            return false;
        }
        self.retry_on.as_ref().is_none_or(|p| p(error, attempt))
    }

    /// Delay to wait after `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = backoff_delay(self.backoff, self.initial_delay, attempt, self.max_delay);
        if self.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            // Near Duration::MAX the f64 product can overflow; keep the raw delay.
            Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
                .map_or(delay, |jittered| jittered.min(delay))
        } else {
            delay
        }
    }

    pub(crate) fn notify_retry(&self, error: &WorkflowError<E>, attempt: u32, delay: Duration) {
        if let Some(listener) = &self.on_retry {
            listener(error, attempt, delay);
        }
    }
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            attempts: self.attempts,
            backoff: self.backoff,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
            retry_on: self.retry_on.clone(),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("attempts", &self.attempts)
            .field("backoff", &self.backoff)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use durastep_types::error::StepTimeoutError;

    fn delays(strategy: BackoffStrategy, max: Option<u64>, count: u32) -> Vec<u64> {
        (1..=count)
            .map(|n| {
                let max = max.map(Duration::from_millis);
                backoff_delay(strategy, Duration::from_millis(100), n, max).as_millis() as u64
            })
            .collect()
    }

    #[test]
    fn fixed_backoff() {
        assert_eq!(delays(BackoffStrategy::Fixed, None, 3), vec![100, 100, 100]);
    }

    #[test]
    fn linear_backoff() {
        assert_eq!(delays(BackoffStrategy::Linear, None, 3), vec![100, 200, 300]);
    }

    #[test]
    fn exponential_backoff() {
        assert_eq!(delays(BackoffStrategy::Exponential, None, 3), vec![100, 200, 400]);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        assert_eq!(
            delays(BackoffStrategy::Exponential, Some(500), 5),
            vec![100, 200, 400, 500, 500]
        );
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let d = backoff_delay(BackoffStrategy::Exponential, Duration::from_millis(100), 200, None);
        assert!(d >= Duration::from_secs(1_000_000));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let opts: RetryOptions<()> =
            RetryOptions::fixed(3, Duration::from_millis(100)).jitter(true);
        for _ in 0..50 {
            let d = opts.delay_for(1);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn jitter_on_saturated_delay_does_not_overflow() {
        let opts: RetryOptions<()> =
            RetryOptions::exponential(500, Duration::from_secs(1 << 40)).jitter(true);
        assert_eq!(backoff_delay(opts.backoff, opts.initial_delay, 400, None), Duration::MAX);
        for _ in 0..50 {
            let d = opts.delay_for(400);
            assert!(d >= Duration::MAX / 2);
        }
    }

    #[test]
    fn should_retry_respects_attempts_and_predicate() {
        let timeout: WorkflowError<String> = WorkflowError::Timeout(StepTimeoutError {
            step_name: "s".into(),
            timeout_ms: 1,
            attempt: None,
        });
        let domain: WorkflowError<String> = WorkflowError::Domain("fatal".into());

        let opts = RetryOptions::fixed(3, Duration::ZERO)
            .retry_on(|e: &WorkflowError<String>, _| {
                !matches!(e, WorkflowError::Domain(d) if d == "fatal")
            });
        assert!(opts.should_retry(&timeout, 1));
        assert!(opts.should_retry(&timeout, 2));
        assert!(!opts.should_retry(&timeout, 3));
        assert!(!opts.should_retry(&domain, 1));
    }

    #[test]
    fn from_config_defaults() {
        let opts: RetryOptions<()> = RetryOptions::from_defaults(&RetryDefaults {
            attempts: 4,
            backoff: BackoffStrategy::Linear,
            initial_delay_ms: 20,
            max_delay_ms: Some(50),
            jitter: false,
        });
        assert_eq!(opts.max_attempts(), 4);
        assert_eq!(opts.delay_for(3), Duration::from_millis(50));
    }
}
