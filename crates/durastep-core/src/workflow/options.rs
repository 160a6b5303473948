//! Per-step options.

use std::time::Duration;

use super::retry::RetryOptions;
use super::timeout::TimeoutOptions;

/// Which cache key a step uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StepKey {
    /// The step id doubles as the key.
    #[default]
    Id,
    Custom(String),
    /// Never cached, never registered.
    Disabled,
}

/// Options accepted by every step operation.
pub struct StepOptions<E> {
    pub key: StepKey,
    /// Overrides the cache-wide TTL for this step's entry.
    pub ttl: Option<Duration>,
    /// Named slot receiving the step's success value.
    pub out: Option<String>,
    pub retry: Option<RetryOptions<E>>,
    pub timeout: Option<TimeoutOptions<E>>,
}

impl<E> StepOptions<E> {
    pub fn new() -> Self {
        Self {
            key: StepKey::Id,
            ttl: None,
            out: None,
            retry: None,
            timeout: None,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = StepKey::Custom(key.into());
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.key = StepKey::Disabled;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn out(mut self, slot: impl Into<String>) -> Self {
        self.out = Some(slot.into());
        self
    }

    pub fn retry(mut self, retry: RetryOptions<E>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn timeout(mut self, timeout: TimeoutOptions<E>) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shorthand for an error-policy timeout.
    pub fn timeout_after(self, duration: Duration) -> Self {
        self.timeout(TimeoutOptions::error(duration))
    }

    pub(crate) fn resolve_key(&self, id: &str) -> Option<String> {
        match &self.key {
            StepKey::Id => Some(id.to_string()),
            StepKey::Custom(key) => Some(key.clone()),
            StepKey::Disabled => None,
        }
    }
}

impl<E> Default for StepOptions<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for StepOptions<E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            ttl: self.ttl,
            out: self.out.clone(),
            retry: self.retry.clone(),
            timeout: self.timeout.clone(),
        }
    }
}

impl<E> std::fmt::Debug for StepOptions<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepOptions")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("out", &self.out)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_resolution() {
        let opts: StepOptions<()> = StepOptions::new();
        assert_eq!(opts.resolve_key("fetch"), Some("fetch".to_string()));
        assert_eq!(
            StepOptions::<()>::new().key("user:1").resolve_key("fetch"),
            Some("user:1".to_string())
        );
        assert_eq!(StepOptions::<()>::new().no_cache().resolve_key("fetch"), None);
    }
}
