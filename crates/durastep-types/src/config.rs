//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls retry
//! defaults, snapshot handling and stream flow control. All fields have
//! sensible defaults so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryDefaults,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `d`
    Fixed,
    /// `d * attempt`
    Linear,
    /// `d * 2^(attempt - 1)`
    #[default]
    Exponential,
}

/// Defaults applied to `RetryOptions` built from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDefaults {
    /// Total attempts including the first execution.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter: bool,
}

fn default_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: None,
            jitter: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// What to do with step values JSON cannot represent faithfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossyValuePolicy {
    /// Do not inspect values.
    Off,
    /// Record one warning per offending step.
    #[default]
    Warn,
    /// Fail snapshot serialization.
    Strict,
}

/// What to do when a restored snapshot was produced by different workflow code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftPolicy {
    #[default]
    Warn,
    Error,
    Ignore,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub lossy_values: LossyValuePolicy,
    #[serde(default)]
    pub drift_policy: DriftPolicy,
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Flow-control and polling settings for streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Writers pause once this many items are buffered and unconsumed.
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall reader timeout while no items arrive.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
}

fn default_high_water_mark() -> usize {
    16
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_read_batch_size() -> usize {
    64
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            high_water_mark: default_high_water_mark(),
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            read_batch_size: default_read_batch_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.snapshot.lossy_values, LossyValuePolicy::Warn);
        assert_eq!(config.stream.high_water_mark, 16);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let toml_str = r#"
[retry]
attempts = 5
backoff = "linear"
max_delay_ms = 2000

[snapshot]
drift_policy = "error"

[stream]
high_water_mark = 4
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.backoff, BackoffStrategy::Linear);
        assert_eq!(config.retry.initial_delay_ms, 100);
        assert_eq!(config.retry.max_delay_ms, Some(2000));
        assert_eq!(config.snapshot.drift_policy, DriftPolicy::Error);
        assert_eq!(config.snapshot.lossy_values, LossyValuePolicy::Warn);
        assert_eq!(config.stream.high_water_mark, 4);
        assert_eq!(config.stream.poll_interval_ms, 50);
    }
}
