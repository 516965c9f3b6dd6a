//! Tunables for the telemetry pipeline
//!
//! Every field has a default, so a partial configuration (or none at all)
//! deserializes into a working pipeline.

use alloc::string::{String, ToString};

use embassy_time::Duration;
use serde::{Deserialize, Serialize};

use crate::time::{SECONDS_PER_DAY, SECONDS_PER_MINUTE};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Push channel topic carrying sensor readings
    pub topic: String,
    pub fetch: FetchConfig,
    pub retention: RetentionConfig,
    pub reconnect: ReconnectConfig,
    /// How often poll-only sensors are refreshed while live
    pub poll_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topic: "iot".to_string(),
            fetch: FetchConfig::default(),
            retention: RetentionConfig::default(),
            reconnect: ReconnectConfig::default(),
            poll_interval_secs: 60,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Breakpoints for choosing raw readings over pre-aggregated buckets
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct FetchConfig {
    /// Longest range fetched as raw readings (one request per sensor)
    pub raw_max_secs: u64,
    /// Longest bucketed range served with hourly buckets
    pub hourly_max_secs: u64,
    /// Longest bucketed range served with daily buckets; weekly beyond
    pub daily_max_secs: u64,
    /// Readings requested per sensor when bootstrapping a live view
    pub live_bootstrap_limit: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            raw_max_secs: 2 * SECONDS_PER_DAY,
            // Beyond a week so that 10-day views are still served hourly
            hourly_max_secs: 14 * SECONDS_PER_DAY,
            daily_max_secs: 60 * SECONDS_PER_DAY,
            live_bootstrap_limit: 500,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Age beyond which live buffers drop readings
    pub live_max_age_secs: u64,
    /// Hard per-sensor cap while live
    pub live_max_count: usize,
    /// Per-sensor cap for a ranged view that contains "now"
    pub spanning_max_count: usize,
    /// Soft per-sensor cap on stray live events outside a historical range
    pub historical_max_count: usize,
    /// Cadence of the live eviction sweep
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            live_max_age_secs: 30 * SECONDS_PER_MINUTE,
            live_max_count: 500,
            spanning_max_count: 5_000,
            historical_max_count: 500,
            sweep_interval_secs: 30,
        }
    }
}

impl RetentionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Give up after this many consecutive failed connections; retry forever when `None`
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Exponential backoff for the `attempt`-th consecutive failure (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let millis = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}
