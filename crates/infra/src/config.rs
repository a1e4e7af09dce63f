//! Configuration loading and representation.
//!
//! Defaults match the documented constants; `from_env` overlays `SCRIBEFLOW_*`
//! variables, `from_json_str` loads a (partial) JSON document.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::jobs::{DEFAULT_MAX_RETRIES, JobOptions};
use crate::recovery::BreakerWindow;

/// Task registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub default_max_retries: u32,
    /// Per-job deadline applied to every registration; `None` disables it.
    pub default_deadline_secs: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_deadline_secs: None,
        }
    }
}

impl RegistryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline_secs = Some(deadline.as_secs());
        self
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            max_retries: self.default_max_retries,
            deadline: self.default_deadline_secs.map(Duration::from_secs),
            ..JobOptions::default()
        }
    }
}

/// Resource pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Soft cap on resources per class.
    pub max_per_class: usize,
    /// Resources older than this are never handed out again.
    pub max_age_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_class: 5,
            max_age_secs: 60 * 60,
        }
    }
}

impl PoolConfig {
    pub fn with_max_per_class(mut self, max: usize) -> Self {
        self.max_per_class = max;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = max_age.as_secs();
        self
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Event router settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub dedup_window_ms: u64,
    /// Events retained per job.
    pub history_limit: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 100,
            history_limit: scribeflow_events::DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl RouterConfig {
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

/// Recovery engine and circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// The breaker opens once the failure count exceeds this value.
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    /// Count failures over a sliding window of this many seconds instead of
    /// cumulatively.
    pub breaker_window_secs: Option<u64>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 60,
            breaker_window_secs: None,
        }
    }
}

impl RecoveryConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_sliding_window(mut self, window: Duration) -> Self {
        self.breaker_window_secs = Some(window.as_secs());
        self
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    pub fn window(&self) -> BreakerWindow {
        match self.breaker_window_secs {
            Some(secs) => BreakerWindow::Sliding(Duration::from_secs(secs)),
            None => BreakerWindow::Cumulative,
        }
    }
}

/// Settings for every orchestration component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub registry: RegistryConfig,
    pub pool: PoolConfig,
    pub router: RouterConfig,
    pub recovery: RecoveryConfig,
}

impl OrchestratorConfig {
    /// Defaults overlaid with `SCRIBEFLOW_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("failed to parse orchestrator config JSON")
    }

    /// Overlay values from `lookup` (an environment-like key/value source).
    /// Unparsable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_value(&lookup, "SCRIBEFLOW_MAX_RETRIES", &mut self.registry.default_max_retries);
        override_optional(&lookup, "SCRIBEFLOW_JOB_DEADLINE_SECS", &mut self.registry.default_deadline_secs);
        override_value(&lookup, "SCRIBEFLOW_POOL_MAX_PER_CLASS", &mut self.pool.max_per_class);
        override_value(&lookup, "SCRIBEFLOW_POOL_MAX_AGE_SECS", &mut self.pool.max_age_secs);
        override_value(&lookup, "SCRIBEFLOW_DEDUP_WINDOW_MS", &mut self.router.dedup_window_ms);
        override_value(&lookup, "SCRIBEFLOW_EVENT_HISTORY_LIMIT", &mut self.router.history_limit);
        override_value(&lookup, "SCRIBEFLOW_BREAKER_THRESHOLD", &mut self.recovery.failure_threshold);
        override_value(&lookup, "SCRIBEFLOW_BREAKER_RESET_SECS", &mut self.recovery.reset_timeout_secs);
        override_optional(&lookup, "SCRIBEFLOW_BREAKER_WINDOW_SECS", &mut self.recovery.breaker_window_secs);
    }
}

fn override_value<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T)
where
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "ignoring unparsable config override"),
        }
    }
}

fn override_optional<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Option<T>)
where
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = Some(value),
            Err(_) => warn!(key, value = %raw, "ignoring unparsable config override"),
        }
    }
}
