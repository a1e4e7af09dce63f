//! Recovery strategies, the error taxonomy, and backoff computation.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use scribeflow_core::InferenceError;

/// What the caller should do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-dispatch under a fresh job id after the computed delay
    Retry,
    /// Drop this item and continue the larger operation
    Skip,
    /// Give up on the task
    Cancel,
    /// Re-dispatch with a fallback configuration (e.g. a smaller model)
    Fallback,
}

/// Retry parameters attached to a `Retry` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for transient (network/timeout) failures.
    pub fn transient() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }

    /// Conservative single retry for unclassified failures.
    pub fn conservative() -> Self {
        Self {
            max_retries: 1,
            backoff_multiplier: 2.0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5_000),
        }
    }

    /// Whether another attempt is allowed after `retry_count` retries.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Jittered delay before retry number `retry_count` (0-indexed).
    pub fn delay_for<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        jittered_backoff(
            retry_count,
            self.backoff_multiplier,
            self.initial_delay,
            self.max_delay,
            rng,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transient()
    }
}

/// Advice returned by the recovery engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub action: RecoveryAction,
    /// Present for `Retry` (and optionally `Fallback`).
    pub retry: Option<RetryPolicy>,
}

impl RecoveryStrategy {
    pub fn retry(policy: RetryPolicy) -> Self {
        Self {
            action: RecoveryAction::Retry,
            retry: Some(policy),
        }
    }

    pub fn skip() -> Self {
        Self {
            action: RecoveryAction::Skip,
            retry: None,
        }
    }

    pub fn cancel() -> Self {
        Self {
            action: RecoveryAction::Cancel,
            retry: None,
        }
    }

    pub fn fallback(policy: Option<RetryPolicy>) -> Self {
        Self {
            action: RecoveryAction::Fallback,
            retry: policy,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.action == RecoveryAction::Retry
    }
}

/// Failure taxonomy used by the default classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, network and other temporary conditions
    Transient,
    /// Out of memory; retrying fails the same way
    ResourceExhaustion,
    /// Invalid or malformed input
    Validation,
    NotFound,
    Unclassified,
}

impl ErrorClass {
    /// Classify by keywords in the lower-cased message.
    pub fn of(error: &InferenceError) -> Self {
        let message = error.message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

        if has(&["timeout", "network", "connection", "temporary"]) {
            ErrorClass::Transient
        } else if has(&["memory", "oom"]) {
            ErrorClass::ResourceExhaustion
        } else if has(&["invalid", "malformed"]) {
            ErrorClass::Validation
        } else if has(&["not found"]) {
            ErrorClass::NotFound
        } else {
            ErrorClass::Unclassified
        }
    }

    /// Default strategy for the class.
    pub fn default_strategy(&self) -> RecoveryStrategy {
        match self {
            ErrorClass::Transient => RecoveryStrategy::retry(RetryPolicy::transient()),
            ErrorClass::ResourceExhaustion => RecoveryStrategy::cancel(),
            ErrorClass::Validation => RecoveryStrategy::skip(),
            ErrorClass::NotFound => RecoveryStrategy::cancel(),
            ErrorClass::Unclassified => RecoveryStrategy::retry(RetryPolicy::conservative()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::ResourceExhaustion => "resource_exhaustion",
            ErrorClass::Validation => "validation",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Unclassified => "unclassified",
        }
    }
}

/// `initial × multiplier^retry_count`, scaled by a jitter factor drawn from
/// `[0.5, 1.0]`, clamped to `max_delay`.
pub fn jittered_backoff<R: Rng + ?Sized>(
    retry_count: u32,
    multiplier: f64,
    initial_delay: Duration,
    max_delay: Duration,
    rng: &mut R,
) -> Duration {
    let exponent = retry_count.min(i32::MAX as u32) as i32;
    let base_ms = initial_delay.as_millis() as f64 * multiplier.max(1.0).powi(exponent);
    let jitter: f64 = rng.gen_range(0.5..=1.0);
    let delay_ms = (base_ms * jitter).min(max_delay.as_millis() as f64);
    Duration::from_millis(delay_ms.max(0.0) as u64)
}
