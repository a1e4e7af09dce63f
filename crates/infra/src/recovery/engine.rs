//! Recovery policy engine: failure classification plus the circuit breaker.
//!
//! The engine is advisory. It decides a strategy and a backoff delay; the
//! caller owns the retry loop (re-dispatch under a fresh job id, sleep).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use scribeflow_core::error::normalize_code;
use scribeflow_core::{Clock, InferenceError};

use crate::config::RecoveryConfig;
use crate::jobs::JobMetadata;

use super::breaker::CircuitBreaker;
use super::strategy::{ErrorClass, RecoveryStrategy, jittered_backoff};

/// Custom classification for one error code.
pub type RecoveryHandler =
    Arc<dyn Fn(&InferenceError, &JobMetadata) -> RecoveryStrategy + Send + Sync>;

/// Key under which errors without a code are counted.
pub const UNCODED: &str = "UNKNOWN";

/// Recovery engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryStatistics {
    pub total_errors: u64,
    pub errors_by_code: BTreeMap<String, u64>,
    pub errors_by_class: BTreeMap<ErrorClass, u64>,
    pub circuit_breaker_open: bool,
    pub circuit_opened_at: Option<DateTime<Utc>>,
    /// Failures currently counted toward the breaker threshold.
    pub breaker_failures: u64,
}

struct EngineState {
    breaker: CircuitBreaker,
    total_errors: u64,
    errors_by_code: BTreeMap<String, u64>,
    errors_by_class: BTreeMap<ErrorClass, u64>,
}

pub struct RecoveryPolicyEngine {
    config: RecoveryConfig,
    clock: Arc<dyn Clock>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    handlers: RwLock<HashMap<String, RecoveryHandler>>,
    state: Mutex<EngineState>,
}

impl core::fmt::Debug for RecoveryPolicyEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecoveryPolicyEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RecoveryPolicyEngine {
    /// Engine with an entropy-seeded random source.
    pub fn new(config: RecoveryConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_rng(config, clock, Box::new(StdRng::from_entropy()))
    }

    /// Engine with an explicit random source (deterministic jitter in tests).
    pub fn with_rng(
        config: RecoveryConfig,
        clock: Arc<dyn Clock>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        let breaker = new_breaker(&config);
        Self {
            config,
            clock,
            rng: Mutex::new(rng),
            handlers: RwLock::new(HashMap::new()),
            state: Mutex::new(EngineState {
                breaker,
                total_errors: 0,
                errors_by_code: BTreeMap::new(),
                errors_by_class: BTreeMap::new(),
            }),
        }
    }

    /// Decide how to recover from `error` for the job described by `job`.
    pub fn handle(&self, error: &InferenceError, job: &JobMetadata) -> RecoveryStrategy {
        let now = self.clock.now();
        let code = error.normalized_code();

        {
            let mut state = self.lock_state();
            state.total_errors += 1;
            *state
                .errors_by_code
                .entry(code.clone().unwrap_or_else(|| UNCODED.to_string()))
                .or_default() += 1;

            if state.breaker.is_open() {
                if !state.breaker.cooldown_elapsed(now) {
                    debug!(job_id = %job.job_id, error = %error, "circuit open, failing fast");
                    return RecoveryStrategy::cancel();
                }
                state.breaker.close();
                info!("circuit breaker closed after cooldown");
            }

            if state.breaker.record_failure(now) {
                state.breaker.open(now);
                warn!(
                    job_id = %job.job_id,
                    failures = state.breaker.failure_count(),
                    threshold = self.config.failure_threshold,
                    "circuit breaker opened"
                );
                return RecoveryStrategy::cancel();
            }
        }

        let class = self.classify(error);
        *self.lock_state().errors_by_class.entry(class).or_default() += 1;

        let handler = code
            .as_ref()
            .and_then(|c| self.read_handlers().get(c).cloned());
        let strategy = match handler {
            Some(handler) => handler(error, job),
            None => class.default_strategy(),
        };

        debug!(
            job_id = %job.job_id,
            error = %error,
            class = class.as_str(),
            action = ?strategy.action,
            "recovery strategy chosen"
        );
        strategy
    }

    /// Failure class the default heuristic assigns to `error`.
    pub fn classify(&self, error: &InferenceError) -> ErrorClass {
        ErrorClass::of(error)
    }

    /// Whether the job has retries left.
    pub fn should_retry(&self, job: &JobMetadata) -> bool {
        job.retry_count < job.max_retries
    }

    /// `initial × 2^retry_count`, jittered by a factor in `[0.5, 1.0]`, clamped
    /// to `max_delay`.
    pub fn calculate_backoff_delay(
        &self,
        retry_count: u32,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        jittered_backoff(retry_count, 2.0, initial_delay, max_delay, &mut **rng)
    }

    /// Delay before the next retry of `job` under `strategy`, if it retries.
    pub fn delay_for(&self, strategy: &RecoveryStrategy, job: &JobMetadata) -> Option<Duration> {
        let policy = strategy.retry?;
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Some(policy.delay_for(job.retry_count, &mut **rng))
    }

    /// Override classification for errors whose normalized code is `code`.
    pub fn register_handler<F>(&self, code: &str, handler: F)
    where
        F: Fn(&InferenceError, &JobMetadata) -> RecoveryStrategy + Send + Sync + 'static,
    {
        let Some(key) = normalize_code(code) else {
            warn!(code, "ignoring recovery handler for blank error code");
            return;
        };
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::new(handler));
    }

    pub fn is_circuit_open(&self) -> bool {
        self.lock_state().breaker.is_open()
    }

    pub fn statistics(&self) -> RecoveryStatistics {
        let state = self.lock_state();
        RecoveryStatistics {
            total_errors: state.total_errors,
            errors_by_code: state.errors_by_code.clone(),
            errors_by_class: state.errors_by_class.clone(),
            circuit_breaker_open: state.breaker.is_open(),
            circuit_opened_at: state.breaker.opened_at(),
            breaker_failures: state.breaker.failure_count(),
        }
    }

    /// Zero all counters and close the breaker.
    pub fn reset_statistics(&self) {
        let mut state = self.lock_state();
        state.total_errors = 0;
        state.errors_by_code.clear();
        state.errors_by_class.clear();
        state.breaker = new_breaker(&self.config);
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_handlers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RecoveryHandler>> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner())
    }
}

fn new_breaker(config: &RecoveryConfig) -> CircuitBreaker {
    CircuitBreaker::new(
        config.failure_threshold,
        config.reset_timeout(),
        config.window(),
    )
}
