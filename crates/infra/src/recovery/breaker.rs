//! Process-wide circuit breaker.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scribeflow_core::clock::elapsed;

/// How failures are counted toward the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerWindow {
    /// Every failure since the breaker last closed counts. A burst followed by
    /// a long quiet period still trips on the next failure past the threshold.
    Cumulative,
    /// Only failures within the trailing window count.
    Sliding(Duration),
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    window: BreakerWindow,
    failures: VecDeque<DateTime<Utc>>,
    cumulative: u64,
    opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration, window: BreakerWindow) -> Self {
        Self {
            threshold,
            reset_timeout,
            window,
            failures: VecDeque::new(),
            cumulative: 0,
            opened_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    /// Whether an open breaker has been open longer than the reset timeout.
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.opened_at
            .is_some_and(|at| elapsed(at, now) > self.reset_timeout)
    }

    /// Record a failure; returns `true` if the count now exceeds the threshold.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        match self.window {
            BreakerWindow::Cumulative => self.cumulative += 1,
            BreakerWindow::Sliding(window) => {
                self.failures.push_back(now);
                while self
                    .failures
                    .front()
                    .is_some_and(|&t| elapsed(t, now) >= window)
                {
                    self.failures.pop_front();
                }
            }
        }
        self.failure_count() > u64::from(self.threshold)
    }

    pub fn failure_count(&self) -> u64 {
        match self.window {
            BreakerWindow::Cumulative => self.cumulative,
            BreakerWindow::Sliding(_) => self.failures.len() as u64,
        }
    }

    pub fn open(&mut self, now: DateTime<Utc>) {
        self.opened_at = Some(now);
    }

    /// Close the breaker and forget counted failures.
    pub fn close(&mut self) {
        self.opened_at = None;
        self.failures.clear();
        self.cumulative = 0;
    }
}
