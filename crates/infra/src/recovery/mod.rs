//! Failure classification, retry advice and circuit breaking.

pub mod breaker;
pub mod engine;
pub mod strategy;

pub use breaker::{BreakerWindow, CircuitBreaker};
pub use engine::{RecoveryHandler, RecoveryPolicyEngine, RecoveryStatistics, UNCODED};
pub use strategy::{ErrorClass, RecoveryAction, RecoveryStrategy, RetryPolicy, jittered_backoff};
