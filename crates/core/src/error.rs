//! Error model shared by the orchestration crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core-level error.
///
/// Deterministic failures only (validation, identifiers). Engine failures are
/// carried by [`InferenceError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }}

/// Failure reported by the external inference engine (or synthesized by the
/// orchestration layer, e.g. on deadline expiry).
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct InferenceError {
    /// Engine-specific error code, if the engine supplied one.
    pub code: Option<String>,
    pub message: String,
}

impl InferenceError {
    /// Message used when the engine reports an error without a description.
    pub const UNKNOWN_MESSAGE: &'static str = "unknown error";

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN_MESSAGE)
    }

    /// Error code in canonical form: upper-case, non-alphanumerics mapped to `_`.
    ///
    /// `"network-timeout"` and `"Network Timeout"` both normalize to
    /// `"NETWORK_TIMEOUT"`. Returns `None` if the error carries no code or the
    /// code is blank.
    pub fn normalized_code(&self) -> Option<String> {
        self.code.as_deref().and_then(normalize_code)
    }
}

/// Normalize an error code for handler lookup.
pub fn normalize_code(code: &str) -> Option<String> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        trimmed
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect(),
    )
}
