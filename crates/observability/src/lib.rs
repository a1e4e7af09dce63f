//! Tracing and logging (shared setup).

/// Subscriber installation and output formats.
pub mod logging;

pub use logging::{LOG_FORMAT_ENV, LogFormat, UnknownLogFormat, init, init_with};
