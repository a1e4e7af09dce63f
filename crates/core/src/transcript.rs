//! Transcription output value types.

use serde::{Deserialize, Serialize};

/// One timed span of recognized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub text: String,
    /// Segment start, in milliseconds from the beginning of the input.
    #[serde(default, alias = "startTime")]
    pub start_ms: u64,
    /// Segment end, in milliseconds from the beginning of the input.
    #[serde(default, alias = "endTime")]
    pub end_ms: u64,
}

impl Segment {
    pub fn new(text: impl Into<String>, start_ms: u64, end_ms: u64) -> Self {
        Self {
            text: text.into(),
            start_ms,
            end_ms,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Terminal result of a successful job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionResult {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<Segment>,
    /// Detected or requested language, when the engine reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl TranscriptionResult {
    pub fn new(text: impl Into<String>, segments: Vec<Segment>) -> Self {
        Self {
            text: text.into(),
            segments,
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}
