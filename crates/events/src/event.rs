//! Typed notifications emitted by the inference engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scribeflow_core::{InferenceError, JobId, Segment, TranscriptionResult};

/// Discriminant of a [`NativeEvent`], used for deduplication and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Segment,
    Complete,
    Error,
    Cancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::Segment => "segment",
            EventKind::Complete => "complete",
            EventKind::Error => "error",
            EventKind::Cancelled => "cancelled",
        }
    }

    /// Parse a wire event type. Returns `None` for unknown types.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "progress" => Some(EventKind::Progress),
            "segment" => Some(EventKind::Segment),
            "complete" => Some(EventKind::Complete),
            "error" => Some(EventKind::Error),
            "cancelled" => Some(EventKind::Cancelled),
            _ => None,
        }
    }

    /// Whether an event of this kind ends the job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Complete | EventKind::Error | EventKind::Cancelled
        )
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated payload, one shape per event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// Percentage, finite. Clamping to 0..=100 happens in the registry.
    Progress(f64),
    Segment(Segment),
    Complete(TranscriptionResult),
    Error(InferenceError),
    Cancelled,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Progress(_) => EventKind::Progress,
            EventPayload::Segment(_) => EventKind::Segment,
            EventPayload::Complete(_) => EventKind::Complete,
            EventPayload::Error(_) => EventKind::Error,
            EventPayload::Cancelled => EventKind::Cancelled,
        }
    }
}

/// A notification from the engine, tagged with the originating job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeEvent {
    job_id: JobId,
    payload: EventPayload,
    timestamp: DateTime<Utc>,
}

impl NativeEvent {
    pub fn new(job_id: JobId, payload: EventPayload, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id,
            payload,
            timestamp,
        }
    }

    pub fn progress(job_id: JobId, progress: f64, timestamp: DateTime<Utc>) -> Self {
        Self::new(job_id, EventPayload::Progress(progress), timestamp)
    }

    pub fn segment(job_id: JobId, segment: Segment, timestamp: DateTime<Utc>) -> Self {
        Self::new(job_id, EventPayload::Segment(segment), timestamp)
    }

    pub fn complete(job_id: JobId, result: TranscriptionResult, timestamp: DateTime<Utc>) -> Self {
        Self::new(job_id, EventPayload::Complete(result), timestamp)
    }

    pub fn error(job_id: JobId, error: InferenceError, timestamp: DateTime<Utc>) -> Self {
        Self::new(job_id, EventPayload::Error(error), timestamp)
    }

    pub fn cancelled(job_id: JobId, timestamp: DateTime<Utc>) -> Self {
        Self::new(job_id, EventPayload::Cancelled, timestamp)
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn into_payload(self) -> EventPayload {
        self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_payload() {
        let job = JobId::new();
        let now = Utc::now();
        assert_eq!(NativeEvent::progress(job, 10.0, now).kind(), EventKind::Progress);
        assert_eq!(NativeEvent::cancelled(job, now).kind(), EventKind::Cancelled);
        assert!(EventKind::Error.is_terminal());
        assert!(!EventKind::Segment.is_terminal());
    }

    #[test]
    fn wire_names_parse_back() {
        for kind in [
            EventKind::Progress,
            EventKind::Segment,
            EventKind::Complete,
            EventKind::Error,
            EventKind::Cancelled,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("paused"), None);
    }
}
