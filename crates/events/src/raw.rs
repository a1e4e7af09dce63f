//! Boundary decoding of loosely-typed engine notifications.
//!
//! Native bridges hand over `{jobId, eventType, data, timestamp}` with an
//! untyped `data` field. Everything is validated here, once; a payload that
//! does not match its event type is rejected instead of coerced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use scribeflow_core::{InferenceError, JobId, Segment, TranscriptionResult};

use crate::event::{EventKind, EventPayload, NativeEvent};

/// An engine notification as it crosses the native boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNativeEvent {
    pub job_id: JobId,
    pub event_type: String,
    #[serde(default)]
    pub data: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl RawNativeEvent {
    pub fn new(
        job_id: JobId,
        event_type: impl Into<String>,
        data: JsonValue,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            event_type: event_type.into(),
            data,
            timestamp,
        }
    }
}

/// Why a raw notification was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDecodeError {
    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: EventKind, reason: String },
}

impl EventDecodeError {
    fn malformed(kind: EventKind, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            reason: reason.into(),
        }
    }
}

impl TryFrom<RawNativeEvent> for NativeEvent {
    type Error = EventDecodeError;

    fn try_from(raw: RawNativeEvent) -> Result<Self, Self::Error> {
        let kind = EventKind::parse(&raw.event_type)
            .ok_or_else(|| EventDecodeError::UnknownType(raw.event_type.clone()))?;
        let payload = decode_payload(kind, raw.data)?;
        Ok(NativeEvent::new(raw.job_id, payload, raw.timestamp))
    }
}

fn decode_payload(kind: EventKind, data: JsonValue) -> Result<EventPayload, EventDecodeError> {
    match kind {
        EventKind::Progress => {
            let value = data
                .as_f64()
                .ok_or_else(|| EventDecodeError::malformed(kind, "expected a number"))?;
            if !value.is_finite() {
                return Err(EventDecodeError::malformed(kind, "progress must be finite"));
            }
            Ok(EventPayload::Progress(value))
        }
        EventKind::Segment => serde_json::from_value::<Segment>(data)
            .map(EventPayload::Segment)
            .map_err(|e| EventDecodeError::malformed(kind, e.to_string())),
        EventKind::Complete => serde_json::from_value::<TranscriptionResult>(data)
            .map(EventPayload::Complete)
            .map_err(|e| EventDecodeError::malformed(kind, e.to_string())),
        EventKind::Error => Ok(EventPayload::Error(decode_error(data))),
        EventKind::Cancelled => Ok(EventPayload::Cancelled),
    }
}

/// Error payloads are best-effort: a string becomes the message, an object
/// may carry `code`/`message`, anything else yields the generic error.
fn decode_error(data: JsonValue) -> InferenceError {
    match data {
        JsonValue::String(message) if !message.trim().is_empty() => InferenceError::new(message),
        JsonValue::Object(map) => {
            let message = map
                .get("message")
                .and_then(JsonValue::as_str)
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(InferenceError::UNKNOWN_MESSAGE)
                .to_string();
            let code = map.get("code").and_then(|c| match c {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Number(n) => Some(n.to_string()),
                _ => None,
            });
            InferenceError { code, message }
        }
        _ => InferenceError::unknown(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(event_type: &str, data: JsonValue) -> RawNativeEvent {
        RawNativeEvent::new(JobId::new(), event_type, data, Utc::now())
    }

    #[test]
    fn numeric_progress_decodes() {
        let event = NativeEvent::try_from(raw("progress", json!(42))).unwrap();
        assert_eq!(event.payload(), &EventPayload::Progress(42.0));
    }

    #[test]
    fn non_numeric_progress_is_rejected() {
        let err = NativeEvent::try_from(raw("progress", json!("42"))).unwrap_err();
        assert!(matches!(
            err,
            EventDecodeError::Malformed {
                kind: EventKind::Progress,
                ..
            }
        ));
    }

    #[test]
    fn segment_accepts_native_field_names() {
        let event = NativeEvent::try_from(raw(
            "segment",
            json!({"text": "hello", "startTime": 0, "endTime": 1200}),
        ))
        .unwrap();
        match event.payload() {
            EventPayload::Segment(seg) => {
                assert_eq!(seg.text, "hello");
                assert_eq!(seg.end_ms, 1200);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn segment_without_text_is_rejected() {
        assert!(NativeEvent::try_from(raw("segment", json!({"startMs": 3}))).is_err());
    }

    #[test]
    fn error_payload_shapes() {
        let from_string = NativeEvent::try_from(raw("error", json!("network down"))).unwrap();
        assert_eq!(
            from_string.payload(),
            &EventPayload::Error(InferenceError::new("network down"))
        );

        let from_null = NativeEvent::try_from(raw("error", JsonValue::Null)).unwrap();
        assert_eq!(
            from_null.payload(),
            &EventPayload::Error(InferenceError::unknown())
        );

        let from_object =
            NativeEvent::try_from(raw("error", json!({"code": "E_OOM", "message": "oom"})))
                .unwrap();
        assert_eq!(
            from_object.payload(),
            &EventPayload::Error(InferenceError::with_code("E_OOM", "oom"))
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = NativeEvent::try_from(raw("paused", JsonValue::Null)).unwrap_err();
        assert_eq!(err, EventDecodeError::UnknownType("paused".to_string()));
    }

    #[test]
    fn raw_event_deserializes_from_bridge_json() {
        let id = JobId::new();
        let text = format!(
            r#"{{"jobId":"{id}","eventType":"complete","data":{{"text":"hi","segments":[]}},"timestamp":"2024-01-01T00:00:00Z"}}"#
        );
        let raw: RawNativeEvent = serde_json::from_str(&text).unwrap();
        let event = NativeEvent::try_from(raw).unwrap();
        assert_eq!(event.job_id(), id);
        assert_eq!(event.kind(), EventKind::Complete);
    }
}
