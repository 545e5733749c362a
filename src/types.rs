//! Shared data model: sessions, chunks, events, recording metadata and
//! timeline entries.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::constants::MAX_EVENT_TEXT_LEN;

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "abandoned" => Some(SessionStatus::Abandoned),
            _ => None,
        }
    }
}

/// One end-to-end verification attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start_time_ms: i64,
    pub end_time_ms: Option<i64>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Pending,
    Uploaded,
    Failed,
}

/// Where the bytes of a queued chunk currently live
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPayload {
    Memory(Bytes),
    /// Spilled to local disk because the upload queue exceeded its in-memory cap
    Spilled(PathBuf),
}

/// A fixed-duration segment of encoded media emitted by the capturer
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub session_id: String,
    pub chunk_index: u32,
    pub capture_start_ms: i64,
    pub duration_ms: u64,
    pub payload: ChunkPayload,
    pub upload_state: UploadState,
    pub attempts: u32,
}

impl Chunk {
    pub fn new(
        session_id: &str,
        chunk_index: u32,
        capture_start_ms: i64,
        duration_ms: u64,
        data: Bytes,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            chunk_index,
            capture_start_ms,
            duration_ms,
            payload: ChunkPayload::Memory(data),
            upload_state: UploadState::Pending,
            attempts: 0,
        }
    }
}

/// Stored chunk metadata, without the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub chunk_index: u32,
    pub capture_start_ms: i64,
    pub duration_ms: u64,
    pub size_bytes: u64,
}

/// Returned by capture stop and sent to the store on finalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSummary {
    pub total_chunks: u32,
    pub total_duration_ms: u64,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub session_id: String,
    pub total_chunks: u32,
    pub total_duration_ms: u64,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub merged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UiEvent,
    BackendDecision,
    SessionStarted,
    SessionCompleted,
    RecordingStarted,
    RecordingStopped,
    StepEntered,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Passed,
    Failed,
    Abandoned,
}

/// Typed event payloads, one fixed schema per event type.
///
/// Serialized adjacently tagged as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    UiEvent {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    BackendDecision {
        check: String,
        passed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
    },
    SessionStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow: Option<String>,
    },
    SessionCompleted {
        outcome: SessionOutcome,
    },
    RecordingStarted {
        chunk_duration_ms: u64,
    },
    RecordingStopped {
        total_chunks: u32,
        total_duration_ms: u64,
    },
    StepEntered {
        step: String,
    },
    Error {
        message: String,
    },
}

/// Payload rejected at the serialization boundary
#[derive(Debug, Clone, PartialEq)]
pub enum EventValidationError {
    EmptyField(&'static str),
    TooLong { field: &'static str, len: usize },
    ScoreOutOfRange(f64),
    /// `type`/`payload` pair that does not match any known schema
    Malformed(String),
}

impl fmt::Display for EventValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventValidationError::EmptyField(field) => write!(f, "Field '{}' must not be empty", field),
            EventValidationError::TooLong { field, len } => write!(
                f,
                "Field '{}' is {} bytes long (max {})",
                field, len, MAX_EVENT_TEXT_LEN
            ),
            EventValidationError::ScoreOutOfRange(score) => {
                write!(f, "Score {} is outside [0, 1]", score)
            }
            EventValidationError::Malformed(msg) => write!(f, "Malformed event: {}", msg),
        }
    }
}

impl std::error::Error for EventValidationError {}

fn check_text(field: &'static str, value: &str) -> Result<(), EventValidationError> {
    if value.trim().is_empty() {
        return Err(EventValidationError::EmptyField(field));
    }
    if value.len() > MAX_EVENT_TEXT_LEN {
        return Err(EventValidationError::TooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::UiEvent { .. } => EventType::UiEvent,
            EventKind::BackendDecision { .. } => EventType::BackendDecision,
            EventKind::SessionStarted { .. } => EventType::SessionStarted,
            EventKind::SessionCompleted { .. } => EventType::SessionCompleted,
            EventKind::RecordingStarted { .. } => EventType::RecordingStarted,
            EventKind::RecordingStopped { .. } => EventType::RecordingStopped,
            EventKind::StepEntered { .. } => EventType::StepEntered,
            EventKind::Error { .. } => EventType::Error,
        }
    }

    pub fn validate(&self) -> Result<(), EventValidationError> {
        match self {
            EventKind::UiEvent { name, target } => {
                check_text("name", name)?;
                if let Some(target) = target {
                    check_text("target", target)?;
                }
            }
            EventKind::BackendDecision { check, score, .. } => {
                check_text("check", check)?;
                if let Some(score) = score {
                    if !score.is_finite() || *score < 0.0 || *score > 1.0 {
                        return Err(EventValidationError::ScoreOutOfRange(*score));
                    }
                }
            }
            EventKind::SessionStarted { workflow } => {
                if let Some(workflow) = workflow {
                    check_text("workflow", workflow)?;
                }
            }
            EventKind::StepEntered { step } => check_text("step", step)?,
            EventKind::Error { message } => check_text("message", message)?,
            EventKind::SessionCompleted { .. }
            | EventKind::RecordingStarted { .. }
            | EventKind::RecordingStopped { .. } => {}
        }
        Ok(())
    }
}

/// A discrete, timestamped application event. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: Uuid,
    pub session_id: String,
    pub sequence_number: u64,
    pub timestamp_ms: i64,
    pub kind: EventKind,
}

/// Event as it travels in `events/batch` requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub timestamp_ms: i64,
    pub sequence_number: u64,
}

impl Event {
    pub fn to_wire(&self) -> WireEvent {
        let payload = match serde_json::to_value(&self.kind) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("payload").unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        };
        WireEvent {
            event_id: self.event_id,
            event_type: self.kind.event_type(),
            payload,
            timestamp_ms: self.timestamp_ms,
            sequence_number: self.sequence_number,
        }
    }

    /// Rebuild and validate an event received over the wire
    pub fn from_wire(session_id: &str, wire: WireEvent) -> Result<Self, EventValidationError> {
        let tagged = serde_json::json!({
            "type": wire.event_type,
            "payload": wire.payload,
        });
        let kind: EventKind = serde_json::from_value(tagged)
            .map_err(|e| EventValidationError::Malformed(e.to_string()))?;
        kind.validate()?;
        Ok(Self {
            event_id: wire.event_id,
            session_id: session_id.to_string(),
            sequence_number: wire.sequence_number,
            timestamp_ms: wire.timestamp_ms,
            kind,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub session_id: String,
    pub events: Vec<WireEvent>,
}

impl EventBatch {
    pub fn from_events(session_id: &str, events: &[Event]) -> Self {
        Self {
            session_id: session_id.to_string(),
            events: events.iter().map(Event::to_wire).collect(),
        }
    }
}

/// A single typed, timestamped record in the merged replay sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEntry {
    VideoChunk {
        timestamp_ms: i64,
        chunk_index: u32,
        duration_ms: u64,
    },
    RecordingStarted {
        timestamp_ms: i64,
    },
    RecordingEnded {
        timestamp_ms: i64,
    },
    UiEvent {
        timestamp_ms: i64,
        sequence_number: u64,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    BackendDecision {
        timestamp_ms: i64,
        sequence_number: u64,
        check: String,
        passed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
    },
    /// Lifecycle and diagnostic events (session, step, error)
    SessionEvent {
        timestamp_ms: i64,
        sequence_number: u64,
        event: EventKind,
    },
}

impl TimelineEntry {
    pub fn timestamp_ms(&self) -> i64 {
        match self {
            TimelineEntry::VideoChunk { timestamp_ms, .. }
            | TimelineEntry::RecordingStarted { timestamp_ms }
            | TimelineEntry::RecordingEnded { timestamp_ms }
            | TimelineEntry::UiEvent { timestamp_ms, .. }
            | TimelineEntry::BackendDecision { timestamp_ms, .. }
            | TimelineEntry::SessionEvent { timestamp_ms, .. } => *timestamp_ms,
        }
    }

    pub fn is_decision(&self) -> bool {
        matches!(self, TimelineEntry::BackendDecision { .. })
    }

    pub fn from_event(event: &Event) -> Self {
        match &event.kind {
            EventKind::UiEvent { name, target } => TimelineEntry::UiEvent {
                timestamp_ms: event.timestamp_ms,
                sequence_number: event.sequence_number,
                name: name.clone(),
                target: target.clone(),
            },
            EventKind::BackendDecision {
                check,
                passed,
                score,
            } => TimelineEntry::BackendDecision {
                timestamp_ms: event.timestamp_ms,
                sequence_number: event.sequence_number,
                check: check.clone(),
                passed: *passed,
                score: *score,
            },
            other => TimelineEntry::SessionEvent {
                timestamp_ms: event.timestamp_ms,
                sequence_number: event.sequence_number,
                event: other.clone(),
            },
        }
    }
}

/// Response of the timeline read endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineResponse {
    pub session_id: String,
    pub has_video: bool,
    pub video_ref: Option<String>,
    pub chunks_count: u32,
    pub events_count: u32,
    pub decisions_count: u32,
    pub recording_metadata: Option<RecordingMetadata>,
    pub chunks: Vec<ChunkInfo>,
    pub timeline: Vec<TimelineEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_event_shape() {
        let event = Event {
            event_id: Uuid::nil(),
            session_id: "sess_a".to_string(),
            sequence_number: 7,
            timestamp_ms: 1000,
            kind: EventKind::BackendDecision {
                check: "face_match".to_string(),
                passed: true,
                score: Some(0.93),
            },
        };
        let json = serde_json::to_value(event.to_wire()).unwrap();
        assert_eq!(json["type"], "backend_decision");
        assert_eq!(json["payload"]["check"], "face_match");
        assert_eq!(json["sequence_number"], 7);

        let wire: WireEvent = serde_json::from_value(json).unwrap();
        let back = Event::from_wire("sess_a", wire).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_from_wire_rejects_mismatched_payload() {
        let wire = WireEvent {
            event_id: Uuid::new_v4(),
            event_type: EventType::StepEntered,
            payload: serde_json::json!({"check": "ocr", "passed": true}),
            timestamp_ms: 0,
            sequence_number: 0,
        };
        assert!(matches!(
            Event::from_wire("s", wire),
            Err(EventValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_validate_score_bounds() {
        let kind = EventKind::BackendDecision {
            check: "liveness".to_string(),
            passed: false,
            score: Some(1.5),
        };
        assert_eq!(kind.validate(), Err(EventValidationError::ScoreOutOfRange(1.5)));

        let kind = EventKind::BackendDecision {
            check: "liveness".to_string(),
            passed: false,
            score: Some(1.0),
        };
        assert!(kind.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_name() {
        let kind = EventKind::UiEvent {
            name: "  ".to_string(),
            target: None,
        };
        assert_eq!(kind.validate(), Err(EventValidationError::EmptyField("name")));
    }
}
