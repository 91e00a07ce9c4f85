//! Webhook payload normalization
//!
//! Provider webhooks arrive as JSON or as form fields, with the provider's
//! field names (`CallSid`, `TranscriptionData`, ...) or the camelCase names
//! (`callId`, `data`, ...). Everything is first flattened into one field map
//! and then parsed into [`InboundEvent`]; nothing past this module sees the
//! wire shape.

use callhub_common::events::{CallStatus, Speaker, TranscriptFragment};
use callhub_common::time::parse_rfc3339;
use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;

/// Webhook body flattened to named fields
pub type FieldMap = Map<String, Value>;

const CALL_ID: &[&str] = &["callId", "call_id", "CallSid", "callSid"];
const STREAM_ID: &[&str] = &["streamId", "stream_id", "StreamSid", "streamSid"];
const EVENT: &[&str] = &["event", "Event"];
const STREAM_EVENT: &[&str] = &["event", "Event", "StreamEvent"];
const TRANSCRIPTION_EVENT: &[&str] = &["event", "TranscriptionEvent"];
const STATUS: &[&str] = &["status", "CallStatus", "callStatus"];
const TRACK: &[&str] = &["track", "Track"];
const FINAL: &[&str] = &["final", "Final", "isFinal", "is_final"];
const DATA: &[&str] = &["data", "TranscriptionData"];
const TRANSCRIPT: &[&str] = &["transcript", "Transcript", "text"];
const CONFIDENCE: &[&str] = &["confidence", "Confidence"];
const TIMESTAMP: &[&str] = &["timestamp", "Timestamp"];
const RECORDING_ID: &[&str] = &["recordingId", "recording_id", "RecordingSid"];
const RECORDING_URL: &[&str] = &["recordingUrl", "recording_url", "RecordingUrl"];
const RECORDING_STATUS: &[&str] = &["status", "RecordingStatus"];
const RECORDING_DURATION: &[&str] = &["duration", "RecordingDuration"];

/// Why a payload could not be turned into an event
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PayloadError {
    #[error("unreadable body: {0}")]
    Body(String),

    #[error("body is not an object")]
    NotAnObject,

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unattributable track {0:?}")]
    UnknownTrack(String),
}

/// Provider call status, split into terminal and informational
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Terminal(CallStatus),
    NonTerminal(String),
}

impl ProviderStatus {
    pub fn parse(status: &str) -> Self {
        match CallStatus::from_provider(status) {
            Some(terminal) => ProviderStatus::Terminal(terminal),
            None => ProviderStatus::NonTerminal(status.to_string()),
        }
    }
}

/// Every event kind ingestion understands
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    StreamStarted { call_id: String, stream_id: Option<String> },
    StreamMedia { call_id: String },
    StreamStopped { call_id: String },
    Status { call_id: String, status: ProviderStatus },
    TranscriptionStarted { call_id: String },
    TranscriptionStopped { call_id: String },
    Transcript { call_id: String, fragment: TranscriptFragment },
    /// Well-formed envelope with an event kind we do not handle
    Unrecognized { kind: String },
}

impl InboundEvent {
    pub fn call_id(&self) -> Option<&str> {
        match self {
            InboundEvent::StreamStarted { call_id, .. }
            | InboundEvent::StreamMedia { call_id }
            | InboundEvent::StreamStopped { call_id }
            | InboundEvent::Status { call_id, .. }
            | InboundEvent::TranscriptionStarted { call_id }
            | InboundEvent::TranscriptionStopped { call_id }
            | InboundEvent::Transcript { call_id, .. } => Some(call_id),
            InboundEvent::Unrecognized { .. } => None,
        }
    }
}

/// Recording status callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingCallback {
    pub call_id: String,
    pub recording_id: String,
    pub recording_url: String,
    pub status: String,
    pub duration_secs: Option<u32>,
}

impl RecordingCallback {
    /// Only completed recordings start the pipeline
    pub fn is_completed(&self) -> bool {
        self.status.eq_ignore_ascii_case("completed")
    }
}

/// Client session-create request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub call_id: String,
    pub lead_id: Option<String>,
    pub owner_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Field access
// ---------------------------------------------------------------------------

fn lookup<'a>(fields: &'a FieldMap, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| fields.get(*name)).filter(|v| !v.is_null())
}

fn string_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_field(fields: &FieldMap, names: &[&str]) -> Option<String> {
    lookup(fields, names).and_then(string_of)
}

/// Look in the top level, then inside a nested object such as `start`/`stop`
fn text_field_nested(fields: &FieldMap, nested: &[&str], names: &[&str]) -> Option<String> {
    text_field(fields, names).or_else(|| {
        nested.iter().find_map(|key| match fields.get(*key) {
            Some(Value::Object(inner)) => text_field(inner, names),
            _ => None,
        })
    })
}

fn bool_field(fields: &FieldMap, names: &[&str], field: &'static str) -> Result<Option<bool>, PayloadError> {
    match lookup(fields, names) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            other => Err(PayloadError::InvalidField {
                field,
                reason: format!("not a boolean: {}", other),
            }),
        },
        Some(Value::Number(n)) => Ok(Some(n.as_i64() == Some(1))),
        Some(other) => Err(PayloadError::InvalidField {
            field,
            reason: format!("not a boolean: {}", other),
        }),
    }
}

fn number_field(fields: &FieldMap, names: &[&str]) -> Option<f64> {
    match lookup(fields, names)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn required_call_id(fields: &FieldMap, nested: &[&str]) -> Result<String, PayloadError> {
    text_field_nested(fields, nested, CALL_ID).ok_or(PayloadError::MissingField("callId"))
}

// ---------------------------------------------------------------------------
// Event parsers
// ---------------------------------------------------------------------------

/// Parse a media-stream lifecycle event
pub fn parse_stream_event(fields: &FieldMap) -> Result<InboundEvent, PayloadError> {
    let kind = text_field(fields, STREAM_EVENT).ok_or(PayloadError::MissingField("event"))?;
    let nested = ["start", "stop", "media"];

    let event = match kind.as_str() {
        "start" | "stream-started" => InboundEvent::StreamStarted {
            call_id: required_call_id(fields, &nested)?,
            stream_id: text_field_nested(fields, &nested, STREAM_ID),
        },
        "media" => InboundEvent::StreamMedia {
            call_id: required_call_id(fields, &nested)?,
        },
        "stop" | "stream-stopped" => InboundEvent::StreamStopped {
            call_id: required_call_id(fields, &nested)?,
        },
        _ => InboundEvent::Unrecognized { kind },
    };
    Ok(event)
}

/// Parse a call status callback
pub fn parse_status_callback(fields: &FieldMap) -> Result<InboundEvent, PayloadError> {
    let call_id = required_call_id(fields, &[])?;
    let status = text_field(fields, STATUS).ok_or(PayloadError::MissingField("status"))?;
    Ok(InboundEvent::Status {
        call_id,
        status: ProviderStatus::parse(&status),
    })
}

/// Parse a transcription event (either payload envelope)
pub fn parse_transcription_event(fields: &FieldMap) -> Result<InboundEvent, PayloadError> {
    let call_id = required_call_id(fields, &[])?;
    let kind = text_field(fields, TRANSCRIPTION_EVENT)
        .or_else(|| text_field(fields, EVENT))
        .unwrap_or_else(|| "transcription-content".to_string());

    match kind.as_str() {
        "transcription-started" => Ok(InboundEvent::TranscriptionStarted { call_id }),
        "transcription-stopped" => Ok(InboundEvent::TranscriptionStopped { call_id }),
        "transcription-content" | "transcript" | "content" => {
            let fragment = parse_fragment(fields)?;
            Ok(InboundEvent::Transcript { call_id, fragment })
        }
        _ => Ok(InboundEvent::Unrecognized { kind }),
    }
}

/// Normalize the fragment from a nested `data` object/JSON string or flat fields
fn parse_fragment(fields: &FieldMap) -> Result<TranscriptFragment, PayloadError> {
    let track = text_field(fields, TRACK).ok_or(PayloadError::MissingField("track"))?;
    let speaker = Speaker::from_track(&track).ok_or(PayloadError::UnknownTrack(track))?;
    let is_final = bool_field(fields, FINAL, "final")?.unwrap_or(false);

    let nested: Option<FieldMap> = match lookup(fields, DATA) {
        Some(Value::Object(map)) => Some(map.clone()),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Some(map),
            Ok(_) => {
                return Err(PayloadError::InvalidField {
                    field: "data",
                    reason: "not a JSON object".to_string(),
                })
            }
            Err(e) => {
                return Err(PayloadError::InvalidField {
                    field: "data",
                    reason: e.to_string(),
                })
            }
        },
        Some(_) => {
            return Err(PayloadError::InvalidField {
                field: "data",
                reason: "unsupported type".to_string(),
            })
        }
        None => None,
    };
    let source = nested.as_ref().unwrap_or(fields);

    let content = text_field(source, TRANSCRIPT).ok_or(PayloadError::MissingField("transcript"))?;
    let confidence = number_field(source, CONFIDENCE).filter(|c| c.is_finite() && (0.0..=1.0).contains(c));
    let timestamp = text_field(fields, TIMESTAMP)
        .as_deref()
        .and_then(parse_rfc3339)
        .unwrap_or_else(Utc::now);

    Ok(TranscriptFragment {
        speaker,
        content,
        timestamp,
        is_final,
        confidence,
    })
}

/// Parse a recording status callback
pub fn parse_recording_callback(fields: &FieldMap) -> Result<RecordingCallback, PayloadError> {
    let call_id = required_call_id(fields, &[])?;
    let recording_id = text_field(fields, RECORDING_ID).ok_or(PayloadError::MissingField("recordingId"))?;
    let status = text_field(fields, RECORDING_STATUS).ok_or(PayloadError::MissingField("status"))?;
    let recording_url = text_field(fields, RECORDING_URL).unwrap_or_default();

    let callback = RecordingCallback {
        call_id,
        recording_id,
        recording_url,
        status,
        duration_secs: number_field(fields, RECORDING_DURATION)
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(|d| d.round() as u32),
    };

    if callback.is_completed() && callback.recording_url.is_empty() {
        return Err(PayloadError::MissingField("recordingUrl"));
    }
    Ok(callback)
}

/// Parse a client session-create request
pub fn parse_session_request(fields: &FieldMap) -> Result<SessionRequest, PayloadError> {
    Ok(SessionRequest {
        call_id: required_call_id(fields, &[])?,
        lead_id: text_field(fields, &["leadId", "lead_id"]),
        owner_id: text_field(fields, &["ownerId", "owner_id"]),
    })
}
