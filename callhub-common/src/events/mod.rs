//! Event types pushed to call observers
//!
//! Provides the closed set of observer messages plus the call vocabulary
//! (speakers, terminal statuses, transcript fragments) they carry.

mod call_types;

pub use call_types::{CallStatus, Speaker, TranscriptFragment};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages delivered to observers of a call session
///
/// This is a closed set: a new kind of update is a new variant here, never a
/// shape inferred at runtime. Serialized with a `type` tag that doubles as the
/// SSE event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverMessage {
    /// A transcript fragment was appended to the session
    Transcript {
        session_id: Uuid,
        call_id: String,
        speaker: Speaker,
        content: String,
        timestamp: DateTime<Utc>,
        is_final: bool,
        confidence: Option<f64>,
    },

    /// The call reached a terminal status
    SessionEnded {
        session_id: Uuid,
        call_id: String,
        status: CallStatus,
        timestamp: DateTime<Utc>,
    },

    /// The call recording was stored
    RecordingSaved {
        session_id: Uuid,
        call_id: String,
        filename: String,
        storage_ref: String,
        /// Recording length in seconds, when the provider reported it
        duration_secs: Option<u32>,
        timestamp: DateTime<Utc>,
    },

    /// Downstream inbox reprocessing answered
    ProcessingComplete {
        session_id: Uuid,
        call_id: String,
        result: serde_json::Value,
        timestamp: DateTime<Utc>,
    },

    /// Advice produced by the coaching collaborator
    CoachingTip {
        session_id: Uuid,
        call_id: String,
        tip: String,
        category: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl ObserverMessage {
    /// Build a transcript message from a fragment
    pub fn transcript(session_id: Uuid, call_id: &str, fragment: &TranscriptFragment) -> Self {
        ObserverMessage::Transcript {
            session_id,
            call_id: call_id.to_string(),
            speaker: fragment.speaker,
            content: fragment.content.clone(),
            timestamp: fragment.timestamp,
            is_final: fragment.is_final,
            confidence: fragment.confidence,
        }
    }

    /// Event name used for SSE framing
    pub fn event_type(&self) -> &'static str {
        match self {
            ObserverMessage::Transcript { .. } => "transcript",
            ObserverMessage::SessionEnded { .. } => "session_ended",
            ObserverMessage::RecordingSaved { .. } => "recording_saved",
            ObserverMessage::ProcessingComplete { .. } => "processing_complete",
            ObserverMessage::CoachingTip { .. } => "coaching_tip",
        }
    }

    /// Session this message belongs to
    pub fn session_id(&self) -> Uuid {
        match self {
            ObserverMessage::Transcript { session_id, .. }
            | ObserverMessage::SessionEnded { session_id, .. }
            | ObserverMessage::RecordingSaved { session_id, .. }
            | ObserverMessage::ProcessingComplete { session_id, .. }
            | ObserverMessage::CoachingTip { session_id, .. } => *session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(is_final: bool, confidence: Option<f64>) -> TranscriptFragment {
        TranscriptFragment {
            speaker: Speaker::Customer,
            content: "We already have CAD software".to_string(),
            timestamp: Utc::now(),
            is_final,
            confidence,
        }
    }

    #[test]
    fn test_transcript_message_serializes_with_type_tag() {
        let msg = ObserverMessage::transcript(Uuid::new_v4(), "CA1", &fragment(true, Some(0.92)));
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "transcript");
        assert_eq!(json["speaker"], "Customer");
        assert_eq!(json["call_id"], "CA1");
        assert_eq!(json["is_final"], true);
        assert_eq!(json["confidence"], 0.92);
    }

    #[test]
    fn test_missing_confidence_stays_null() {
        let msg = ObserverMessage::transcript(Uuid::new_v4(), "CA1", &fragment(false, None));
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["confidence"].is_null());
    }

    #[test]
    fn test_session_ended_status_wire_format() {
        let msg = ObserverMessage::SessionEnded {
            session_id: Uuid::new_v4(),
            call_id: "CA1".to_string(),
            status: CallStatus::NoAnswer,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "session_ended");
        assert_eq!(json["status"], "no-answer");
        assert_eq!(msg.event_type(), "session_ended");
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let messages = vec![
            ObserverMessage::transcript(id, "CA1", &fragment(true, None)),
            ObserverMessage::SessionEnded { session_id: id, call_id: "CA1".into(), status: CallStatus::Completed, timestamp: now },
            ObserverMessage::RecordingSaved {
                session_id: id,
                call_id: "CA1".into(),
                filename: "a.mp3".into(),
                storage_ref: "file:///a.mp3".into(),
                duration_secs: Some(42),
                timestamp: now,
            },
            ObserverMessage::ProcessingComplete { session_id: id, call_id: "CA1".into(), result: serde_json::json!({"ok": true}), timestamp: now },
            ObserverMessage::CoachingTip { session_id: id, call_id: "CA1".into(), tip: "Ask about renewal".into(), category: None, timestamp: now },
        ];

        for msg in messages {
            let json = serde_json::to_value(&msg).unwrap();
            assert_eq!(json["type"], msg.event_type());
            assert_eq!(msg.session_id(), id);
        }
    }

    #[test]
    fn test_speaker_from_track() {
        assert_eq!(Speaker::from_track("inbound_track"), Some(Speaker::Customer));
        assert_eq!(Speaker::from_track("outbound_track"), Some(Speaker::Agent));
        assert_eq!(Speaker::from_track("both_tracks"), None);
    }

    #[test]
    fn test_call_status_from_provider() {
        assert_eq!(CallStatus::from_provider("completed"), Some(CallStatus::Completed));
        assert_eq!(CallStatus::from_provider("no-answer"), Some(CallStatus::NoAnswer));
        assert_eq!(CallStatus::from_provider("ringing"), None);
        assert_eq!(CallStatus::from_provider("in-progress"), None);
        // Expired is internal only
        assert_eq!(CallStatus::from_provider("expired"), None);
        assert_eq!(CallStatus::parse("expired"), Some(CallStatus::Expired));
    }
}
