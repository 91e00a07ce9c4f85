//! Call vocabulary shared by ingestion, persistence and observers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which party spoke a fragment
///
/// Derived from the audio leg that produced the fragment, never from its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Speaker {
    /// Inbound leg (the person being called)
    Customer,
    /// Outbound leg (the sales agent)
    Agent,
}

impl Speaker {
    /// Map a provider track indicator onto a speaker
    ///
    /// Returns `None` for any track this service does not know how to attribute.
    pub fn from_track(track: &str) -> Option<Self> {
        match track.trim().to_ascii_lowercase().as_str() {
            "inbound_track" | "inbound" => Some(Speaker::Customer),
            "outbound_track" | "outbound" => Some(Speaker::Agent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Customer => "Customer",
            Speaker::Agent => "Agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Customer" => Some(Speaker::Customer),
            "Agent" => Some(Speaker::Agent),
            _ => None,
        }
    }
}

/// Terminal status a call session ends with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Canceled,
    /// Session went idle and was closed by the sweeper
    Expired,
}

impl CallStatus {
    /// Parse a provider status string
    ///
    /// Only terminal provider statuses map to a `CallStatus`; everything else
    /// (`queued`, `ringing`, `in-progress`, ...) is `None`.
    pub fn from_provider(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "completed" => Some(CallStatus::Completed),
            "failed" => Some(CallStatus::Failed),
            "busy" => Some(CallStatus::Busy),
            "no-answer" | "no_answer" => Some(CallStatus::NoAnswer),
            "canceled" | "cancelled" => Some(CallStatus::Canceled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::Busy => "busy",
            CallStatus::NoAnswer => "no-answer",
            CallStatus::Canceled => "canceled",
            CallStatus::Expired => "expired",
        }
    }

    /// Inverse of [`CallStatus::as_str`], used when reading persisted rows
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "expired" => Some(CallStatus::Expired),
            other => Self::from_provider(other),
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of speech-to-text output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptFragment {
    pub speaker: Speaker,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_final: bool,
    /// Provider confidence in 0.0..=1.0; `None` means unknown, not zero
    pub confidence: Option<f64>,
}
