//! Downstream inbox reprocessing

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::CollaboratorError;

/// What the reprocess job is told about a stored recording
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessRequest {
    pub session_id: Uuid,
    pub call_id: String,
    pub owner_id: Option<String>,
    pub recording_id: String,
    pub filename: String,
    pub storage_ref: String,
    pub duration_secs: Option<u32>,
}

/// Starts downstream transcription/analysis of a stored recording
///
/// The returned JSON is opaque here and is forwarded to observers as is.
#[async_trait]
pub trait InboxReprocessor: Send + Sync {
    async fn reprocess(&self, request: &ReprocessRequest) -> Result<Value, CollaboratorError>;
}

/// Reprocessor that POSTs to an HTTP endpoint
pub struct HttpInboxReprocessor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpInboxReprocessor {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Network(e.to_string()))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl InboxReprocessor for HttpInboxReprocessor {
    async fn reprocess(&self, request: &ReprocessRequest) -> Result<Value, CollaboratorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        debug!("Reprocess: {} answered {} bytes", self.endpoint, body.len());
        if body.trim().is_empty() {
            return Ok(json!({ "status": "accepted" }));
        }
        serde_json::from_str(&body).map_err(|e| CollaboratorError::Decode(e.to_string()))
    }
}

/// Used when no reprocess endpoint is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct SkippedReprocessor;

#[async_trait]
impl InboxReprocessor for SkippedReprocessor {
    async fn reprocess(&self, _request: &ReprocessRequest) -> Result<Value, CollaboratorError> {
        Ok(json!({ "status": "skipped", "reason": "no reprocess endpoint configured" }))
    }
}
