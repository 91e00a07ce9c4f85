//! Provider webhook endpoints
//!
//! Ingestion webhooks always answer 200: the provider only needs to know the
//! delivery arrived. The recording webhook is the exception and reports
//! pipeline failures so the provider re-delivers.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::payload::WebhookPayload;
use crate::error::{ApiError, ApiResult};
use crate::ingest::payload::{
    parse_recording_callback, parse_status_callback, parse_stream_event, parse_transcription_event,
};
use crate::ingest::{FieldMap, InboundEvent, PayloadError};
use crate::AppState;

/// Acknowledgment body for ingestion webhooks
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    /// "accepted" or "ignored"
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookAck {
    fn accepted(outcome: &'static str) -> Self {
        Self {
            status: "accepted",
            outcome: Some(outcome),
            reason: None,
        }
    }

    fn ignored(reason: impl Into<String>) -> Self {
        Self {
            status: "ignored",
            outcome: None,
            reason: Some(reason.into()),
        }
    }
}

async fn ingest_parsed(
    state: &AppState,
    family: &str,
    parsed: Result<InboundEvent, PayloadError>,
) -> Json<WebhookAck> {
    match parsed {
        Ok(event) => {
            let outcome = state.ingestor.ingest(event).await;
            if outcome.is_accepted() {
                Json(WebhookAck::accepted(outcome.label()))
            } else {
                Json(WebhookAck::ignored(outcome.label()))
            }
        }
        Err(e) => {
            warn!("Webhook {}: dropping malformed payload: {}", family, e);
            Json(WebhookAck::ignored(e.to_string()))
        }
    }
}

fn parse_with(
    fields: Result<FieldMap, PayloadError>,
    parser: fn(&FieldMap) -> Result<InboundEvent, PayloadError>,
) -> Result<InboundEvent, PayloadError> {
    fields.and_then(|fields| parser(&fields))
}

/// POST /webhooks/stream
pub async fn stream_webhook(State(state): State<AppState>, WebhookPayload(fields): WebhookPayload) -> Json<WebhookAck> {
    ingest_parsed(&state, "stream", parse_with(fields, parse_stream_event)).await
}

/// POST /webhooks/status
pub async fn status_webhook(State(state): State<AppState>, WebhookPayload(fields): WebhookPayload) -> Json<WebhookAck> {
    ingest_parsed(&state, "status", parse_with(fields, parse_status_callback)).await
}

/// POST /webhooks/transcription
pub async fn transcription_webhook(
    State(state): State<AppState>,
    WebhookPayload(fields): WebhookPayload,
) -> Json<WebhookAck> {
    ingest_parsed(&state, "transcription", parse_with(fields, parse_transcription_event)).await
}

/// POST /webhooks/recording
///
/// Runs the recording pipeline in its own task and answers with its result.
pub async fn recording_webhook(
    State(state): State<AppState>,
    WebhookPayload(fields): WebhookPayload,
) -> ApiResult<Response> {
    let callback = match fields.and_then(|fields| parse_recording_callback(&fields)) {
        Ok(callback) => callback,
        Err(e) => {
            warn!("Webhook recording: dropping malformed payload: {}", e);
            return Ok(Json(WebhookAck::ignored(e.to_string())).into_response());
        }
    };

    if !callback.is_completed() {
        info!(
            "Webhook recording: {} for call {} is {}, nothing to do",
            callback.recording_id, callback.call_id, callback.status
        );
        return Ok(Json(WebhookAck::ignored(format!("recording status {}", callback.status))).into_response());
    }

    let pipeline = state.recordings.clone();
    let outcome = tokio::spawn(async move { pipeline.run(callback).await })
        .await
        .map_err(|e| ApiError::Internal(format!("recording task failed: {}", e)))??;

    Ok(Json(json!({
        "status": "stored",
        "sessionId": outcome.session_id,
        "filename": outcome.filename,
        "storageRef": outcome.storage_ref,
    }))
    .into_response())
}

/// Build webhook routes
pub fn webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/webhooks/stream", post(stream_webhook))
        .route("/webhooks/status", post(status_webhook))
        .route("/webhooks/transcription", post(transcription_webhook))
        .route("/webhooks/recording", post(recording_webhook))
}
