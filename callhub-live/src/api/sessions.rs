//! Client session endpoints: create, observe, re-fetch history

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    routing::{get, post},
    Json, Router,
};
use callhub_common::events::{CallStatus, TranscriptFragment};
use callhub_common::sse::observer_sse_stream;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use tracing::debug;
use uuid::Uuid;

use super::payload::WebhookPayload;
use crate::error::{ApiError, ApiResult};
use crate::ingest::payload::parse_session_request;
use crate::ingest::OpenedSession;
use crate::store::StoredSession;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub call_id: String,
    pub lead_id: Option<String>,
    pub owner_id: Option<String>,
    pub started_at: DateTime<Utc>,
    /// "active" or the terminal status
    pub status: String,
    pub created: bool,
}

fn status_label(ended: Option<CallStatus>) -> String {
    ended
        .map(|status| status.as_str().to_string())
        .unwrap_or_else(|| "active".to_string())
}

impl From<OpenedSession> for SessionResponse {
    fn from(session: OpenedSession) -> Self {
        Self {
            session_id: session.session_id,
            call_id: session.call_id,
            lead_id: session.lead_id,
            owner_id: session.owner_id,
            started_at: session.started_at,
            status: status_label(session.ended_status),
            created: session.created,
        }
    }
}

/// POST /api/sessions
///
/// Idempotent on `callId`: 201 when this request created the session, 200
/// when it already existed.
pub async fn create_session(
    State(state): State<AppState>,
    WebhookPayload(fields): WebhookPayload,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    let request = fields
        .and_then(|fields| parse_session_request(&fields))
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let opened = state.ingestor.open_session(request).await?;
    let status = if opened.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(opened.into())))
}

async fn stored_session(state: &AppState, session_id: Uuid) -> ApiResult<StoredSession> {
    state
        .store
        .find_by_session_id(session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {}", session_id)))
}

/// GET /api/sessions/:session_id/events
///
/// Live observer stream. Nothing is replayed; clients re-fetch the transcript
/// after reconnecting.
pub async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    stored_session(&state, session_id).await?;

    let (rx, guard) = state.hub.subscribe(session_id).detach(state.hub.clone());
    Ok(observer_sse_stream(format!("session {}", session_id), rx, guard))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptResponse {
    pub session_id: Uuid,
    pub call_id: String,
    pub status: String,
    pub fragments: Vec<TranscriptFragment>,
}

/// GET /api/sessions/:session_id/transcript
pub async fn session_transcript(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<TranscriptResponse>> {
    let stored = stored_session(&state, session_id).await?;
    let fragments = state.store.transcript(session_id).await?;
    debug!("Transcript re-fetch for session {}: {} fragment(s)", session_id, fragments.len());

    Ok(Json(TranscriptResponse {
        session_id,
        call_id: stored.context.call_id,
        status: status_label(stored.ended_status),
        fragments,
    }))
}

/// Build session routes
pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:session_id/events", get(session_events))
        .route("/api/sessions/:session_id/transcript", get(session_transcript))
}
