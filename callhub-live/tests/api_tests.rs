//! Integration tests for callhub-live HTTP endpoints

mod common;

use axum::http::{header, StatusCode};
use callhub_live::build_router;
use callhub_live::coaching::CoachingTrigger;
use common::{extract_json, form_request, get_request, json_request, setup_state};
use serde_json::json;
use tower::util::ServiceExt; // for `oneshot` method
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(setup_state(CoachingTrigger::disabled(), dir.path(), None).await);

    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "callhub-live");
    assert!(body["version"].is_string());
    assert_eq!(body["active_sessions"], 0);
}

// =============================================================================
// Ingestion webhooks
// =============================================================================

#[tokio::test]
async fn test_stream_start_form_body_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let state = setup_state(CoachingTrigger::disabled(), dir.path(), None).await;
    let app = build_router(state.clone());

    let response = app
        .oneshot(form_request(
            "/webhooks/stream",
            &[("Event", "start"), ("CallSid", "CA1"), ("StreamSid", "MZ1")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["outcome"], "announced");
    assert!(state.registry.is_known("CA1"));
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_transcript_for_unknown_call_is_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(setup_state(CoachingTrigger::disabled(), dir.path(), None).await);

    let response = app
        .oneshot(json_request(
            "POST",
            "/webhooks/transcription",
            json!({
                "event": "transcription-content",
                "callId": "CA-unknown",
                "track": "inbound_track",
                "final": true,
                "data": {"transcript": "hello?"}
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ignored");
    assert_eq!(body["reason"], "unknown_call");
}

#[tokio::test]
async fn test_malformed_bodies_are_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(setup_state(CoachingTrigger::disabled(), dir.path(), None).await);

    let broken_json = axum::http::Request::builder()
        .method("POST")
        .uri("/webhooks/status")
        .header(header::CONTENT_TYPE, "application/json")
        .body(axum::body::Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(broken_json).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(extract_json(response.into_body()).await["status"], "ignored");

    let bad_transcript = form_request(
        "/webhooks/transcription",
        &[("CallSid", "CA1"), ("Track", "inbound_track"), ("TranscriptionData", "{oops")],
    );
    let response = app.clone().oneshot(bad_transcript).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(extract_json(response.into_body()).await["status"], "ignored");

    let unknown_kind = json_request("POST", "/webhooks/stream", json!({"event": "mark", "callId": "CA1"}));
    let response = app.oneshot(unknown_kind).await.unwrap();
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ignored");
    assert_eq!(body["reason"], "unrecognized_event");
}

#[tokio::test]
async fn test_non_terminal_status_is_logged_only() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(setup_state(CoachingTrigger::disabled(), dir.path(), None).await);

    let response = app
        .oneshot(form_request("/webhooks/status", &[("CallSid", "CA1"), ("CallStatus", "ringing")]))
        .await
        .unwrap();

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["outcome"], "status_logged");
}

// =============================================================================
// Sessions
// =============================================================================

#[tokio::test]
async fn test_create_session_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let state = setup_state(CoachingTrigger::disabled(), dir.path(), None).await;
    let app = build_router(state.clone());

    let first = app
        .clone()
        .oneshot(json_request("POST", "/api/sessions", json!({"callId": "CA1", "ownerId": "rep-1"})))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let first = extract_json(first.into_body()).await;

    let second = app
        .oneshot(json_request("POST", "/api/sessions", json!({"callId": "CA1", "leadId": "lead-3"})))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second = extract_json(second.into_body()).await;

    assert_eq!(first["sessionId"], second["sessionId"]);
    assert_eq!(second["ownerId"], "rep-1");
    assert_eq!(second["leadId"], "lead-3");
    assert_eq!(second["status"], "active");
    assert_eq!(state.registry.len(), 1);
}

#[tokio::test]
async fn test_create_session_requires_call_id() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(setup_state(CoachingTrigger::disabled(), dir.path(), None).await);

    let response = app
        .oneshot(json_request("POST", "/api/sessions", json!({"ownerId": "rep-1"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_session_events_stream() {
    let dir = tempfile::tempdir().unwrap();
    let state = setup_state(CoachingTrigger::disabled(), dir.path(), None).await;
    let app = build_router(state.clone());

    let missing = app
        .clone()
        .oneshot(get_request(&format!("/api/sessions/{}/events", uuid::Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let created = app
        .clone()
        .oneshot(json_request("POST", "/api/sessions", json!({"callId": "CA1"})))
        .await
        .unwrap();
    let session_id = extract_json(created.into_body()).await["sessionId"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .oneshot(get_request(&format!("/api/sessions/{}/events", session_id)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get(header::CONTENT_TYPE).unwrap().to_str().unwrap();
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(state.hub.total_subscribers(), 1);

    drop(response);
    assert_eq!(state.hub.total_subscribers(), 0, "closing the stream unsubscribes");
}

#[tokio::test]
async fn test_transcript_refetch() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(setup_state(CoachingTrigger::disabled(), dir.path(), None).await);

    let created = app
        .clone()
        .oneshot(json_request("POST", "/api/sessions", json!({"callId": "CA1"})))
        .await
        .unwrap();
    let session_id = extract_json(created.into_body()).await["sessionId"]
        .as_str()
        .unwrap()
        .to_string();

    for (track, text) in [("outbound_track", "Hi, this is Sam"), ("inbound_track", "Hello")] {
        app.clone()
            .oneshot(json_request(
                "POST",
                "/webhooks/transcription",
                json!({"callId": "CA1", "track": track, "final": true, "transcript": text}),
            ))
            .await
            .unwrap();
    }

    let response = app
        .oneshot(get_request(&format!("/api/sessions/{}/transcript", session_id)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["callId"], "CA1");
    assert_eq!(body["status"], "active");
    let fragments = body["fragments"].as_array().unwrap();
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0]["speaker"], "Agent");
    assert_eq!(fragments[1]["speaker"], "Customer");
    assert!(fragments[1]["confidence"].is_null());
}

// =============================================================================
// Recording webhook
// =============================================================================

#[tokio::test]
async fn test_recording_in_progress_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(setup_state(CoachingTrigger::disabled(), dir.path(), None).await);

    let response = app
        .oneshot(form_request(
            "/webhooks/recording",
            &[("CallSid", "CA1"), ("RecordingSid", "RE1"), ("RecordingStatus", "in-progress")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(extract_json(response.into_body()).await["status"], "ignored");
}

#[tokio::test]
async fn test_recording_for_unknown_session_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(setup_state(CoachingTrigger::disabled(), dir.path(), None).await);

    let response = app
        .oneshot(form_request(
            "/webhooks/recording",
            &[
                ("CallSid", "CA-nobody"),
                ("RecordingSid", "RE1"),
                ("RecordingStatus", "completed"),
                ("RecordingUrl", "https://api.provider.test/Recordings/RE1"),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "SESSION_NOT_RESOLVED");
}

#[tokio::test]
async fn test_recording_download_failure_is_reported_upstream() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&provider)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let state = setup_state(CoachingTrigger::disabled(), dir.path(), None).await;
    let app = build_router(state.clone());

    let created = app
        .clone()
        .oneshot(json_request("POST", "/api/sessions", json!({"callId": "CA1"})))
        .await
        .unwrap();
    let session_id: uuid::Uuid = extract_json(created.into_body()).await["sessionId"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let mut observer = state.hub.subscribe(session_id);
    let recording_url = format!("{}/Recordings/RE1", provider.uri());

    let response = app
        .oneshot(form_request(
            "/webhooks/recording",
            &[
                ("CallSid", "CA1"),
                ("RecordingSid", "RE1"),
                ("RecordingStatus", "completed"),
                ("RecordingUrl", recording_url.as_str()),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "DOWNLOAD_FAILED");
    assert!(observer.try_recv().is_none(), "no recording_saved on failure");
}
