//! Shared helpers for callhub-live integration tests

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request},
};
use callhub_common::config::ProviderConfig;
use callhub_common::db::init_memory_database;
use callhub_live::coaching::CoachingTrigger;
use callhub_live::hub::BroadcastHub;
use callhub_live::recording::{
    FsBlobStore, InboxReprocessor, ProviderClient, RecordingCollaborators, SkippedReprocessor,
};
use callhub_live::store::SqliteSessionStore;
use callhub_live::AppState;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Build app state over an in-memory database
pub async fn setup_state(
    coaching: CoachingTrigger,
    recordings_dir: &Path,
    reprocessor: Option<Arc<dyn InboxReprocessor>>,
) -> AppState {
    let pool = init_memory_database().await.expect("Should open in-memory database");
    let store = Arc::new(SqliteSessionStore::new(pool));
    let hub = Arc::new(BroadcastHub::new(64, Duration::from_millis(200)));

    let provider = ProviderConfig {
        account_sid: Some("AC-test".to_string()),
        auth_token: Some("token".to_string()),
        recording_extension: "mp3".to_string(),
    };
    let recording = RecordingCollaborators {
        fetcher: Arc::new(ProviderClient::new(&provider, Duration::from_secs(5)).expect("Should build provider client")),
        blobs: Arc::new(FsBlobStore::new(recordings_dir)),
        reprocessor: reprocessor.unwrap_or_else(|| Arc::new(SkippedReprocessor)),
    };

    AppState::new(hub, store, coaching, recording, "mp3")
}

/// Request with a JSON body
pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Request with a form-encoded body, the way the provider posts webhooks
pub fn form_request(uri: &str, fields: &[(&str, &str)]) -> Request<Body> {
    let body = fields
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            _ => format!("%{:02X}", b),
        })
        .collect()
}

/// Extract JSON body from response
pub async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}
