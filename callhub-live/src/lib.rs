//! callhub-live library interface
//!
//! Live call-session orchestration: provider webhooks in, session state in
//! the registry, observer updates out over SSE, coaching and recording work
//! dispatched off the ingestion path.

pub mod api;
pub mod coaching;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod recording;
pub mod registry;
pub mod store;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::coaching::CoachingTrigger;
use crate::hub::BroadcastHub;
use crate::ingest::EventIngestor;
use crate::recording::{RecordingCollaborators, RecordingPipeline};
use crate::registry::SessionRegistry;
use crate::store::SessionStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub hub: Arc<BroadcastHub>,
    pub store: Arc<dyn SessionStore>,
    pub ingestor: EventIngestor,
    pub recordings: RecordingPipeline,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Wire the registry, hub and store into ingestion and the recording pipeline
    pub fn new(
        hub: Arc<BroadcastHub>,
        store: Arc<dyn SessionStore>,
        coaching: CoachingTrigger,
        recording: RecordingCollaborators,
        recording_extension: &str,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let ingestor = EventIngestor::new(registry.clone(), hub.clone(), store.clone(), coaching);
        let recordings = RecordingPipeline::new(
            registry.clone(),
            hub.clone(),
            store.clone(),
            recording,
            recording_extension,
        );

        Self {
            registry,
            hub,
            store,
            ingestor,
            recordings,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::webhook_routes())
        .merge(api::session_routes())
        .merge(api::health_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
