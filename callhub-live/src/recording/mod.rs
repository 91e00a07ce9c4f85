//! Recording pipeline
//!
//! Runs once per completed-recording callback:
//! resolve session → download → store → broadcast `recording_saved` →
//! reprocess → broadcast `processing_complete`.
//!
//! A failing step stops the run and is reported to the webhook so the
//! provider re-delivers; there is no internal retry. Download and store are
//! safe to repeat (same blob key, upserted reference).

pub mod provider;
pub mod reprocess;
pub mod storage;

pub use provider::{FetchError, FetchedRecording, ProviderClient, RecordingFetcher};
pub use reprocess::{HttpInboxReprocessor, InboxReprocessor, ReprocessRequest, SkippedReprocessor};
pub use storage::{BlobStore, FsBlobStore, StorageError};

use axum::http::StatusCode;
use callhub_common::events::ObserverMessage;
use callhub_common::time::minute_stamp;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::CollaboratorError;
use crate::hub::BroadcastHub;
use crate::ingest::RecordingCallback;
use crate::registry::{SessionContext, SessionRegistry};
use crate::store::{RecordingRecord, SessionStore};

/// Steps that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    ResolveSession,
    Download,
    Store,
    Reprocess,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::ResolveSession => "resolve_session",
            PipelineStep::Download => "download",
            PipelineStep::Store => "store",
            PipelineStep::Reprocess => "reprocess",
        }
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step failed
#[derive(Debug, Error)]
pub enum StepFailure {
    #[error("no session for call {0}")]
    SessionNotFound(String),

    #[error("session lookup failed: {0}")]
    Lookup(#[from] callhub_common::Error),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

/// Pipeline stopped at `step`
#[derive(Debug, Error)]
#[error("recording pipeline failed at {step}: {failure}")]
pub struct PipelineError {
    pub step: PipelineStep,
    pub failure: StepFailure,
}

impl PipelineError {
    /// Status the provider webhook is answered with
    ///
    /// Upstream failures are 502 and timeouts 504 so the provider retries;
    /// local storage failures are 500.
    pub fn status_code(&self) -> StatusCode {
        match &self.failure {
            StepFailure::SessionNotFound(_) => StatusCode::NOT_FOUND,
            StepFailure::Fetch(FetchError::Timeout) | StepFailure::Collaborator(CollaboratorError::Timeout) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            StepFailure::Fetch(_) | StepFailure::Collaborator(_) => StatusCode::BAD_GATEWAY,
            StepFailure::Lookup(_) | StepFailure::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self.step {
            PipelineStep::ResolveSession => "SESSION_NOT_RESOLVED",
            PipelineStep::Download => "DOWNLOAD_FAILED",
            PipelineStep::Store => "STORE_FAILED",
            PipelineStep::Reprocess => "REPROCESS_FAILED",
        }
    }
}

/// Progress of one recording job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Downloaded,
    Stored,
    ReprocessingTriggered,
    Done,
    Failed { step: PipelineStep, reason: String },
}

/// One recording on its way through the pipeline
#[derive(Debug, Clone)]
pub struct RecordingJob {
    pub call_id: String,
    pub recording_id: String,
    pub recording_url: String,
    pub duration_secs: Option<u32>,
    status: JobStatus,
}

impl RecordingJob {
    pub fn new(callback: &RecordingCallback) -> Self {
        Self {
            call_id: callback.call_id.clone(),
            recording_id: callback.recording_id.clone(),
            recording_url: callback.recording_url.clone(),
            duration_secs: callback.duration_secs,
            status: JobStatus::Pending,
        }
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    fn advance(&mut self, status: JobStatus) {
        info!(
            "Recording {} of call {}: {:?} -> {:?}",
            self.recording_id, self.call_id, self.status, status
        );
        self.status = status;
    }

    fn fail(&mut self, step: PipelineStep, failure: impl Into<StepFailure>) -> PipelineError {
        let failure = failure.into();
        error!(
            "Recording {} of call {} failed at {}: {}",
            self.recording_id, self.call_id, step, failure
        );
        self.status = JobStatus::Failed {
            step,
            reason: failure.to_string(),
        };
        PipelineError { step, failure }
    }
}

/// What a finished run produced
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingOutcome {
    pub session_id: Uuid,
    pub filename: String,
    pub storage_ref: String,
    pub processing_result: Value,
}

/// External collaborators the pipeline drives
#[derive(Clone)]
pub struct RecordingCollaborators {
    pub fetcher: Arc<dyn RecordingFetcher>,
    pub blobs: Arc<dyn BlobStore>,
    pub reprocessor: Arc<dyn InboxReprocessor>,
}

/// Post-call recording pipeline
#[derive(Clone)]
pub struct RecordingPipeline {
    registry: Arc<SessionRegistry>,
    hub: Arc<BroadcastHub>,
    store: Arc<dyn SessionStore>,
    collaborators: RecordingCollaborators,
    extension: String,
}

impl RecordingPipeline {
    pub fn new(
        registry: Arc<SessionRegistry>,
        hub: Arc<BroadcastHub>,
        store: Arc<dyn SessionStore>,
        collaborators: RecordingCollaborators,
        extension: &str,
    ) -> Self {
        Self {
            registry,
            hub,
            store,
            collaborators,
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    /// Run the whole pipeline for one completed recording
    pub async fn run(&self, callback: RecordingCallback) -> Result<RecordingOutcome, PipelineError> {
        let mut job = RecordingJob::new(&callback);

        let context = match self.resolve_session(&job.call_id).await {
            Ok(context) => context,
            Err(failure) => return Err(job.fail(PipelineStep::ResolveSession, failure)),
        };

        let recording = match self.collaborators.fetcher.fetch(&job.recording_url).await {
            Ok(recording) => recording,
            Err(e) => return Err(job.fail(PipelineStep::Download, e)),
        };
        job.advance(JobStatus::Downloaded);

        let (key, filename) = blob_key(&context, &self.extension);
        let storage_ref = match self.collaborators.blobs.put(&key, &recording.bytes).await {
            Ok(storage_ref) => storage_ref,
            Err(e) => return Err(job.fail(PipelineStep::Store, e)),
        };
        let record = RecordingRecord {
            session_id: context.session_id,
            call_id: job.call_id.clone(),
            recording_id: job.recording_id.clone(),
            filename: filename.clone(),
            storage_ref: storage_ref.clone(),
            duration_secs: job.duration_secs,
            stored_at: Utc::now(),
        };
        if let Err(e) = self.store.attach_recording(&record).await {
            return Err(job.fail(PipelineStep::Store, e));
        }
        job.advance(JobStatus::Stored);

        let saved = ObserverMessage::RecordingSaved {
            session_id: context.session_id,
            call_id: job.call_id.clone(),
            filename: filename.clone(),
            storage_ref: storage_ref.clone(),
            duration_secs: job.duration_secs,
            timestamp: record.stored_at,
        };
        self.hub.publish(context.session_id, saved).await;

        let request = ReprocessRequest {
            session_id: context.session_id,
            call_id: job.call_id.clone(),
            owner_id: context.owner_id.clone(),
            recording_id: job.recording_id.clone(),
            filename: filename.clone(),
            storage_ref: storage_ref.clone(),
            duration_secs: job.duration_secs,
        };
        let processing_result = match self.collaborators.reprocessor.reprocess(&request).await {
            Ok(result) => result,
            Err(e) => return Err(job.fail(PipelineStep::Reprocess, e)),
        };
        job.advance(JobStatus::ReprocessingTriggered);

        if let Err(e) = self
            .store
            .record_processing_result(context.session_id, &job.recording_id, &processing_result)
            .await
        {
            warn!("Recording {}: could not save processing result: {}", job.recording_id, e);
        }

        let complete = ObserverMessage::ProcessingComplete {
            session_id: context.session_id,
            call_id: job.call_id.clone(),
            result: processing_result.clone(),
            timestamp: Utc::now(),
        };
        self.hub.publish(context.session_id, complete).await;
        job.advance(JobStatus::Done);

        Ok(RecordingOutcome {
            session_id: context.session_id,
            filename,
            storage_ref,
            processing_result,
        })
    }

    /// Registry first; the durable record covers evicted sessions
    async fn resolve_session(&self, call_id: &str) -> Result<SessionContext, StepFailure> {
        if let Some(handle) = self.registry.get(call_id) {
            return Ok(handle.lock().await.context());
        }
        match self.store.find_by_call_id(call_id).await? {
            Some(stored) => Ok(stored.context),
            None => Err(StepFailure::SessionNotFound(call_id.to_string())),
        }
    }
}

/// `{owner|unassigned}/{YYYYMMDD-HHMM}-{call_id}.{ext}`, plus the file name
fn blob_key(context: &SessionContext, extension: &str) -> (String, String) {
    let owner = context
        .owner_id
        .as_deref()
        .map(sanitize)
        .filter(|o| !o.is_empty())
        .unwrap_or_else(|| "unassigned".to_string());
    let filename = format!(
        "{}-{}.{}",
        minute_stamp(context.started_at),
        sanitize(&context.call_id),
        extension
    );
    (format!("{}/{}", owner, filename), filename)
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
