//! Event ingestion
//!
//! Routes normalized provider events into the session registry. For a given
//! call all work happens under that call's session lock, so fragments are
//! appended, persisted and broadcast in arrival order, and the termination
//! side effects run once.

pub mod payload;

pub use payload::{FieldMap, InboundEvent, PayloadError, ProviderStatus, RecordingCallback, SessionRequest};

use callhub_common::config::RegistryConfig;
use callhub_common::events::{CallStatus, ObserverMessage, TranscriptFragment};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::coaching::CoachingTrigger;
use crate::hub::BroadcastHub;
use crate::registry::{
    CallSession, EndOutcome, SessionClosed, SessionHandle, SessionInit, SessionRegistry, SweepReport,
};
use crate::store::{SessionStore, StoredSession};

/// What ingestion did with one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First stream/transcription start for a call
    Announced,
    /// Activity recorded for a known call
    Refreshed,
    /// Fragment appended at `seq`; `coaching` when analysis was dispatched
    FragmentAccepted { seq: usize, coaching: bool },
    SessionEnded(CallStatus),
    /// Terminal event for a session that had already ended
    DuplicateTerminal(CallStatus),
    /// Non-terminal status, logged only
    StatusLogged,
    TranscriptionStopped,
    /// Content for a session that already ended
    LateEvent,
    UnknownCall,
    Unrecognized,
}

impl IngestOutcome {
    /// Short label for the webhook acknowledgment
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Announced => "announced",
            IngestOutcome::Refreshed => "refreshed",
            IngestOutcome::FragmentAccepted { .. } => "fragment_accepted",
            IngestOutcome::SessionEnded(_) => "session_ended",
            IngestOutcome::DuplicateTerminal(_) => "duplicate_terminal",
            IngestOutcome::StatusLogged => "status_logged",
            IngestOutcome::TranscriptionStopped => "transcription_stopped",
            IngestOutcome::LateEvent => "late_event",
            IngestOutcome::UnknownCall => "unknown_call",
            IngestOutcome::Unrecognized => "unrecognized_event",
        }
    }

    /// Whether the event changed or refreshed session state
    pub fn is_accepted(&self) -> bool {
        !matches!(
            self,
            IngestOutcome::LateEvent | IngestOutcome::UnknownCall | IngestOutcome::Unrecognized
        )
    }
}

/// Session returned to a session-create request
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedSession {
    pub session_id: Uuid,
    pub call_id: String,
    pub lead_id: Option<String>,
    pub owner_id: Option<String>,
    pub started_at: DateTime<Utc>,
    /// `None` while the call is active
    pub ended_status: Option<CallStatus>,
    /// True only for the request that created the session
    pub created: bool,
}

impl OpenedSession {
    fn from_live(session: &CallSession, created: bool) -> Self {
        let ended_status = match session.state() {
            crate::registry::SessionState::Active => None,
            crate::registry::SessionState::Ended(status) => Some(status),
        };
        Self {
            session_id: session.session_id(),
            call_id: session.call_id().to_string(),
            lead_id: session.lead_id().map(str::to_string),
            owner_id: session.owner_id().map(str::to_string),
            started_at: session.started_at(),
            ended_status,
            created,
        }
    }
}

impl From<StoredSession> for OpenedSession {
    fn from(stored: StoredSession) -> Self {
        Self {
            session_id: stored.context.session_id,
            call_id: stored.context.call_id,
            lead_id: stored.context.lead_id,
            owner_id: stored.context.owner_id,
            started_at: stored.context.started_at,
            ended_status: stored.ended_status,
            created: false,
        }
    }
}

/// Durable state of a call the registry does not hold
enum Recovered {
    /// Still active in storage; now adopted back into the registry
    Live(SessionHandle),
    Ended(StoredSession),
    Absent,
}

/// How often and how aggressively idle sessions are cleaned up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    pub interval: Duration,
    pub idle_timeout: Duration,
    pub ended_retention: Duration,
}

impl From<&RegistryConfig> for SweepPolicy {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            interval: config.sweep_interval(),
            idle_timeout: config.idle_timeout(),
            ended_retention: config.ended_retention(),
        }
    }
}

/// Applies inbound events to sessions
#[derive(Clone)]
pub struct EventIngestor {
    registry: Arc<SessionRegistry>,
    hub: Arc<BroadcastHub>,
    store: Arc<dyn SessionStore>,
    coaching: CoachingTrigger,
}

impl EventIngestor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        hub: Arc<BroadcastHub>,
        store: Arc<dyn SessionStore>,
        coaching: CoachingTrigger,
    ) -> Self {
        Self {
            registry,
            hub,
            store,
            coaching,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Apply one event
    ///
    /// Never fails: unknown calls, late content and unrecognized kinds are
    /// logged and reported through the outcome.
    pub async fn ingest(&self, event: InboundEvent) -> IngestOutcome {
        match event {
            InboundEvent::StreamStarted { call_id, stream_id } => self.stream_started(&call_id, stream_id).await,
            InboundEvent::StreamMedia { call_id } => {
                if self.registry.touch(&call_id).await {
                    IngestOutcome::Refreshed
                } else {
                    debug!("Ingest: media for unknown call {}", call_id);
                    IngestOutcome::UnknownCall
                }
            }
            InboundEvent::StreamStopped { call_id } => self.end_session(&call_id, CallStatus::Completed).await,
            InboundEvent::Status { call_id, status } => match status {
                ProviderStatus::Terminal(status) => self.end_session(&call_id, status).await,
                ProviderStatus::NonTerminal(status) => {
                    info!("Ingest: call {} is {}", call_id, status);
                    self.registry.touch(&call_id).await;
                    IngestOutcome::StatusLogged
                }
            },
            InboundEvent::TranscriptionStarted { call_id } => {
                if self.registry.register_stream(&call_id, None).await {
                    info!("Ingest: transcription started for call {}", call_id);
                    IngestOutcome::Announced
                } else {
                    IngestOutcome::Refreshed
                }
            }
            InboundEvent::TranscriptionStopped { call_id } => {
                info!("Ingest: transcription stopped for call {}", call_id);
                self.registry.touch(&call_id).await;
                IngestOutcome::TranscriptionStopped
            }
            InboundEvent::Transcript { call_id, fragment } => self.handle_fragment(&call_id, fragment).await,
            InboundEvent::Unrecognized { kind } => {
                warn!("Ingest: dropping unrecognized event kind {:?}", kind);
                IngestOutcome::Unrecognized
            }
        }
    }

    async fn stream_started(&self, call_id: &str, stream_id: Option<String>) -> IngestOutcome {
        if let Some(handle) = self.registry.get(call_id) {
            let mut session = handle.lock().await;
            let had_stream = session.stream_id().is_some();
            session.attach_stream(stream_id);
            session.touch();
            if !had_stream && session.stream_id().is_some() && session.is_persisted() {
                if let Err(e) = self
                    .store
                    .update_session_refs(&session.context(), session.stream_id())
                    .await
                {
                    error!("Ingest: failed to persist stream id for call {}: {}", call_id, e);
                }
            }
            return IngestOutcome::Refreshed;
        }

        if self.registry.register_stream(call_id, stream_id).await {
            info!("Ingest: stream started for call {}", call_id);
            IngestOutcome::Announced
        } else {
            IngestOutcome::Refreshed
        }
    }

    async fn handle_fragment(&self, call_id: &str, fragment: TranscriptFragment) -> IngestOutcome {
        let handle = match self.registry.get(call_id) {
            Some(handle) => handle,
            None => match self.recover_from_store(call_id).await {
                Ok(Recovered::Live(handle)) => handle,
                Ok(Recovered::Ended(stored)) => {
                    self.registry.forget_announcement(call_id);
                    debug!(
                        "Ingest: late transcript for call {} (session {} already ended)",
                        call_id, stored.context.session_id
                    );
                    return IngestOutcome::LateEvent;
                }
                Ok(Recovered::Absent) if self.registry.is_known(call_id) => {
                    let (handle, created) = self.registry.get_or_create(call_id, SessionInit::default());
                    if created {
                        info!("Ingest: first content opened a session for call {}", call_id);
                    }
                    handle
                }
                Ok(Recovered::Absent) => {
                    info!("Ingest: dropping transcript for unknown call {}", call_id);
                    return IngestOutcome::UnknownCall;
                }
                Err(e) => {
                    error!("Ingest: cannot look up call {} in storage, dropping transcript: {}", call_id, e);
                    return IngestOutcome::UnknownCall;
                }
            },
        };

        let mut session = handle.lock().await;
        let seq = match session.append(fragment.clone()) {
            Ok(seq) => seq,
            Err(SessionClosed(status)) => {
                debug!("Ingest: late transcript for call {} (ended {})", call_id, status);
                return IngestOutcome::LateEvent;
            }
        };
        let context = session.context();

        let durable = match self.ensure_persisted(&mut session).await {
            Ok(()) => self.store.append_fragment(context.session_id, seq, &fragment).await,
            Err(e) => Err(e),
        };
        match durable {
            Ok(()) => {
                let message = ObserverMessage::transcript(context.session_id, call_id, &fragment);
                self.hub.publish(context.session_id, message).await;
            }
            Err(e) => error!(
                "Ingest: failed to persist fragment {} of call {}, not broadcasting it: {}",
                seq, call_id, e
            ),
        }
        drop(session);

        let coaching = self.coaching.on_final_fragment(&context, &fragment);
        IngestOutcome::FragmentAccepted { seq, coaching }
    }

    /// Run the termination side effects once for `call_id`
    async fn end_session(&self, call_id: &str, status: CallStatus) -> IngestOutcome {
        let outcome = match self.registry.mark_ended(call_id, status).await {
            EndOutcome::Unknown => match self.recover_from_store(call_id).await {
                Ok(Recovered::Live(_)) => self.registry.mark_ended(call_id, status).await,
                Ok(Recovered::Ended(stored)) => {
                    self.registry.forget_announcement(call_id);
                    let previous = stored.ended_status.unwrap_or(status);
                    debug!(
                        "Ingest: duplicate terminal event {} for call {} (stored as {})",
                        status, call_id, previous
                    );
                    return IngestOutcome::DuplicateTerminal(previous);
                }
                Ok(Recovered::Absent) => EndOutcome::Unknown,
                Err(e) => {
                    error!("Ingest: cannot look up call {} in storage: {}", call_id, e);
                    EndOutcome::Unknown
                }
            },
            outcome => outcome,
        };

        match outcome {
            EndOutcome::Ended(mut session) => {
                let context = session.context();
                let ended_at = Utc::now();

                let durable = match self.ensure_persisted(&mut session).await {
                    Ok(()) => self.store.mark_ended(context.session_id, status, ended_at).await,
                    Err(e) => Err(e),
                };
                match durable {
                    Ok(()) => {
                        let message = ObserverMessage::SessionEnded {
                            session_id: context.session_id,
                            call_id: call_id.to_string(),
                            status,
                            timestamp: ended_at,
                        };
                        self.hub.publish(context.session_id, message).await;
                    }
                    Err(e) => error!(
                        "Ingest: failed to persist end of call {}, not broadcasting it: {}",
                        call_id, e
                    ),
                }

                info!(
                    "Ingest: call {} ended with {} after {} fragment(s)",
                    call_id,
                    status,
                    session.transcript().len()
                );
                IngestOutcome::SessionEnded(status)
            }
            EndOutcome::AlreadyEnded(previous) => {
                debug!("Ingest: duplicate terminal event {} for call {} (ended {})", status, call_id, previous);
                IngestOutcome::DuplicateTerminal(previous)
            }
            EndOutcome::Unknown => {
                if self.registry.remove(call_id).is_none() {
                    info!("Ingest: terminal event {} for unknown call {}", status, call_id);
                }
                IngestOutcome::UnknownCall
            }
        }
    }

    /// Look up a call missing from the registry in durable storage
    ///
    /// An active stored session is restored with its transcript and adopted,
    /// so a call keeps one session across eviction and restarts.
    async fn recover_from_store(&self, call_id: &str) -> callhub_common::Result<Recovered> {
        let stored = match self.store.find_by_call_id(call_id).await? {
            None => return Ok(Recovered::Absent),
            Some(stored) if !stored.is_active() => return Ok(Recovered::Ended(stored)),
            Some(stored) => stored,
        };

        let transcript = self.store.transcript(stored.context.session_id).await?;
        info!(
            "Ingest: restoring session {} for call {} with {} fragment(s)",
            stored.context.session_id,
            call_id,
            transcript.len()
        );
        let restored = CallSession::restore(stored.context, stored.stream_id, transcript);
        Ok(Recovered::Live(self.registry.adopt(restored).0))
    }

    async fn ensure_persisted(&self, session: &mut CallSession) -> callhub_common::Result<()> {
        if session.is_persisted() {
            return Ok(());
        }
        self.store
            .create_session(&session.context(), session.stream_id())
            .await?;
        session.mark_persisted();
        Ok(())
    }

    /// Open (or return) the session for a client session-create request
    ///
    /// Idempotent on `call_id`. A session already evicted from memory is
    /// restored from durable storage when still active; an ended one is
    /// returned as recorded.
    pub async fn open_session(&self, request: SessionRequest) -> callhub_common::Result<OpenedSession> {
        let init = SessionInit {
            lead_id: request.lead_id,
            owner_id: request.owner_id,
        };
        let call_id = request.call_id;

        let (handle, created) = match self.registry.get(&call_id) {
            Some(handle) => (handle, false),
            None => match self.recover_from_store(&call_id).await? {
                Recovered::Live(handle) => (handle, false),
                Recovered::Ended(stored) => {
                    debug!("Ingest: session for call {} already ended, returning stored record", call_id);
                    return Ok(stored.into());
                }
                Recovered::Absent => self.registry.get_or_create(&call_id, init.clone()),
            },
        };

        let mut session = handle.lock().await;
        let refs_changed = !created && session.is_active() && session.fill_refs(&init);
        session.touch();

        if !session.is_persisted() {
            if let Err(e) = self.ensure_persisted(&mut session).await {
                error!("Ingest: failed to persist session for call {}: {}", call_id, e);
            }
        } else if refs_changed {
            if let Err(e) = self
                .store
                .update_session_refs(&session.context(), session.stream_id())
                .await
            {
                error!("Ingest: failed to persist references for call {}: {}", call_id, e);
            }
        }

        if created {
            info!("Ingest: session {} opened for call {}", session.session_id(), call_id);
        }
        Ok(OpenedSession::from_live(&session, created))
    }

    /// Expire idle sessions and evict old ones as of `now`
    pub async fn expire_idle(&self, now: Instant, policy: &SweepPolicy) -> SweepReport {
        let report = self.registry.sweep(now, policy.idle_timeout, policy.ended_retention);
        for call_id in &report.idle {
            info!("Ingest: call {} idle past {:?}, expiring", call_id, policy.idle_timeout);
            self.end_session(call_id, CallStatus::Expired).await;
        }
        if !report.evicted.is_empty() || report.stale_announcements > 0 {
            debug!(
                "Ingest: evicted {} ended session(s), {} stale announcement(s)",
                report.evicted.len(),
                report.stale_announcements
            );
        }
        report
    }

    /// Run [`EventIngestor::expire_idle`] every `policy.interval`
    pub fn spawn_sweeper(&self, policy: SweepPolicy) -> JoinHandle<()> {
        let ingestor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(policy.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                ingestor.expire_idle(Instant::now(), &policy).await;
            }
        })
    }
}
