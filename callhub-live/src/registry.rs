//! Session registry
//!
//! In-memory map from provider call identifier to live session state. Each
//! session sits behind its own async mutex; the map itself is sharded, so
//! unrelated calls never wait on each other and work for one call is
//! serialized by that call's lock.

use callhub_common::events::{CallStatus, TranscriptFragment};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Shared, lockable session
pub type SessionHandle = Arc<Mutex<CallSession>>;

/// Attributes a session may be created with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInit {
    pub lead_id: Option<String>,
    pub owner_id: Option<String>,
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Ended(CallStatus),
}

/// Attempt to mutate a session that already ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session already ended with status {0}")]
pub struct SessionClosed(pub CallStatus);

/// Owner/lead/timing facts about a session, detached from its lock
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub call_id: String,
    pub session_id: Uuid,
    pub lead_id: Option<String>,
    pub owner_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// One active or recently ended call
#[derive(Debug)]
pub struct CallSession {
    call_id: String,
    session_id: Uuid,
    lead_id: Option<String>,
    owner_id: Option<String>,
    stream_id: Option<String>,
    transcript: Vec<TranscriptFragment>,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    last_activity: Instant,
    ended_at: Option<Instant>,
    state: SessionState,
    persisted: bool,
}

impl CallSession {
    fn new(call_id: &str, init: SessionInit, stream_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            call_id: call_id.to_string(),
            session_id: Uuid::new_v4(),
            lead_id: init.lead_id,
            owner_id: init.owner_id,
            stream_id,
            transcript: Vec::new(),
            started_at: now,
            last_activity_at: now,
            last_activity: Instant::now(),
            ended_at: None,
            state: SessionState::Active,
            persisted: false,
        }
    }

    /// Rebuild an active session from its durable record
    pub fn restore(context: SessionContext, stream_id: Option<String>, transcript: Vec<TranscriptFragment>) -> Self {
        Self {
            call_id: context.call_id,
            session_id: context.session_id,
            lead_id: context.lead_id,
            owner_id: context.owner_id,
            stream_id,
            transcript,
            started_at: context.started_at,
            last_activity_at: Utc::now(),
            last_activity: Instant::now(),
            ended_at: None,
            state: SessionState::Active,
            persisted: true,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn lead_id(&self) -> Option<&str> {
        self.lead_id.as_deref()
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn transcript(&self) -> &[TranscriptFragment] {
        &self.transcript
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Whether the durable session row has been written
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn mark_persisted(&mut self) {
        self.persisted = true;
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            call_id: self.call_id.clone(),
            session_id: self.session_id,
            lead_id: self.lead_id.clone(),
            owner_id: self.owner_id.clone(),
            started_at: self.started_at,
        }
    }

    /// Record activity (any event for this call)
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
        self.last_activity = Instant::now();
    }

    /// Fill in lead/owner references that are still unset
    ///
    /// Present values are never overwritten. Returns true if anything changed.
    pub fn fill_refs(&mut self, init: &SessionInit) -> bool {
        let mut changed = false;
        if self.lead_id.is_none() && init.lead_id.is_some() {
            self.lead_id = init.lead_id.clone();
            changed = true;
        }
        if self.owner_id.is_none() && init.owner_id.is_some() {
            self.owner_id = init.owner_id.clone();
            changed = true;
        }
        changed
    }

    /// Attach the provider stream identifier if none is known yet
    pub fn attach_stream(&mut self, stream_id: Option<String>) {
        if self.stream_id.is_none() {
            self.stream_id = stream_id;
        }
    }

    /// Append a fragment, returning its zero-based position in the buffer
    pub fn append(&mut self, fragment: TranscriptFragment) -> Result<usize, SessionClosed> {
        if let SessionState::Ended(status) = self.state {
            return Err(SessionClosed(status));
        }
        self.touch();
        self.transcript.push(fragment);
        Ok(self.transcript.len() - 1)
    }

    /// Transition to ended; callers check the state first
    fn end(&mut self, status: CallStatus) {
        self.touch();
        self.state = SessionState::Ended(status);
        self.ended_at = Some(Instant::now());
    }
}

/// Result of [`SessionRegistry::mark_ended`]
#[derive(Debug)]
pub enum EndOutcome {
    /// First termination: the caller holds the session lock and owns the
    /// termination side effects
    Ended(OwnedMutexGuard<CallSession>),
    /// Session had already ended (duplicate or late terminal event)
    AlreadyEnded(CallStatus),
    /// No session registered for this call
    Unknown,
}

/// Call announced by the provider before any session exists
#[derive(Debug, Clone)]
struct Announcement {
    stream_id: Option<String>,
    announced_at: Instant,
}

/// What a sweep found
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Active sessions idle past the timeout; the caller expires these
    pub idle: Vec<String>,
    /// Ended sessions removed after their retention window
    pub evicted: Vec<String>,
    /// Stream announcements dropped without ever producing a session
    pub stale_announcements: usize,
}

/// In-memory session registry
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    announced: DashMap<String, Announcement>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the session for `call_id`, creating it if absent
    ///
    /// Returns the handle and whether this call created it. Concurrent callers
    /// for the same call all receive the same handle; exactly one sees `true`.
    pub fn get_or_create(&self, call_id: &str, init: SessionInit) -> (SessionHandle, bool) {
        match self.sessions.entry(call_id.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let stream_id = self
                    .announced
                    .remove(call_id)
                    .and_then(|(_, announcement)| announcement.stream_id);
                let session = CallSession::new(call_id, init, stream_id);
                debug!("Registry: created session {} for call {}", session.session_id, call_id);
                let handle = Arc::new(Mutex::new(session));
                entry.insert(handle.clone());
                (handle, true)
            }
        }
    }

    /// Insert a session rebuilt from durable storage unless one is already live
    pub fn adopt(&self, session: CallSession) -> (SessionHandle, bool) {
        match self.sessions.entry(session.call_id.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                self.announced.remove(&session.call_id);
                let handle = Arc::new(Mutex::new(session));
                entry.insert(handle.clone());
                (handle, true)
            }
        }
    }

    /// Look up a session; absence is not an error
    pub fn get(&self, call_id: &str) -> Option<SessionHandle> {
        self.sessions.get(call_id).map(|entry| entry.value().clone())
    }

    /// End the session for `call_id` exactly once
    pub async fn mark_ended(&self, call_id: &str, status: CallStatus) -> EndOutcome {
        let Some(handle) = self.get(call_id) else {
            return EndOutcome::Unknown;
        };

        let mut session = handle.lock_owned().await;
        let state = session.state;
        match state {
            SessionState::Ended(previous) => EndOutcome::AlreadyEnded(previous),
            SessionState::Active => {
                session.end(status);
                EndOutcome::Ended(session)
            }
        }
    }

    /// Drop a session (and any announcement) from memory
    pub fn remove(&self, call_id: &str) -> Option<SessionHandle> {
        self.announced.remove(call_id);
        self.sessions.remove(call_id).map(|(_, handle)| handle)
    }

    /// Record that the provider announced `call_id` (stream start)
    ///
    /// Does not create a session. If a session already exists the stream id is
    /// attached to it. Returns true for the first announcement of a call.
    pub async fn register_stream(&self, call_id: &str, stream_id: Option<String>) -> bool {
        if let Some(handle) = self.get(call_id) {
            let mut session = handle.lock().await;
            session.attach_stream(stream_id);
            session.touch();
            return false;
        }

        match self.announced.entry(call_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let announcement = entry.get_mut();
                if announcement.stream_id.is_none() {
                    announcement.stream_id = stream_id;
                }
                announcement.announced_at = Instant::now();
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Announcement {
                    stream_id,
                    announced_at: Instant::now(),
                });
                true
            }
        }
    }

    /// Drop a pending announcement without touching any session
    pub fn forget_announcement(&self, call_id: &str) -> bool {
        self.announced.remove(call_id).is_some()
    }

    /// Whether the call has a session or has been announced
    pub fn is_known(&self, call_id: &str) -> bool {
        self.sessions.contains_key(call_id) || self.announced.contains_key(call_id)
    }

    /// Refresh activity for a call; false if nothing is registered
    pub async fn touch(&self, call_id: &str) -> bool {
        if let Some(handle) = self.get(call_id) {
            handle.lock().await.touch();
            return true;
        }
        if let Some(mut announcement) = self.announced.get_mut(call_id) {
            announcement.announced_at = Instant::now();
            return true;
        }
        false
    }

    /// Number of sessions held in memory (active and ended)
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions still active
    ///
    /// Never waits on a session lock. A session locked by a handler counts
    /// as active, so the figure may briefly include a call that is ending.
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| match entry.value().try_lock() {
                Ok(session) => session.is_active(),
                Err(_) => true,
            })
            .count()
    }

    /// Find idle sessions and evict expired ones as of `now`
    ///
    /// Sessions currently locked by an event handler are busy, hence not idle,
    /// and are skipped.
    pub fn sweep(&self, now: Instant, idle_timeout: Duration, ended_retention: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        let handles: Vec<(String, SessionHandle)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (call_id, handle) in handles {
            let (state, last_activity, ended_at) = match handle.try_lock() {
                Ok(session) => (session.state, session.last_activity, session.ended_at),
                Err(_) => continue,
            };
            match state {
                SessionState::Active => {
                    if now.saturating_duration_since(last_activity) >= idle_timeout {
                        report.idle.push(call_id);
                    }
                }
                SessionState::Ended(_) => {
                    let ended_at = ended_at.unwrap_or(last_activity);
                    if now.saturating_duration_since(ended_at) >= ended_retention {
                        self.sessions.remove(&call_id);
                        report.evicted.push(call_id);
                    }
                }
            }
        }

        let before = self.announced.len();
        self.announced
            .retain(|_, a| now.saturating_duration_since(a.announced_at) < idle_timeout);
        report.stale_announcements = before.saturating_sub(self.announced.len());

        report
    }
}
