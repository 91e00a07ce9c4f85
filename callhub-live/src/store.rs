//! Session persistence adapter
//!
//! `SessionStore` is the boundary to durable storage for call sessions,
//! transcript fragments and recording references. `SqliteSessionStore` is the
//! shipped implementation over the shared callhub database.

use async_trait::async_trait;
use callhub_common::events::{CallStatus, Speaker, TranscriptFragment};
use callhub_common::time::parse_rfc3339;
use callhub_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::registry::SessionContext;

/// A session as durable storage knows it
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub context: SessionContext,
    pub stream_id: Option<String>,
    /// `None` while the call is active
    pub ended_status: Option<CallStatus>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StoredSession {
    pub fn is_active(&self) -> bool {
        self.ended_status.is_none()
    }
}

/// A stored recording attached to a session
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingRecord {
    pub session_id: Uuid,
    pub call_id: String,
    pub recording_id: String,
    pub filename: String,
    pub storage_ref: String,
    pub duration_secs: Option<u32>,
    pub stored_at: DateTime<Utc>,
}

/// Durable storage for sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert the session row
    ///
    /// Re-inserting the same session is a no-op. `Error::Conflict` when the
    /// call already has a row under a different session id.
    async fn create_session(&self, context: &SessionContext, stream_id: Option<&str>) -> Result<()>;

    /// Rewrite lead/owner/stream references
    async fn update_session_refs(&self, context: &SessionContext, stream_id: Option<&str>) -> Result<()>;

    /// Persist fragment `seq` of a session; re-persisting the same seq is a no-op
    async fn append_fragment(&self, session_id: Uuid, seq: usize, fragment: &TranscriptFragment) -> Result<()>;

    /// End an active session row; `Error::Conflict` if it had already ended,
    /// `Error::NotFound` if there is no row
    async fn mark_ended(&self, session_id: Uuid, status: CallStatus, ended_at: DateTime<Utc>) -> Result<()>;

    async fn find_by_call_id(&self, call_id: &str) -> Result<Option<StoredSession>>;

    async fn find_by_session_id(&self, session_id: Uuid) -> Result<Option<StoredSession>>;

    /// Fragments in arrival order
    async fn transcript(&self, session_id: Uuid) -> Result<Vec<TranscriptFragment>>;

    /// Attach (or overwrite) a stored recording reference
    async fn attach_recording(&self, record: &RecordingRecord) -> Result<()>;

    /// Save the downstream reprocessing answer for a recording
    async fn record_processing_result(
        &self,
        session_id: Uuid,
        recording_id: &str,
        result: &serde_json::Value,
    ) -> Result<()>;
}

/// SQLite-backed session store
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn find_where(&self, column: &str, value: &str) -> Result<Option<StoredSession>> {
        let sql = format!(
            r#"
            SELECT session_id, call_id, lead_id, owner_id, stream_id, status, started_at, ended_at
            FROM call_sessions
            WHERE {} = ?
            "#,
            column
        );
        let row = sqlx::query(&sql).bind(value).fetch_optional(&self.pool).await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let session_id: String = row.get("session_id");
        let session_id = Uuid::parse_str(&session_id)
            .map_err(|e| Error::Internal(format!("Invalid session_id {}: {}", session_id, e)))?;

        let started_at: String = row.get("started_at");
        let started_at = parse_rfc3339(&started_at)
            .ok_or_else(|| Error::Internal(format!("Invalid started_at: {}", started_at)))?;

        let status: String = row.get("status");
        let ended_status = if status == "active" {
            None
        } else {
            Some(
                CallStatus::parse(&status)
                    .ok_or_else(|| Error::Internal(format!("Invalid session status: {}", status)))?,
            )
        };

        let ended_at: Option<String> = row.get("ended_at");

        Ok(Some(StoredSession {
            context: SessionContext {
                call_id: row.get("call_id"),
                session_id,
                lead_id: row.get("lead_id"),
                owner_id: row.get("owner_id"),
                started_at,
            },
            stream_id: row.get("stream_id"),
            ended_status,
            ended_at: ended_at.as_deref().and_then(parse_rfc3339),
        }))
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, context: &SessionContext, stream_id: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let inserted = sqlx::query(
            r#"
            INSERT INTO call_sessions (
                session_id, call_id, lead_id, owner_id, stream_id, status, started_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 'active', ?, ?)
            ON CONFLICT(call_id) DO NOTHING
            "#,
        )
        .bind(context.session_id.to_string())
        .bind(&context.call_id)
        .bind(&context.lead_id)
        .bind(&context.owner_id)
        .bind(stream_id)
        .bind(context.started_at.to_rfc3339())
        .bind(&now)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            return Ok(());
        }

        let existing: Option<String> = sqlx::query_scalar("SELECT session_id FROM call_sessions WHERE call_id = ?")
            .bind(&context.call_id)
            .fetch_optional(&self.pool)
            .await?;
        match existing {
            Some(id) if id == context.session_id.to_string() => Ok(()),
            Some(id) => Err(Error::Conflict(format!(
                "call {} is already stored as session {}",
                context.call_id, id
            ))),
            None => Err(Error::Internal(format!(
                "session row for call {} was neither inserted nor found",
                context.call_id
            ))),
        }
    }

    async fn update_session_refs(&self, context: &SessionContext, stream_id: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE call_sessions
            SET lead_id = ?, owner_id = ?, stream_id = COALESCE(?, stream_id), updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(&context.lead_id)
        .bind(&context.owner_id)
        .bind(stream_id)
        .bind(Utc::now().to_rfc3339())
        .bind(context.session_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_fragment(&self, session_id: Uuid, seq: usize, fragment: &TranscriptFragment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO transcript_fragments (
                session_id, seq, speaker, content, is_final, confidence, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id.to_string())
        .bind(seq as i64)
        .bind(fragment.speaker.as_str())
        .bind(&fragment.content)
        .bind(fragment.is_final)
        .bind(fragment.confidence)
        .bind(fragment.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_ended(&self, session_id: Uuid, status: CallStatus, ended_at: DateTime<Utc>) -> Result<()> {
        let ended_at = ended_at.to_rfc3339();
        let updated = sqlx::query(
            r#"
            UPDATE call_sessions
            SET status = ?, ended_at = ?, updated_at = ?
            WHERE session_id = ? AND status = 'active'
            "#,
        )
        .bind(status.as_str())
        .bind(&ended_at)
        .bind(&ended_at)
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 1 {
            return Ok(());
        }

        match self.find_by_session_id(session_id).await? {
            Some(stored) => Err(Error::Conflict(format!(
                "session {} already ended with {}",
                session_id,
                stored.ended_status.map(|s| s.as_str()).unwrap_or("unknown")
            ))),
            None => Err(Error::NotFound(format!("session {}", session_id))),
        }
    }

    async fn find_by_call_id(&self, call_id: &str) -> Result<Option<StoredSession>> {
        self.find_where("call_id", call_id).await
    }

    async fn find_by_session_id(&self, session_id: Uuid) -> Result<Option<StoredSession>> {
        self.find_where("session_id", &session_id.to_string()).await
    }

    async fn transcript(&self, session_id: Uuid) -> Result<Vec<TranscriptFragment>> {
        let rows = sqlx::query(
            r#"
            SELECT speaker, content, is_final, confidence, timestamp
            FROM transcript_fragments
            WHERE session_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let speaker: String = row.get("speaker");
                let speaker = Speaker::parse(&speaker)
                    .ok_or_else(|| Error::Internal(format!("Invalid speaker: {}", speaker)))?;
                let timestamp: String = row.get("timestamp");
                let timestamp = parse_rfc3339(&timestamp)
                    .ok_or_else(|| Error::Internal(format!("Invalid fragment timestamp: {}", timestamp)))?;
                Ok(TranscriptFragment {
                    speaker,
                    content: row.get("content"),
                    timestamp,
                    is_final: row.get("is_final"),
                    confidence: row.get("confidence"),
                })
            })
            .collect()
    }

    async fn attach_recording(&self, record: &RecordingRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO call_recordings (
                session_id, recording_id, call_id, filename, storage_ref, duration_secs, stored_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, recording_id) DO UPDATE SET
                filename = excluded.filename,
                storage_ref = excluded.storage_ref,
                duration_secs = excluded.duration_secs,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(record.session_id.to_string())
        .bind(&record.recording_id)
        .bind(&record.call_id)
        .bind(&record.filename)
        .bind(&record.storage_ref)
        .bind(record.duration_secs.map(i64::from))
        .bind(record.stored_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_processing_result(
        &self,
        session_id: Uuid,
        recording_id: &str,
        result: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE call_recordings SET processing_result = ? WHERE session_id = ? AND recording_id = ?",
        )
        .bind(result.to_string())
        .bind(session_id.to_string())
        .bind(recording_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callhub_common::db::init_memory_database;

    async fn store() -> SqliteSessionStore {
        SqliteSessionStore::new(init_memory_database().await.unwrap())
    }

    fn context(call_id: &str) -> SessionContext {
        SessionContext {
            call_id: call_id.to_string(),
            session_id: Uuid::new_v4(),
            lead_id: Some("lead-1".to_string()),
            owner_id: None,
            started_at: Utc::now(),
        }
    }

    fn fragment(text: &str, confidence: Option<f64>) -> TranscriptFragment {
        TranscriptFragment {
            speaker: Speaker::Customer,
            content: text.to_string(),
            timestamp: Utc::now(),
            is_final: true,
            confidence,
        }
    }

    #[tokio::test]
    async fn test_create_and_find_session() {
        let store = store().await;
        let ctx = context("CA1");

        store.create_session(&ctx, Some("MZ1")).await.unwrap();
        // Re-inserting the same session is accepted
        store.create_session(&ctx, None).await.unwrap();

        let found = store.find_by_call_id("CA1").await.unwrap().expect("session stored");
        assert_eq!(found.context.session_id, ctx.session_id);
        assert_eq!(found.stream_id.as_deref(), Some("MZ1"));
        assert!(found.is_active());

        let by_id = store.find_by_session_id(ctx.session_id).await.unwrap();
        assert_eq!(by_id, Some(found));
        assert!(store.find_by_call_id("CA-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transcript_round_trip_keeps_order_and_unknown_confidence() {
        let store = store().await;
        let ctx = context("CA1");
        store.create_session(&ctx, None).await.unwrap();

        store.append_fragment(ctx.session_id, 0, &fragment("first", Some(0.8))).await.unwrap();
        store.append_fragment(ctx.session_id, 1, &fragment("second", None)).await.unwrap();
        // Redelivered seq is ignored
        store.append_fragment(ctx.session_id, 1, &fragment("dup", None)).await.unwrap();

        let transcript = store.transcript(ctx.session_id).await.unwrap();
        let texts: Vec<&str> = transcript.iter().map(|f| f.content.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert_eq!(transcript[0].confidence, Some(0.8));
        assert_eq!(transcript[1].confidence, None);
    }

    #[tokio::test]
    async fn test_mark_ended_only_once() {
        let store = store().await;
        let ctx = context("CA1");
        store.create_session(&ctx, None).await.unwrap();

        store.mark_ended(ctx.session_id, CallStatus::Completed, Utc::now()).await.unwrap();
        let second = store.mark_ended(ctx.session_id, CallStatus::Failed, Utc::now()).await;
        assert!(matches!(second, Err(Error::Conflict(_))), "got {:?}", second);

        let found = store.find_by_call_id("CA1").await.unwrap().unwrap();
        assert_eq!(found.ended_status, Some(CallStatus::Completed));
        assert!(found.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_ended_without_row_is_not_found() {
        let store = store().await;

        let result = store.mark_ended(Uuid::new_v4(), CallStatus::Completed, Utc::now()).await;

        assert!(matches!(result, Err(Error::NotFound(_))), "got {:?}", result);
    }

    #[tokio::test]
    async fn test_create_session_rejects_second_session_for_call() {
        let store = store().await;
        let first = context("CA1");
        store.create_session(&first, None).await.unwrap();

        let result = store.create_session(&context("CA1"), None).await;

        assert!(matches!(result, Err(Error::Conflict(_))), "got {:?}", result);
        let found = store.find_by_call_id("CA1").await.unwrap().unwrap();
        assert_eq!(found.context.session_id, first.session_id);
    }

    #[tokio::test]
    async fn test_update_refs_keeps_stream_when_absent() {
        let store = store().await;
        let mut ctx = context("CA1");
        store.create_session(&ctx, Some("MZ1")).await.unwrap();

        ctx.owner_id = Some("owner-7".to_string());
        store.update_session_refs(&ctx, None).await.unwrap();

        let found = store.find_by_call_id("CA1").await.unwrap().unwrap();
        assert_eq!(found.context.owner_id.as_deref(), Some("owner-7"));
        assert_eq!(found.stream_id.as_deref(), Some("MZ1"));
    }

    #[tokio::test]
    async fn test_attach_recording_overwrites_on_redelivery() {
        let store = store().await;
        let ctx = context("CA1");
        store.create_session(&ctx, None).await.unwrap();

        let mut record = RecordingRecord {
            session_id: ctx.session_id,
            call_id: "CA1".to_string(),
            recording_id: "RE1".to_string(),
            filename: "a.mp3".to_string(),
            storage_ref: "file:///a.mp3".to_string(),
            duration_secs: Some(30),
            stored_at: Utc::now(),
        };
        store.attach_recording(&record).await.unwrap();
        record.duration_secs = Some(31);
        store.attach_recording(&record).await.unwrap();
        store
            .record_processing_result(ctx.session_id, "RE1", &serde_json::json!({"queued": true}))
            .await
            .unwrap();

        let (count, duration, result): (i64, Option<i64>, Option<String>) = sqlx::query_as(
            "SELECT COUNT(*), MAX(duration_secs), MAX(processing_result) FROM call_recordings",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(duration, Some(31));
        assert_eq!(result.as_deref(), Some(r#"{"queued":true}"#));
    }
}
