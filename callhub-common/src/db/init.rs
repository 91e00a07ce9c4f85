//! Database initialization
//!
//! Schema creation is idempotent; every table uses `CREATE TABLE IF NOT EXISTS`
//! so startup against an existing database is a no-op.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Open (creating if needed) the session database and ensure the schema
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL lets observers' history reads proceed while webhooks write
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    configure(&pool).await?;
    Ok(pool)
}

/// In-memory database with the full schema (one connection, so every query
/// sees the same database)
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    configure(&pool).await?;
    Ok(pool)
}

async fn configure(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    create_call_sessions_table(pool).await?;
    create_transcript_fragments_table(pool).await?;
    create_call_recordings_table(pool).await?;
    Ok(())
}

async fn create_call_sessions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_sessions (
            session_id TEXT PRIMARY KEY,
            call_id TEXT NOT NULL UNIQUE,
            lead_id TEXT,
            owner_id TEXT,
            stream_id TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            started_at TEXT NOT NULL,
            ended_at TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_transcript_fragments_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcript_fragments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES call_sessions(session_id) ON DELETE CASCADE,
            seq INTEGER NOT NULL,
            speaker TEXT NOT NULL,
            content TEXT NOT NULL,
            is_final INTEGER NOT NULL,
            confidence REAL,
            timestamp TEXT NOT NULL,
            UNIQUE (session_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_call_recordings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_recordings (
            session_id TEXT NOT NULL REFERENCES call_sessions(session_id) ON DELETE CASCADE,
            recording_id TEXT NOT NULL,
            call_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            storage_ref TEXT NOT NULL,
            duration_secs INTEGER,
            processing_result TEXT,
            stored_at TEXT NOT NULL,
            PRIMARY KEY (session_id, recording_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
