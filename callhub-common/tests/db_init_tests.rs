//! Database initialization tests

use callhub_common::db::{init_database, init_memory_database};
use tempfile::TempDir;

async fn table_names(pool: &sqlx::SqlitePool) -> Vec<String> {
    sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .fetch_all(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_creates_database_and_schema() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("callhub.db");

    let pool = init_database(&db_path).await.expect("database should initialize");

    assert!(db_path.exists());
    let tables = table_names(&pool).await;
    assert!(tables.contains(&"call_sessions".to_string()));
    assert!(tables.contains(&"transcript_fragments".to_string()));
    assert!(tables.contains(&"call_recordings".to_string()));
}

#[tokio::test]
async fn test_reinitialization_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("callhub.db");

    let pool = init_database(&db_path).await.unwrap();
    sqlx::query(
        "INSERT INTO call_sessions (session_id, call_id, started_at, updated_at) VALUES ('s1', 'CA1', 'now', 'now')",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    let pool = init_database(&db_path).await.expect("second init should succeed");
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM call_sessions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1, "existing rows survive re-initialization");
}

#[tokio::test]
async fn test_call_id_is_unique() {
    let pool = init_memory_database().await.unwrap();

    let insert = "INSERT INTO call_sessions (session_id, call_id, started_at, updated_at) VALUES (?, 'CA1', 'now', 'now')";
    sqlx::query(insert).bind("s1").execute(&pool).await.unwrap();
    let duplicate = sqlx::query(insert).bind("s2").execute(&pool).await;

    assert!(duplicate.is_err());
}

#[tokio::test]
async fn test_fragments_require_session() {
    let pool = init_memory_database().await.unwrap();

    let orphan = sqlx::query(
        "INSERT INTO transcript_fragments (session_id, seq, speaker, content, is_final, timestamp) VALUES ('missing', 0, 'Agent', 'hi', 1, 'now')",
    )
    .execute(&pool)
    .await;

    assert!(orphan.is_err(), "foreign keys are enforced");
}
