//! Relational side of the store: the `vector_metadata` table and the
//! statements run against it. Every function takes a bare connection so it
//! works both inside a `ScopedTransaction` and on a pooled connection.

use std::path::Path;

use chrono::NaiveDateTime;
use sqlx::sqlite::SqliteConnection;

use crate::models::MetadataRow;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS vector_metadata (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chroma_id TEXT NOT NULL UNIQUE,
        metadata TEXT NOT NULL CHECK (json_valid(metadata)),
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        CONSTRAINT valid_chroma_id CHECK (length(chroma_id) > 0)
    )",
    "CREATE INDEX IF NOT EXISTS idx_chroma_id ON vector_metadata(chroma_id)",
    "CREATE INDEX IF NOT EXISTS idx_created_at ON vector_metadata(created_at)",
    "CREATE TRIGGER IF NOT EXISTS update_timestamp
        AFTER UPDATE ON vector_metadata
        BEGIN
            UPDATE vector_metadata SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
        END",
];

// ====== SCHEMA ======

pub async fn initialize_schema(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    tracing::debug!("vector_metadata schema ready");
    Ok(())
}

pub async fn health_check(conn: &mut SqliteConnection) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT sqlite_version()")
        .fetch_one(conn)
        .await?;
    Ok(row.0)
}

/// Size of the database file in bytes, as SQLite sees it.
pub async fn database_size(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
    )
    .fetch_one(conn)
    .await
}

// ====== RECORDS ======

pub async fn insert_metadata(
    conn: &mut SqliteConnection,
    id: &str,
    metadata_json: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("INSERT INTO vector_metadata (chroma_id, metadata) VALUES ($1, $2)")
        .bind(id)
        .bind(metadata_json)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn fetch_metadata(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<MetadataRow>, sqlx::Error> {
    sqlx::query_as::<_, MetadataRow>(
        "SELECT id, chroma_id, metadata, created_at, updated_at
         FROM vector_metadata WHERE chroma_id = $1",
    )
    .bind(id)
    .fetch_optional(conn)
    .await
}

pub async fn fetch_all_metadata(
    conn: &mut SqliteConnection,
) -> Result<Vec<MetadataRow>, sqlx::Error> {
    sqlx::query_as::<_, MetadataRow>(
        "SELECT id, chroma_id, metadata, created_at, updated_at
         FROM vector_metadata ORDER BY id",
    )
    .fetch_all(conn)
    .await
}

pub async fn update_metadata(
    conn: &mut SqliteConnection,
    id: &str,
    metadata_json: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE vector_metadata SET metadata = $1 WHERE chroma_id = $2")
        .bind(metadata_json)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_metadata(conn: &mut SqliteConnection, id: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM vector_metadata WHERE chroma_id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn clear_metadata(conn: &mut SqliteConnection) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM vector_metadata")
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn count_metadata(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM vector_metadata")
        .fetch_one(conn)
        .await
}

/// Every stored id with its creation time, for reconciliation.
pub async fn list_ids(
    conn: &mut SqliteConnection,
) -> Result<Vec<(String, NaiveDateTime)>, sqlx::Error> {
    sqlx::query_as("SELECT chroma_id, created_at FROM vector_metadata ORDER BY id")
        .fetch_all(conn)
        .await
}

/// Largest millisecond component among stored `vec_<millis>` ids.
pub async fn max_record_id(conn: &mut SqliteConnection) -> Result<Option<u64>, sqlx::Error> {
    let max: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(CAST(substr(chroma_id, 5) AS INTEGER))
         FROM vector_metadata WHERE chroma_id LIKE 'vec\\_%' ESCAPE '\\'",
    )
    .fetch_one(conn)
    .await?;
    Ok(max.and_then(|m| u64::try_from(m).ok()))
}

// ====== MAINTENANCE ======

pub async fn wal_checkpoint(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA wal_checkpoint(FULL)")
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn vacuum(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query("VACUUM").execute(conn).await?;
    Ok(())
}

/// Write a consistent, compacted copy of the database to `target`.
pub async fn vacuum_into(conn: &mut SqliteConnection, target: &Path) -> Result<(), sqlx::Error> {
    sqlx::query("VACUUM INTO $1")
        .bind(target.to_string_lossy().into_owned())
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::{ConnectionPool, PooledConnection};

    async fn schema_conn() -> (tempfile::TempDir, ConnectionPool, PooledConnection) {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = ConnectionPool::open(&dir.path().join("meta.db"), &PoolConfig::default())
            .await
            .expect("open pool");
        let mut conn = pool.acquire().await.expect("acquire");
        initialize_schema(&mut conn).await.expect("schema");
        (dir, pool, conn)
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let (_dir, _pool, mut conn) = schema_conn().await;
        initialize_schema(&mut conn).await.expect("second run");
        assert!(health_check(&mut conn).await.expect("version").starts_with('3'));
        assert!(database_size(&mut conn).await.expect("size") > 0);
    }

    #[tokio::test]
    async fn test_insert_fetch_update_delete() {
        let (_dir, _pool, mut conn) = schema_conn().await;
        assert_eq!(
            insert_metadata(&mut conn, "vec_10", r#"{"tag":"a"}"#)
                .await
                .expect("insert"),
            1
        );
        let row = fetch_metadata(&mut conn, "vec_10")
            .await
            .expect("fetch")
            .expect("row present");
        assert_eq!(row.metadata, r#"{"tag":"a"}"#);

        assert_eq!(
            update_metadata(&mut conn, "vec_10", r#"{"tag":"b"}"#)
                .await
                .expect("update"),
            1
        );
        assert_eq!(
            update_metadata(&mut conn, "vec_99", r#"{"tag":"b"}"#)
                .await
                .expect("update missing"),
            0
        );
        assert_eq!(delete_metadata(&mut conn, "vec_10").await.expect("delete"), 1);
        assert_eq!(delete_metadata(&mut conn, "vec_10").await.expect("delete again"), 0);
        assert!(fetch_metadata(&mut conn, "vec_10").await.expect("fetch").is_none());
    }

    #[tokio::test]
    async fn test_constraints_reject_bad_rows() {
        let (_dir, _pool, mut conn) = schema_conn().await;
        assert!(insert_metadata(&mut conn, "vec_1", "not json").await.is_err());
        assert!(insert_metadata(&mut conn, "", "{}").await.is_err());
        insert_metadata(&mut conn, "vec_1", "{}").await.expect("first");
        assert!(insert_metadata(&mut conn, "vec_1", "{}").await.is_err());
    }

    #[tokio::test]
    async fn test_max_record_id_and_count() {
        let (_dir, _pool, mut conn) = schema_conn().await;
        assert_eq!(max_record_id(&mut conn).await.expect("empty max"), None);
        for id in ["vec_5", "vec_1700000000123", "vec_42"] {
            insert_metadata(&mut conn, id, r#"{"k":1}"#).await.expect("insert");
        }
        assert_eq!(
            max_record_id(&mut conn).await.expect("max"),
            Some(1_700_000_000_123)
        );
        assert_eq!(count_metadata(&mut conn).await.expect("count"), 3);
        assert_eq!(list_ids(&mut conn).await.expect("ids").len(), 3);
        assert_eq!(clear_metadata(&mut conn).await.expect("clear"), 3);
        assert_eq!(count_metadata(&mut conn).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_vacuum_into_writes_copy() {
        let (dir, _pool, mut conn) = schema_conn().await;
        insert_metadata(&mut conn, "vec_1", r#"{"k":1}"#).await.expect("insert");
        wal_checkpoint(&mut conn).await.expect("checkpoint");
        vacuum(&mut conn).await.expect("vacuum");
        let target = dir.path().join("copy.db");
        vacuum_into(&mut conn, &target).await.expect("vacuum into");
        assert!(target.exists());
    }
}
