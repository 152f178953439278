//! Database schema migrations.
//!
//! Creates all required tables (posts, multimodal_cache, crawl_state,
//! kv_cache) and ensures idempotent execution. Designed to be run via
//! `cqa init`; every gateway also runs it lazily on first connect.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Post completion markers: one row per ingested post.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS posts (
            title TEXT NOT NULL,
            image_urls TEXT NOT NULL DEFAULT '[]',
            content_hash TEXT NOT NULL,
            board_type TEXT NOT NULL,
            date TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            UNIQUE(title, content_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // OCR / document-parse cache, keyed by source URL with a secondary
    // content-hash index for duplicate bytes at distinct URLs.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS multimodal_cache (
            url TEXT PRIMARY KEY,
            file_hash TEXT,
            kind TEXT NOT NULL,
            text TEXT NOT NULL DEFAULT '',
            markdown TEXT NOT NULL DEFAULT '',
            html TEXT NOT NULL DEFAULT '',
            failed INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-board incremental crawl state.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crawl_state (
            board_type TEXT PRIMARY KEY,
            last_processed_id INTEGER NOT NULL,
            last_updated TEXT NOT NULL,
            processed_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Byte-blob cache with TTL (BM25 corpus, metadata snapshot).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_cache (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_title ON posts(title)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_board_type ON posts(board_type)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_multimodal_file_hash ON multimodal_cache(file_hash)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("test.db")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        for expected in ["posts", "multimodal_cache", "crawl_state", "kv_cache"] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
        pool.close().await;
    }
}
