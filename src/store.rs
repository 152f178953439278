//! Document-store gateway.
//!
//! Maps string keys to structured records with unique secondary indexes.
//! Three record families live here: post completion markers (ingestion
//! dedup), the multimodal extraction cache (two-key: URL and content hash),
//! and per-board crawl state.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::BoardKind;

/// A cached extraction result for one artefact URL.
#[derive(Debug, Clone, Default)]
pub struct CachedExtraction {
    pub url: String,
    pub file_hash: Option<String>,
    pub kind: String,
    pub text: String,
    pub markdown: String,
    pub html: String,
    pub failed: bool,
}

/// Crawl state for one board.
#[derive(Debug, Clone)]
pub struct CrawlStateRow {
    pub board_type: String,
    pub last_processed_id: u32,
    pub last_updated: String,
    pub processed_count: i64,
}

#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    // ============ Post markers ============

    /// True when a post with this title and content hash is already
    /// ingested. A changed hash for the same title reads as "not processed"
    /// so edited posts re-ingest.
    pub async fn is_post_processed(&self, title: &str, content_hash: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE title = ? AND content_hash = ?")
                .bind(title)
                .bind(content_hash)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    pub async fn mark_post_processed(
        &self,
        title: &str,
        image_urls: &[String],
        content_hash: &str,
        board_type: BoardKind,
        date: &str,
    ) -> Result<()> {
        let images_json = serde_json::to_string(image_urls)?;
        sqlx::query(
            r#"
            INSERT INTO posts (title, image_urls, content_hash, board_type, date, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(title, content_hash) DO UPDATE SET
                image_urls = excluded.image_urls,
                board_type = excluded.board_type,
                date = excluded.date
            "#,
        )
        .bind(title)
        .bind(images_json)
        .bind(content_hash)
        .bind(board_type.as_str())
        .bind(date)
        .bind(Self::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove stale markers for a title whose content hash changed.
    pub async fn delete_post_markers(&self, title: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM posts WHERE title = ?")
            .bind(title)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Image URLs recorded for a post title, newest marker first.
    pub async fn images_for_title(&self, title: &str) -> Result<Vec<String>> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT image_urls FROM posts WHERE title = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(title)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    pub async fn count_posts(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?)
    }

    // ============ Multimodal cache ============

    pub async fn extraction_by_url(&self, url: &str) -> Result<Option<CachedExtraction>> {
        let row = sqlx::query(
            "SELECT url, file_hash, kind, text, markdown, html, failed FROM multimodal_cache WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Self::row_to_extraction))
    }

    pub async fn extraction_by_hash(&self, file_hash: &str) -> Result<Option<CachedExtraction>> {
        let row = sqlx::query(
            "SELECT url, file_hash, kind, text, markdown, html, failed FROM multimodal_cache WHERE file_hash = ? LIMIT 1",
        )
        .bind(file_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Self::row_to_extraction))
    }

    pub async fn put_extraction(&self, entry: &CachedExtraction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO multimodal_cache (url, file_hash, kind, text, markdown, html, failed, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                file_hash = excluded.file_hash,
                kind = excluded.kind,
                text = excluded.text,
                markdown = excluded.markdown,
                html = excluded.html,
                failed = excluded.failed
            "#,
        )
        .bind(&entry.url)
        .bind(&entry.file_hash)
        .bind(&entry.kind)
        .bind(&entry.text)
        .bind(&entry.markdown)
        .bind(&entry.html)
        .bind(entry.failed as i64)
        .bind(Self::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_extraction(row: sqlx::sqlite::SqliteRow) -> CachedExtraction {
        CachedExtraction {
            url: row.get("url"),
            file_hash: row.get("file_hash"),
            kind: row.get("kind"),
            text: row.get("text"),
            markdown: row.get("markdown"),
            html: row.get("html"),
            failed: row.get::<i64, _>("failed") != 0,
        }
    }

    // ============ Crawl state ============

    pub async fn get_last_processed_id(&self, board: BoardKind) -> Result<Option<u32>> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT last_processed_id FROM crawl_state WHERE board_type = ?")
                .bind(board.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.map(|v| v as u32))
    }

    pub async fn update_last_processed_id(
        &self,
        board: BoardKind,
        last_id: u32,
        processed_count: i64,
        now_iso: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crawl_state (board_type, last_processed_id, last_updated, processed_count)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(board_type) DO UPDATE SET
                last_processed_id = excluded.last_processed_id,
                last_updated = excluded.last_updated,
                processed_count = excluded.processed_count
            "#,
        )
        .bind(board.as_str())
        .bind(last_id as i64)
        .bind(now_iso)
        .bind(processed_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all_crawl_states(&self) -> Result<Vec<CrawlStateRow>> {
        let rows = sqlx::query(
            "SELECT board_type, last_processed_id, last_updated, processed_count FROM crawl_state ORDER BY board_type",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| CrawlStateRow {
                board_type: row.get("board_type"),
                last_processed_id: row.get::<i64, _>("last_processed_id") as u32,
                last_updated: row.get("last_updated"),
                processed_count: row.get("processed_count"),
            })
            .collect())
    }

    pub async fn reset_crawl_state(&self, board: BoardKind) -> Result<()> {
        sqlx::query("DELETE FROM crawl_state WHERE board_type = ?")
            .bind(board.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
