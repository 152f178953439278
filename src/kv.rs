//! Byte-blob key/value cache with TTL.
//!
//! Backs the warm BM25 corpus and the metadata snapshot. The contract is the
//! classic cache quartet — `get`, `setex`, `delete`, `exists` — plus `ping`;
//! expiry is enforced on read so a stale blob is never served.

use anyhow::Result;
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct KvCache {
    pool: SqlitePool,
}

impl KvCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>, i64)> =
            sqlx::query_as("SELECT value, expires_at FROM kv_cache WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((value, expires_at)) if expires_at > Self::now() => Ok(Some(value)),
            Some(_) => {
                // Expired entry: drop it eagerly.
                self.delete(key).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn setex(&self, key: &str, ttl_seconds: i64, value: &[u8]) -> Result<()> {
        let expires_at = Self::now() + ttl_seconds;
        sqlx::query(
            r#"
            INSERT INTO kv_cache (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
