//! The storage gateway: every external handle, constructed once and passed
//! explicitly.
//!
//! No module-level clients, no import-time side effects. `Gateway::connect`
//! opens the SQLite pool (running migrations), builds the HTTP clients from
//! configuration + environment secrets, and hands the bundle to whichever
//! pipeline needs it.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::clock::Clock;
use crate::config::{Config, Secrets};
use crate::embedding::EmbeddingClient;
use crate::extract::ContentExtractor;
use crate::fetch::FileFetcher;
use crate::kv::KvCache;
use crate::llm::ChatClient;
use crate::store::DocumentStore;
use crate::vector::VectorIndexClient;
use crate::{db, migrate};

pub struct Gateway {
    pub config: Config,
    pub secrets: Secrets,
    pub clock: Clock,
    pub pool: SqlitePool,
    pub kv: KvCache,
    pub store: DocumentStore,
    pub vector: VectorIndexClient,
    pub embeddings: EmbeddingClient,
    pub extractor: ContentExtractor,
    pub llm: ChatClient,
    pub fetcher: FileFetcher,
}

impl Gateway {
    pub async fn connect(config: Config, secrets: Secrets) -> Result<Self> {
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;

        let clock = Clock::new(config.time.utc_offset_hours);
        let kv = KvCache::new(pool.clone());
        let store = DocumentStore::new(pool.clone());
        let vector = VectorIndexClient::new(&config.vector, &secrets.vector_api_key)?;
        let embeddings = EmbeddingClient::new(&config.embedding, &secrets.ai_api_key)?;
        let extractor = ContentExtractor::new(&config.extractor, &secrets.ai_api_key)?;
        let llm = ChatClient::new(&config.llm, &secrets.ai_api_key)?;
        let fetcher = FileFetcher::new(
            config.crawl.http_timeout_secs,
            config.crawl.max_retries,
            config.crawl.retry_delay_secs,
        )?;

        Ok(Self {
            config,
            secrets,
            clock,
            pool,
            kv,
            store,
            vector,
            embeddings,
            extractor,
            llm,
            fetcher,
        })
    }
}
