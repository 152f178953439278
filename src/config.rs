//! Configuration parsing and validation.
//!
//! campus-qa is configured via a TOML file (default: `config/cqa.toml`).
//! The config defines the database path, board URLs and id floors, chunking
//! and retrieval tuning, scoring constants, external service endpoints, and
//! the server bind address. API keys are never stored in the file; they come
//! from the environment and are verified fail-fast before any network use.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::BoardKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    pub boards: BoardsConfig,
    pub embedding: EmbeddingConfig,
    pub extractor: ExtractorConfig,
    pub vector: VectorConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub keywords: KeywordsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeConfig {
    /// Campus timezone as a fixed UTC offset (hours).
    #[serde(default = "default_utc_offset")]
    pub utc_offset_hours: i32,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: default_utc_offset(),
        }
    }
}

fn default_utc_offset() -> i32 {
    9
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    850
}
fn default_chunk_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
    #[serde(default = "default_bm25_normalize")]
    pub bm25_normalize_factor: f64,
    /// Candidates pulled from each first-stage retriever.
    #[serde(default = "default_stage_k")]
    pub bm25_top_k: usize,
    #[serde(default = "default_stage_k")]
    pub dense_top_k: usize,
    /// Candidates kept after fusion.
    #[serde(default = "default_top_k_documents")]
    pub top_k_documents: usize,
    /// Candidates kept after URL deduplication.
    #[serde(default = "default_dedup_k")]
    pub dedup_top_k: usize,
    /// Distinct titles enriched for the final context.
    #[serde(default = "default_distinct_titles")]
    pub distinct_titles: usize,
    #[serde(default = "default_rerank_k")]
    pub rerank_top_k: usize,
    #[serde(default = "default_dense_scale")]
    pub dense_similarity_scale: f64,
    #[serde(default = "default_noun_weight")]
    pub noun_weight: f64,
    #[serde(default = "default_digit_weight")]
    pub digit_weight: f64,
    #[serde(default = "default_cluster_threshold")]
    pub cluster_similarity_threshold: f64,
    /// Recognised for compatibility; not applied as a filter (the extreme
    /// low-score guards and the answerable round-trip decide instead).
    #[serde(default = "default_minimum_similarity")]
    pub minimum_similarity_score: f64,
    #[serde(default = "default_rerank_floor")]
    pub rerank_low_score_floor: f64,
    #[serde(default = "default_initial_floor")]
    pub initial_low_score_floor: f64,
    /// Hard character budget for the assembled LLM context.
    #[serde(default = "default_context_budget")]
    pub max_context_chars: usize,
    /// Per-title score ratio that marks the high-score group.
    #[serde(default = "default_high_score_ratio")]
    pub high_score_ratio: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            bm25_normalize_factor: default_bm25_normalize(),
            bm25_top_k: default_stage_k(),
            dense_top_k: default_stage_k(),
            top_k_documents: default_top_k_documents(),
            dedup_top_k: default_dedup_k(),
            distinct_titles: default_distinct_titles(),
            rerank_top_k: default_rerank_k(),
            dense_similarity_scale: default_dense_scale(),
            noun_weight: default_noun_weight(),
            digit_weight: default_digit_weight(),
            cluster_similarity_threshold: default_cluster_threshold(),
            minimum_similarity_score: default_minimum_similarity(),
            rerank_low_score_floor: default_rerank_floor(),
            initial_low_score_floor: default_initial_floor(),
            max_context_chars: default_context_budget(),
            high_score_ratio: default_high_score_ratio(),
        }
    }
}

fn default_bm25_k1() -> f64 {
    1.5
}
fn default_bm25_b() -> f64 {
    0.75
}
fn default_bm25_normalize() -> f64 {
    24.0
}
fn default_stage_k() -> usize {
    50
}
fn default_top_k_documents() -> usize {
    30
}
fn default_dedup_k() -> usize {
    20
}
fn default_distinct_titles() -> usize {
    5
}
fn default_rerank_k() -> usize {
    5
}
fn default_dense_scale() -> f64 {
    3.26
}
fn default_noun_weight() -> f64 {
    0.20
}
fn default_digit_weight() -> f64 {
    0.24
}
fn default_cluster_threshold() -> f64 {
    0.89
}
fn default_minimum_similarity() -> f64 {
    1.8
}
fn default_rerank_floor() -> f64 {
    -8.0
}
fn default_initial_floor() -> f64 {
    0.5
}
fn default_context_budget() -> usize {
    50_000
}
fn default_high_score_ratio() -> f64 {
    0.6
}

/// Recency-weighting constants. The band values reflect accumulated tuning
/// of the production system; they are configuration, not code.
#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    /// Posts dated on/before this day get a flat weight.
    #[serde(default = "default_baseline_date")]
    pub baseline_date: String,
    #[serde(default = "default_baseline_weight")]
    pub baseline_weight: f64,
    /// Tokens that signal the user wants current information.
    #[serde(default = "default_recent_tokens")]
    pub recent_tokens: Vec<String>,
    /// Tokens that keep old milestone posts relevant (graduation etc.).
    #[serde(default = "default_milestone_tokens")]
    pub milestone_tokens: Vec<String>,
    /// Tokens with their own decay bonus (scholarship etc.).
    #[serde(default = "default_funding_tokens")]
    pub funding_tokens: Vec<String>,
    /// Audience tokens that gate a ±2.0 title adjustment (graduate school).
    #[serde(default = "default_audience_tokens")]
    pub audience_tokens: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            baseline_date: default_baseline_date(),
            baseline_weight: default_baseline_weight(),
            recent_tokens: default_recent_tokens(),
            milestone_tokens: default_milestone_tokens(),
            funding_tokens: default_funding_tokens(),
            audience_tokens: default_audience_tokens(),
        }
    }
}

fn default_baseline_date() -> String {
    "2024-01-01".to_string()
}
fn default_baseline_weight() -> f64 {
    1.35
}
fn default_recent_tokens() -> Vec<String> {
    ["recent", "latest", "now", "current"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_milestone_tokens() -> Vec<String> {
    ["graduation", "interview"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_funding_tokens() -> Vec<String> {
    vec!["scholarship".to_string()]
}
fn default_audience_tokens() -> Vec<String> {
    vec!["graduate".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

fn default_max_workers() -> usize {
    3
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    1
}
fn default_http_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct BoardsConfig {
    /// Scheme + host used to absolutize relative board links.
    pub origin: String,
    /// Board landing URLs, keyed by `BoardKind` string form.
    pub urls: HashMap<String, String>,
    /// Backfill floors: the smallest id a first crawl reaches down to.
    #[serde(default)]
    pub floors: HashMap<String, u32>,
    /// Ids crawled on every notice run regardless of the incremental range.
    #[serde(default)]
    pub additional_notice_ids: Vec<u32>,
    /// Ids crawled when a board has neither prior state nor a floor.
    #[serde(default = "default_first_crawl_window")]
    pub first_crawl_window: u32,
}

fn default_first_crawl_window() -> u32 {
    100
}

impl BoardsConfig {
    pub fn url_for(&self, kind: BoardKind) -> Result<&str> {
        self.urls
            .get(kind.as_str())
            .map(|s| s.as_str())
            .with_context(|| format!("boards.urls missing entry for '{}'", kind))
    }

    pub fn floor_for(&self, kind: BoardKind) -> Option<u32> {
        self.floors.get(kind.as_str()).copied()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible embeddings endpoint base (e.g. `https://api…/v1`).
    pub api_base: String,
    pub model_passage: String,
    pub model_query: String,
    #[serde(default = "default_embed_batch")]
    pub batch_size: usize,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

fn default_embed_batch() -> usize {
    50
}
fn default_dimension() -> usize {
    4096
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractorConfig {
    /// Document-digitization endpoint (multipart upload).
    pub api_base: String,
    #[serde(default = "default_extract_model")]
    pub model: String,
    #[serde(default = "default_extract_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_zip_bytes")]
    pub max_zip_bytes: u64,
    #[serde(default = "default_max_zip_members")]
    pub max_zip_members: usize,
    #[serde(default = "default_max_unpacked_bytes")]
    pub max_unpacked_bytes: u64,
}

fn default_extract_model() -> String {
    "document-parse".to_string()
}
fn default_extract_timeout() -> u64 {
    60
}
fn default_max_zip_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_max_zip_members() -> usize {
    50
}
fn default_max_unpacked_bytes() -> u64 {
    500 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    /// Index data-plane base URL.
    pub api_base: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_upsert_batch")]
    pub upsert_batch: usize,
    #[serde(default = "default_fetch_batch")]
    pub fetch_batch: usize,
}

fn default_upsert_batch() -> usize {
    100
}
fn default_fetch_batch() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible chat-completions base (e.g. `https://api…/v1`).
    pub api_base: String,
    pub model: String,
    /// Smaller model used for temporal-intent parsing.
    #[serde(default)]
    pub intent_model: Option<String>,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f64,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_llm_max_tokens() -> u32 {
    4096
}
fn default_llm_temperature() -> f64 {
    0.0
}
fn default_llm_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    /// `bge` (HTTP cross-encoder endpoint) or `cohere`. Unknown names are a
    /// startup error, not a silent fallback.
    #[serde(default = "default_reranker_type", rename = "type")]
    pub kind: String,
    #[serde(default = "default_reranker_model")]
    pub model: String,
    /// Base URL of the cross-encoder service (bge backend).
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_true")]
    pub use_fp16: bool,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    /// Set to false to run without any reranker.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            kind: default_reranker_type(),
            model: default_reranker_model(),
            api_base: None,
            use_fp16: true,
            timeout_secs: default_http_timeout(),
            enabled: true,
        }
    }
}

fn default_reranker_type() -> String {
    "bge".to_string()
}
fn default_reranker_model() -> String {
    "BAAI/bge-reranker-v2-m3".to_string()
}
fn default_true() -> bool {
    true
}

/// Query-language knobs: stopwords, domain synonym expansion, category and
/// completeness vocabularies, and the negative-answer patterns.
#[derive(Debug, Deserialize, Clone)]
pub struct KeywordsConfig {
    #[serde(default = "default_stopwords")]
    pub stopwords: Vec<String>,
    /// alias → extra tokens injected when the alias appears in a question.
    #[serde(default)]
    pub synonyms: HashMap<String, Vec<String>>,
    #[serde(default = "default_category_tokens")]
    pub category_tokens: Vec<String>,
    /// Tokens stripped before deciding whether a question is a bare
    /// list-recent request.
    #[serde(default = "default_list_strip_tokens")]
    pub list_strip_tokens: Vec<String>,
    #[serde(default = "default_completeness_tokens")]
    pub completeness_tokens: Vec<String>,
    /// Closed set of phrases that mean "the documents do not contain this".
    #[serde(default = "default_negative_patterns")]
    pub negative_patterns: Vec<String>,
}

impl Default for KeywordsConfig {
    fn default() -> Self {
        Self {
            stopwords: default_stopwords(),
            synonyms: HashMap::new(),
            category_tokens: default_category_tokens(),
            list_strip_tokens: default_list_strip_tokens(),
            completeness_tokens: default_completeness_tokens(),
            negative_patterns: default_negative_patterns(),
        }
    }
}

fn default_stopwords() -> Vec<String> {
    [
        "the", "a", "an", "is", "are", "was", "were", "do", "does", "did", "can", "could", "will",
        "would", "please", "tell", "show", "about", "there", "any", "what", "when", "where", "who",
        "how", "document", "post", "content", "information",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_category_tokens() -> Vec<String> {
    ["notice", "notices", "job", "jobs", "hiring", "seminar", "seminars", "lecture", "talk", "event"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_list_strip_tokens() -> Vec<String> {
    [
        "list", "items", "top", "most", "recent", "latest", "now", "current", "notice", "notices",
        "job", "jobs", "hiring", "seminar", "seminars", "lecture", "talk", "event", "posting",
        "postings", "announcement", "announcements",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_completeness_tokens() -> Vec<String> {
    ["all", "every", "everyone", "entire", "complete", "list", "roster", "whole"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_negative_patterns() -> Vec<String> {
    [
        "does not contain",
        "do not contain",
        "no information about",
        "could not find",
        "cannot be found",
        "is not mentioned",
        "are not mentioned",
        "not included in the documents",
        "no related content",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// API keys, read from the environment. Missing required keys abort startup.
#[derive(Debug, Clone)]
pub struct Secrets {
    /// Shared key for the embedding / extraction / chat endpoints.
    pub ai_api_key: String,
    /// Key for the vector index data plane.
    pub vector_api_key: String,
    /// Only required when the cohere reranker is configured.
    pub cohere_api_key: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        let ai_api_key = std::env::var("AI_API_KEY")
            .map_err(|_| anyhow::anyhow!("AI_API_KEY environment variable not set"))?;
        let vector_api_key = std::env::var("VECTOR_API_KEY")
            .map_err(|_| anyhow::anyhow!("VECTOR_API_KEY environment variable not set"))?;
        let cohere_api_key = std::env::var("COHERE_API_KEY").ok();
        Ok(Self {
            ai_api_key,
            vector_api_key,
            cohere_api_key,
        })
    }
}

#[cfg(test)]
impl Config {
    /// A minimal configuration for unit tests; every board points at
    /// `board_url` and all endpoints at `api_base`.
    pub fn for_tests(origin: &str, board_url: &str, api_base: &str) -> Self {
        let mut urls = HashMap::new();
        for kind in BoardKind::all() {
            urls.insert(kind.as_str().to_string(), board_url.to_string());
        }
        Self {
            db: DbConfig {
                path: "test.db".into(),
            },
            server: ServerConfig {
                bind: "127.0.0.1:0".into(),
            },
            time: TimeConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            scoring: ScoringConfig::default(),
            crawl: CrawlConfig::default(),
            boards: BoardsConfig {
                origin: origin.to_string(),
                urls,
                floors: HashMap::new(),
                additional_notice_ids: Vec::new(),
                first_crawl_window: 100,
            },
            embedding: EmbeddingConfig {
                api_base: api_base.to_string(),
                model_passage: "embed-passage".to_string(),
                model_query: "embed-query".to_string(),
                batch_size: 16,
                timeout_secs: 5,
                max_retries: 1,
                dimension: 2,
            },
            extractor: ExtractorConfig {
                api_base: format!("{}/digitize", api_base),
                model: "document-parse".to_string(),
                timeout_secs: 5,
                max_retries: 1,
                max_zip_bytes: default_max_zip_bytes(),
                max_zip_members: default_max_zip_members(),
                max_unpacked_bytes: default_max_unpacked_bytes(),
            },
            vector: VectorConfig {
                api_base: api_base.to_string(),
                timeout_secs: 5,
                upsert_batch: 100,
                fetch_batch: 100,
            },
            llm: LlmConfig {
                api_base: api_base.to_string(),
                model: "solar-mini".to_string(),
                intent_model: None,
                max_tokens: 4096,
                temperature: 0.0,
                timeout_secs: 5,
            },
            reranker: RerankerConfig {
                enabled: false,
                ..Default::default()
            },
            keywords: KeywordsConfig::default(),
        }
    }
}

/// Load and validate the configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be positive");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!("chunking.chunk_overlap must be smaller than chunk_size");
    }
    if config.crawl.max_workers == 0 {
        bail!("crawl.max_workers must be positive");
    }
    for kind in BoardKind::all() {
        if !config.boards.urls.contains_key(kind.as_str()) {
            bail!("boards.urls missing entry for '{}'", kind);
        }
    }
    if config.reranker.enabled
        && config.reranker.kind == "bge"
        && config.reranker.api_base.is_none()
    {
        bail!("reranker.api_base is required for the bge backend");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
[db]
path = "data/cqa.db"

[server]
bind = "0.0.0.0:5000"

[boards]
origin = "https://cse.example.ac.kr"
[boards.urls]
notice = "https://cse.example.ac.kr/bbs/board.php?bo_table=notice"
job = "https://cse.example.ac.kr/bbs/board.php?bo_table=job"
seminar = "https://cse.example.ac.kr/bbs/board.php?bo_table=seminar"
faculty = "https://cse.example.ac.kr/bbs/board.php?bo_table=faculty&lang=en"
guest-faculty = "https://cse.example.ac.kr/bbs/board.php?bo_table=guest&lang=en"
staff = "https://cse.example.ac.kr/bbs/board.php?bo_table=staff&lang=en"
[boards.floors]
notice = 27726
job = 1149
seminar = 246

[embedding]
api_base = "https://api.example.ai/v1"
model_passage = "embedding-passage"
model_query = "embedding-query"

[extractor]
api_base = "https://api.example.ai/v1/document-digitization"

[vector]
api_base = "https://index.example-vectors.io"

[llm]
api_base = "https://api.example.ai/v1"
model = "solar-mini"

[reranker]
type = "bge"
api_base = "http://localhost:8080"
"#
        .to_string()
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(&minimal_toml()).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.chunking.chunk_size, 850);
        assert_eq!(config.chunking.chunk_overlap, 100);
        assert_eq!(config.retrieval.bm25_k1, 1.5);
        assert_eq!(config.retrieval.bm25_b, 0.75);
        assert_eq!(config.retrieval.top_k_documents, 30);
        assert_eq!(config.crawl.max_workers, 3);
        assert_eq!(config.extractor.max_zip_members, 50);
        assert_eq!(config.boards.floor_for(BoardKind::Notice), Some(27726));
        assert_eq!(config.boards.floor_for(BoardKind::Faculty), None);
        assert_eq!(config.time.utc_offset_hours, 9);
    }

    #[test]
    fn test_missing_board_url_rejected() {
        let toml_str = minimal_toml().replace(
            "staff = \"https://cse.example.ac.kr/bbs/board.php?bo_table=staff&lang=en\"\n",
            "",
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let toml_str = format!("{}\n[chunking]\nchunk_size = 100\nchunk_overlap = 100\n", minimal_toml());
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_bge_requires_api_base() {
        let toml_str = minimal_toml().replace("api_base = \"http://localhost:8080\"\n", "");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }
}
