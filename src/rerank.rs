//! Pluggable cross-encoder reranking.
//!
//! Second-stage scoring of (query, candidate) pairs with a heavier model
//! than the first-stage retrievers. Implementations satisfy a small
//! capability interface and are produced by a name-keyed factory; an
//! unknown name is a startup error, not a runtime fallback. A configured
//! backend that turns out to be unreachable degrades to the pre-rerank
//! order (the orchestrator logs that once).

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::{RerankerConfig, Secrets};
use crate::models::Candidate;

/// How much candidate body accompanies the title into the cross-encoder.
const BODY_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct RerankerInfo {
    pub name: String,
    pub model: String,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Reorder candidates by cross-encoder relevance, keeping `top_k`.
    async fn rerank(&self, query: &str, docs: Vec<Candidate>, top_k: usize)
        -> Result<Vec<Candidate>>;

    /// Relevance score of a single document.
    async fn compute_score(&self, query: &str, document: &str) -> Result<f64>;

    /// Cheap availability probe, run once at startup.
    async fn is_available(&self) -> bool;

    fn info(&self) -> RerankerInfo;
}

/// Build the configured reranker. Unknown names abort startup.
pub fn create(config: &RerankerConfig, secrets: &Secrets) -> Result<Box<dyn Reranker>> {
    match config.kind.as_str() {
        "bge" => {
            let api_base = config
                .api_base
                .clone()
                .ok_or_else(|| anyhow!("reranker.api_base required for bge"))?;
            Ok(Box::new(HttpCrossEncoder::new(
                &api_base,
                &config.model,
                config.timeout_secs,
            )?))
        }
        "cohere" => {
            let api_key = secrets
                .cohere_api_key
                .clone()
                .ok_or_else(|| anyhow!("COHERE_API_KEY not set but reranker.type = cohere"))?;
            Ok(Box::new(CohereReranker::new(
                &config.model,
                &api_key,
                config.timeout_secs,
            )?))
        }
        other => bail!(
            "unknown reranker type '{}'; available: bge, cohere",
            other
        ),
    }
}

/// Scoring input: title plus the head of the body.
fn scoring_text(candidate: &Candidate) -> String {
    let body: String = candidate.text.chars().take(BODY_CHARS).collect();
    format!("{}\n\n{}", candidate.title, body)
}

fn apply_scores(mut docs: Vec<Candidate>, scores: &[f64], top_k: usize) -> Vec<Candidate> {
    for (candidate, &score) in docs.iter_mut().zip(scores.iter()) {
        candidate.score = score;
    }
    docs.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    docs.truncate(top_k);
    docs
}

// ============ HTTP cross-encoder ("bge") ============

/// Cross-encoder served over HTTP (a text-embeddings-inference style
/// `/rerank` endpoint hosting the configured model).
pub struct HttpCrossEncoder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpCrossEncoder {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    async fn score_batch(&self, query: &str, texts: &[String]) -> Result<Vec<f64>> {
        let body = serde_json::json!({
            "query": query,
            "texts": texts,
        });
        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("cross-encoder error {}: {}", status, detail);
        }

        let ranked: Vec<serde_json::Value> = response.json().await?;
        let mut scores = vec![0.0; texts.len()];
        for entry in ranked {
            let index = entry.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let score = entry.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
            if index < scores.len() {
                scores[index] = score;
            }
        }
        Ok(scores)
    }
}

#[async_trait]
impl Reranker for HttpCrossEncoder {
    async fn rerank(
        &self,
        query: &str,
        docs: Vec<Candidate>,
        top_k: usize,
    ) -> Result<Vec<Candidate>> {
        if docs.is_empty() {
            return Ok(docs);
        }
        let texts: Vec<String> = docs.iter().map(scoring_text).collect();
        let scores = self.score_batch(query, &texts).await?;
        Ok(apply_scores(docs, &scores, top_k))
    }

    async fn compute_score(&self, query: &str, document: &str) -> Result<f64> {
        let scores = self.score_batch(query, &[document.to_string()]).await?;
        scores
            .first()
            .copied()
            .ok_or_else(|| anyhow!("empty rerank response"))
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn info(&self) -> RerankerInfo {
        RerankerInfo {
            name: "bge".to_string(),
            model: self.model.clone(),
        }
    }
}

// ============ Cohere ============

pub struct CohereReranker {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl CohereReranker {
    pub fn new(model: &str, api_key: &str, timeout_secs: u64) -> Result<Self> {
        Self::with_base_url(model, api_key, timeout_secs, "https://api.cohere.com/v1")
    }

    pub fn with_base_url(
        model: &str,
        api_key: &str,
        timeout_secs: u64,
        base_url: &str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn score_batch(&self, query: &str, texts: &[String]) -> Result<Vec<f64>> {
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": texts,
            "top_n": texts.len(),
        });
        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("cohere rerank error {}: {}", status, detail);
        }

        let json: serde_json::Value = response.json().await?;
        let results = json
            .get("results")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();

        let mut scores = vec![0.0; texts.len()];
        for entry in results {
            let index = entry.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let score = entry
                .get("relevance_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            if index < scores.len() {
                scores[index] = score;
            }
        }
        Ok(scores)
    }
}

#[async_trait]
impl Reranker for CohereReranker {
    async fn rerank(
        &self,
        query: &str,
        docs: Vec<Candidate>,
        top_k: usize,
    ) -> Result<Vec<Candidate>> {
        if docs.is_empty() {
            return Ok(docs);
        }
        let texts: Vec<String> = docs.iter().map(scoring_text).collect();
        let scores = self.score_batch(query, &texts).await?;
        Ok(apply_scores(docs, &scores, top_k))
    }

    async fn compute_score(&self, query: &str, document: &str) -> Result<f64> {
        let scores = self.score_batch(query, &[document.to_string()]).await?;
        scores
            .first()
            .copied()
            .ok_or_else(|| anyhow!("empty rerank response"))
    }

    async fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn info(&self) -> RerankerInfo {
        RerankerInfo {
            name: "cohere".to_string(),
            model: self.model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn candidate(title: &str, text: &str) -> Candidate {
        Candidate {
            score: 0.0,
            title: title.to_string(),
            date: String::new(),
            text: text.to_string(),
            url: String::new(),
            html: String::new(),
            content_type: "text".to_string(),
            source: "original_post".to_string(),
            attachment_type: String::new(),
        }
    }

    fn secrets(cohere: Option<&str>) -> Secrets {
        Secrets {
            ai_api_key: "ai".to_string(),
            vector_api_key: "vec".to_string(),
            cohere_api_key: cohere.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_unknown_backend_is_startup_error() {
        let config = RerankerConfig {
            kind: "flashrank".to_string(),
            ..Default::default()
        };
        assert!(create(&config, &secrets(None)).is_err());
    }

    #[test]
    fn test_cohere_requires_key() {
        let config = RerankerConfig {
            kind: "cohere".to_string(),
            ..Default::default()
        };
        assert!(create(&config, &secrets(None)).is_err());
        assert!(create(&config, &secrets(Some("key"))).is_ok());
    }

    #[test]
    fn test_scoring_text_truncates_body() {
        let long_body = "x".repeat(2000);
        let text = scoring_text(&candidate("Title", &long_body));
        assert!(text.starts_with("Title\n\n"));
        assert_eq!(text.chars().count(), "Title\n\n".chars().count() + 500);
    }

    #[tokio::test]
    async fn test_http_cross_encoder_reranks() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/rerank");
                then.status(200).json_body(serde_json::json!([
                    {"index": 0, "score": 0.1},
                    {"index": 1, "score": 0.9}
                ]));
            })
            .await;

        let reranker = HttpCrossEncoder::new(&server.base_url(), "bge-m3", 5).unwrap();
        let docs = vec![candidate("First", "a"), candidate("Second", "b")];
        let ranked = reranker.rerank("query", docs, 2).await.unwrap();
        assert_eq!(ranked[0].title, "Second");
        assert!((ranked[0].score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_http_cross_encoder_availability_probe() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200);
            })
            .await;
        let reranker = HttpCrossEncoder::new(&server.base_url(), "bge-m3", 5).unwrap();
        assert!(reranker.is_available().await);

        let dead = HttpCrossEncoder::new("http://127.0.0.1:1", "bge-m3", 1).unwrap();
        assert!(!dead.is_available().await);
    }

    #[tokio::test]
    async fn test_cohere_parses_relevance_scores() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/rerank");
                then.status(200).json_body(serde_json::json!({
                    "results": [
                        {"index": 0, "relevance_score": 0.2},
                        {"index": 1, "relevance_score": 0.7}
                    ]
                }));
            })
            .await;

        let reranker =
            CohereReranker::with_base_url("rerank-multilingual-v3.0", "key", 5, &server.base_url())
                .unwrap();
        let docs = vec![candidate("A", "a"), candidate("B", "b")];
        let ranked = reranker.rerank("q", docs, 1).await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].title, "B");
    }
}
