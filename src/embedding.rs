//! Embedding service client.
//!
//! Calls an OpenAI-compatible embeddings endpoint with batching, retry, and
//! exponential backoff. Two model names are configured: a passage model for
//! ingestion and a query model for search, so the two sides of the
//! asymmetric embedding space stay consistent.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use std::time::Duration;

use crate::config::EmbeddingConfig;

#[derive(Clone)]
pub struct EmbeddingClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model_passage: String,
    model_query: String,
    batch_size: usize,
    max_retries: u32,
    dimension: usize,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model_passage: config.model_passage.clone(),
            model_query: config.model_query.clone(),
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            dimension: config.dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed document texts with the passage model, in batches.
    pub async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let mut batch_vectors = self.call(&self.model_passage, batch).await?;
            vectors.append(&mut batch_vectors);
        }
        Ok(vectors)
    }

    /// Embed a single query with the query model.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.call(&self.model_query, &[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }

    async fn call(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embeddings", self.api_base))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embedding_response(&json, texts.len());
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("embedding API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Embedding failed after retries")))
    }
}

fn parse_embedding_response(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid embedding response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid embedding response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }

    if embeddings.len() != expected {
        bail!(
            "embedding count mismatch: asked {}, got {}",
            expected,
            embeddings.len()
        );
    }
    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(server: &MockServer, batch_size: usize) -> EmbeddingClient {
        let config = EmbeddingConfig {
            api_base: server.base_url(),
            model_passage: "embed-passage".into(),
            model_query: "embed-query".into(),
            batch_size,
            timeout_secs: 5,
            max_retries: 1,
            dimension: 4,
        };
        EmbeddingClient::new(&config, "key").unwrap()
    }

    #[tokio::test]
    async fn test_embed_documents_batched() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/embeddings")
                    .json_body_partial(r#"{"model": "embed-passage"}"#);
                then.status(200).json_body(serde_json::json!({
                    "data": [
                        {"embedding": [0.1, 0.2]},
                        {"embedding": [0.3, 0.4]}
                    ]
                }));
            })
            .await;

        let texts: Vec<String> = (0..4).map(|i| format!("text {i}")).collect();
        let vectors = client(&server, 2).embed_documents(&texts).await.unwrap();
        assert_eq!(vectors.len(), 4);
        assert_eq!(vectors[0], vec![0.1, 0.2]);
        mock.assert_hits(2);
    }

    #[tokio::test]
    async fn test_embed_query_uses_query_model() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/embeddings")
                    .json_body_partial(r#"{"model": "embed-query"}"#);
                then.status(200).json_body(serde_json::json!({
                    "data": [{"embedding": [1.0, 0.0]}]
                }));
            })
            .await;

        let vector = client(&server, 8).embed_query("question").await.unwrap();
        assert_eq!(vector, vec![1.0, 0.0]);
        mock.assert();
    }

    #[tokio::test]
    async fn test_count_mismatch_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(200).json_body(serde_json::json!({"data": []}));
            })
            .await;
        assert!(client(&server, 8).embed_query("q").await.is_err());
    }

    #[tokio::test]
    async fn test_client_error_fails_immediately() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(400).body("bad model");
            })
            .await;
        assert!(client(&server, 8).embed_query("q").await.is_err());
        mock.assert_hits(1);
    }
}
