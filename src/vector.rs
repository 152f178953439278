//! HTTP gateway for the hosted vector index.
//!
//! Speaks the index's data plane: upsert over `(id, vector, metadata)`
//! triples, top-k query, stats, batch fetch by id, list-all-ids pagination,
//! and delete. Ids are integers assigned by the embedding uploader but
//! travel as strings on the wire.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::VectorConfig;

/// One point to upsert.
#[derive(Debug, Clone)]
pub struct PointInsert {
    pub id: u64,
    pub vector: Vec<f32>,
    pub metadata: Value,
}

/// One query hit.
#[derive(Debug, Clone)]
pub struct Match {
    pub id: String,
    pub score: f64,
    pub metadata: Value,
}

#[derive(Clone)]
pub struct VectorIndexClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    upsert_batch: usize,
    fetch_batch: usize,
}

impl VectorIndexClient {
    pub fn new(config: &VectorConfig, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            upsert_batch: config.upsert_batch.max(1),
            fetch_batch: config.fetch_batch.max(1),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(self.endpoint(path))
            .header("Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        Self::into_json(path, response).await
    }

    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<Value> {
        let response = self
            .client
            .get(self.endpoint(path))
            .header("Api-Key", &self.api_key)
            .query(query)
            .send()
            .await?;
        Self::into_json(path, response).await
    }

    async fn into_json(path: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(path, %status, "vector index request failed");
            return Err(anyhow!("vector index {}: HTTP {}: {}", path, status, body));
        }
        Ok(response.json().await?)
    }

    /// Upsert points in bounded batches.
    pub async fn upsert(&self, points: &[PointInsert]) -> Result<usize> {
        let mut written = 0;
        for batch in points.chunks(self.upsert_batch) {
            let vectors: Vec<Value> = batch
                .iter()
                .map(|p| {
                    json!({
                        "id": p.id.to_string(),
                        "values": p.vector,
                        "metadata": p.metadata,
                    })
                })
                .collect();
            self.post("vectors/upsert", json!({ "vectors": vectors })).await?;
            written += batch.len();
            tracing::debug!(batch = batch.len(), total = written, "vectors upserted");
        }
        Ok(written)
    }

    /// Top-k similarity query with metadata included.
    pub async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<Match>> {
        let body = json!({
            "vector": vector,
            "topK": top_k,
            "includeValues": false,
            "includeMetadata": true,
        });
        let response = self.post("query", body).await?;

        let matches = response
            .get("matches")
            .and_then(|m| m.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(matches
            .into_iter()
            .map(|m| Match {
                id: m
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                score: m.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0),
                metadata: m.get("metadata").cloned().unwrap_or(Value::Null),
            })
            .collect())
    }

    /// Total number of vectors currently in the index.
    pub async fn total_vector_count(&self) -> Result<u64> {
        let response = self.post("describe_index_stats", json!({})).await?;
        let count = response
            .get("totalVectorCount")
            .or_else(|| response.get("total_vector_count"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Ok(count)
    }

    /// Fetch metadata for a set of ids; returns id → metadata.
    pub async fn fetch_metadata(&self, ids: &[u64]) -> Result<HashMap<u64, Value>> {
        let mut out = HashMap::new();
        for batch in ids.chunks(self.fetch_batch) {
            let query: Vec<(String, String)> = batch
                .iter()
                .map(|id| ("ids".to_string(), id.to_string()))
                .collect();
            let response = self.get("vectors/fetch", &query).await?;
            if let Some(vectors) = response.get("vectors").and_then(|v| v.as_object()) {
                for (id, entry) in vectors {
                    if let Ok(parsed) = id.parse::<u64>() {
                        out.insert(
                            parsed,
                            entry.get("metadata").cloned().unwrap_or(Value::Null),
                        );
                    }
                }
            }
        }
        Ok(out)
    }

    /// List every vector id via the paginated listing endpoint.
    pub async fn list_ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut query = vec![("limit".to_string(), "99".to_string())];
            if let Some(t) = &token {
                query.push(("paginationToken".to_string(), t.clone()));
            }
            let response = self.get("vectors/list", &query).await?;

            if let Some(vectors) = response.get("vectors").and_then(|v| v.as_array()) {
                for entry in vectors {
                    if let Some(id) = entry.get("id").and_then(|v| v.as_str()) {
                        if let Ok(parsed) = id.parse::<u64>() {
                            ids.push(parsed);
                        }
                    }
                }
            }

            token = response
                .get("pagination")
                .and_then(|p| p.get("next"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            if token.is_none() {
                break;
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn delete_ids(&self, ids: &[u64]) -> Result<()> {
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        self.post("vectors/delete", json!({ "ids": ids })).await?;
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<()> {
        self.post("vectors/delete", json!({ "deleteAll": true })).await?;
        Ok(())
    }
}
