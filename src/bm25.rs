//! Lexical BM25 index with a warm cache.
//!
//! The searchable surface of each document is `title ⊕ body ⊕ flattened
//! markup`. Tokenization runs on the worker pool; the tokenized corpus (and
//! the flattened markup texts) persist in the KV cache under a versioned key
//! so restarts skip the expensive rebuild. A `doc_count` embedded in the
//! blob is the coordination primitive: a mismatch with the current corpus
//! invalidates the cached form.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::kv::KvCache;
use crate::models::DocEntry;
use crate::pool;
use crate::tokenize::{combined_surface, flatten_markup, Tokenizer};

pub const BM25_CACHE_KEY: &str = "bm25_cache_v2";
const CACHE_TTL_SECS: i64 = 86_400;

/// Wire form of the cached corpus. The parallel layout is the blob format
/// only; nothing downstream consumes it directly.
#[derive(Serialize, Deserialize)]
struct CacheBlob {
    tokenized_documents: Vec<Vec<String>>,
    html_texts: Vec<String>,
    doc_count: usize,
}

pub struct Bm25Index {
    k1: f64,
    b: f64,
    tokenized: Vec<Vec<String>>,
    term_counts: Vec<HashMap<String, u32>>,
    doc_lens: Vec<usize>,
    avgdl: f64,
    df: HashMap<String, usize>,
}

impl Bm25Index {
    /// Build the index for a corpus, consulting and refreshing the cache.
    pub async fn build(
        docs: &[DocEntry],
        tokenizer: &Tokenizer,
        kv: Option<&KvCache>,
        k1: f64,
        b: f64,
        workers: usize,
    ) -> Result<Self> {
        if let Some(kv) = kv {
            if let Some(raw) = kv.get(BM25_CACHE_KEY).await? {
                match serde_json::from_slice::<CacheBlob>(&raw) {
                    Ok(blob) if blob.doc_count == docs.len() => {
                        tracing::info!(docs = blob.doc_count, "BM25 corpus loaded from cache");
                        return Ok(Self::from_tokens(blob.tokenized_documents, k1, b));
                    }
                    Ok(blob) => {
                        tracing::warn!(
                            cached = blob.doc_count,
                            current = docs.len(),
                            "BM25 cache doc_count mismatch; rebuilding"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "BM25 cache blob unreadable; rebuilding");
                    }
                }
            }
        }

        let (index, html_texts) = Self::build_fresh(docs, tokenizer, k1, b, workers);

        if let Some(kv) = kv {
            let blob = CacheBlob {
                tokenized_documents: index.tokenized.clone(),
                html_texts,
                doc_count: docs.len(),
            };
            let raw = serde_json::to_vec(&blob)?;
            if let Err(e) = kv.setex(BM25_CACHE_KEY, CACHE_TTL_SECS, &raw).await {
                tracing::warn!(error = %e, "failed to store BM25 cache");
            } else {
                tracing::info!(
                    docs = docs.len(),
                    bytes = raw.len(),
                    "BM25 corpus cached"
                );
            }
        }

        Ok(index)
    }

    fn build_fresh(
        docs: &[DocEntry],
        tokenizer: &Tokenizer,
        k1: f64,
        b: f64,
        workers: usize,
    ) -> (Self, Vec<String>) {
        let html_texts: Vec<String> =
            pool::parallel_map(docs, workers, |doc| flatten_markup(&doc.html));

        let surfaces: Vec<String> = docs
            .iter()
            .zip(html_texts.iter())
            .map(|(doc, html_text)| combined_surface(&doc.title, &doc.text, html_text))
            .collect();

        let tokenized: Vec<Vec<String>> =
            pool::parallel_map(&surfaces, workers, |surface| tokenizer.doc_tokens(surface));

        (Self::from_tokens(tokenized, k1, b), html_texts)
    }

    /// Construct from an already-tokenized corpus.
    pub fn from_tokens(tokenized: Vec<Vec<String>>, k1: f64, b: f64) -> Self {
        let doc_lens: Vec<usize> = tokenized.iter().map(|t| t.len()).collect();
        let total: usize = doc_lens.iter().sum();
        let avgdl = if tokenized.is_empty() {
            0.0
        } else {
            total as f64 / tokenized.len() as f64
        };

        let mut term_counts = Vec::with_capacity(tokenized.len());
        let mut df: HashMap<String, usize> = HashMap::new();
        for tokens in &tokenized {
            let mut counts: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *counts.entry(token.clone()).or_insert(0) += 1;
            }
            for term in counts.keys() {
                *df.entry(term.clone()).or_insert(0) += 1;
            }
            term_counts.push(counts);
        }

        Self {
            k1,
            b,
            tokenized,
            term_counts,
            doc_lens,
            avgdl,
            df,
        }
    }

    pub fn doc_count(&self) -> usize {
        self.tokenized.len()
    }

    pub fn tokens_for(&self, i: usize) -> &[String] {
        &self.tokenized[i]
    }

    /// Okapi BM25 score of every document against the query terms.
    pub fn scores(&self, query_terms: &[String]) -> Vec<f64> {
        let n = self.doc_count();
        let mut scores = vec![0.0; n];
        if n == 0 || self.avgdl == 0.0 {
            return scores;
        }

        for term in query_terms {
            let Some(&df) = self.df.get(term) else { continue };
            let idf = (((n as f64 - df as f64 + 0.5) / (df as f64 + 0.5)) + 1.0).ln();

            for (i, counts) in self.term_counts.iter().enumerate() {
                let Some(&tf) = counts.get(term) else { continue };
                let tf = tf as f64;
                let dl = self.doc_lens[i] as f64;
                let denom = tf + self.k1 * (1.0 - self.b + self.b * dl / self.avgdl);
                scores[i] += idf * tf * (self.k1 + 1.0) / denom;
            }
        }

        scores
    }
}
