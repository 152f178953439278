//! Dense vector retriever.
//!
//! Embeds the question with the query-mode model, runs a top-k search
//! against the vector index, and adjusts each hit: a fixed scale factor to
//! bring index scores onto the lexical scale, the recency weight, and a
//! noun-match bonus against the retrieved text.

use anyhow::Result;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingClient;
use crate::models::Candidate;
use crate::scoring::ScoringService;
use crate::snapshot::entry_from_metadata;
use crate::tokenize::has_digit;
use crate::vector::VectorIndexClient;

pub async fn search(
    embeddings: &EmbeddingClient,
    vector: &VectorIndexClient,
    scoring: &ScoringService,
    retrieval: &RetrievalConfig,
    question: &str,
    query_tokens: &[String],
) -> Result<Vec<Candidate>> {
    let query_vector = embeddings.embed_query(question).await?;
    let matches = vector.query(&query_vector, retrieval.dense_top_k).await?;

    let mut candidates: Vec<Candidate> = matches
        .into_iter()
        .map(|m| {
            let entry = entry_from_metadata(&m.metadata);
            let mut score = m.score * retrieval.dense_similarity_scale;
            score = scoring.adjust_date_similarity(score, &entry.date, query_tokens);
            score = adjust_by_noun_matching(
                score,
                &entry.text,
                query_tokens,
                retrieval.noun_weight,
                retrieval.digit_weight,
            );
            Candidate::from_entry(score, &entry)
        })
        .collect();

    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    tracing::debug!(hits = candidates.len(), "dense retrieval complete");
    Ok(candidates)
}

/// Bonus for query nouns literally present in the retrieved text.
fn adjust_by_noun_matching(
    mut score: f64,
    text: &str,
    query_tokens: &[String],
    noun_weight: f64,
    digit_weight: f64,
) -> f64 {
    let haystack = text.to_lowercase();
    for noun in query_tokens {
        if haystack.contains(noun.as_str()) {
            let len = noun.chars().count() as f64;
            score += len * noun_weight;
            if has_digit(noun) {
                score += len * digit_weight;
            }
        }
    }
    score
}
