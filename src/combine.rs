//! Fusion of lexical and dense retrieval results.
//!
//! Hits are joined on title identity: a document found by both retrievers
//! gets the sum of both scores; a BM25-only hit first passes through the
//! date adjuster. The fused list is cut to the configured width and run
//! through the keyword filter once more.

use crate::models::{Candidate, DocEntry};
use crate::scoring::ScoringService;
use std::collections::HashMap;

/// Fuse dense and BM25 candidates.
///
/// `bm25_scores` is the full adjusted score array aligned with `docs` (the
/// metadata snapshot order); `bm25_hits` are the top candidates drawn from
/// it.
pub fn combine(
    dense_hits: &[Candidate],
    bm25_hits: &[Candidate],
    bm25_scores: &[f64],
    docs: &[DocEntry],
    scoring: &ScoringService,
    query_tokens: &[String],
    question: &str,
    top_k: usize,
) -> Vec<Candidate> {
    // First snapshot index per title, for score-array lookups.
    let mut title_index: HashMap<&str, usize> = HashMap::new();
    for (i, doc) in docs.iter().enumerate() {
        title_index.entry(doc.title.as_str()).or_insert(i);
    }

    let mut fused: Vec<Candidate> = Vec::new();

    // Dense hits, summed with the lexical score when the title matches.
    for dense in dense_hits {
        let matched = bm25_hits.iter().find(|hit| hit.title == dense.title);
        match matched {
            Some(hit) => {
                let lexical = title_index
                    .get(hit.title.as_str())
                    .map(|&i| bm25_scores[i])
                    .unwrap_or(0.0);
                let mut candidate = hit.clone();
                candidate.score = dense.score + lexical;
                fused.push(candidate);
            }
            None => fused.push(dense.clone()),
        }
    }

    // BM25-only hits, date-adjusted.
    for hit in bm25_hits {
        let already = dense_hits
            .iter()
            .any(|d| d.title == hit.title && d.text == hit.text);
        if already {
            continue;
        }
        let lexical = title_index
            .get(hit.title.as_str())
            .map(|&i| bm25_scores[i])
            .unwrap_or(hit.score);
        let mut candidate = hit.clone();
        candidate.score = scoring.adjust_date_similarity(lexical, &hit.date, query_tokens);
        fused.push(candidate);
    }

    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused.truncate(top_k);

    let mut filtered = keyword_filter(fused, query_tokens, question);
    filtered.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    filtered
}

/// Final keyword filter hook. Currently a pass-through; the seam exists so
/// deployments can drop candidates that match none of the query terms
/// without touching the fusion logic.
pub fn keyword_filter(
    candidates: Vec<Candidate>,
    _query_tokens: &[String],
    _question: &str,
) -> Vec<Candidate> {
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::ScoringConfig;

    fn scoring() -> ScoringService {
        ScoringService::new(ScoringConfig::default(), Clock::new(9))
    }

    fn candidate(score: f64, title: &str, text: &str) -> Candidate {
        Candidate {
            score,
            title: title.to_string(),
            date: String::new(),
            text: text.to_string(),
            url: format!("https://x/{}", title),
            html: String::new(),
            content_type: "text".to_string(),
            source: "original_post".to_string(),
            attachment_type: String::new(),
        }
    }

    fn docs() -> Vec<DocEntry> {
        vec![
            DocEntry {
                title: "A".to_string(),
                text: "a-text".to_string(),
                ..Default::default()
            },
            DocEntry {
                title: "B".to_string(),
                text: "b-text".to_string(),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_shared_title_scores_are_summed() {
        let dense = vec![candidate(2.0, "A", "a-text")];
        let bm25 = vec![candidate(1.2, "A", "a-text")];
        let scores = vec![1.2, 0.0];

        let fused = combine(&dense, &bm25, &scores, &docs(), &scoring(), &[], "q", 10);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 3.2).abs() < 1e-9);
    }

    #[test]
    fn test_dense_only_hit_kept_as_is() {
        let dense = vec![candidate(2.5, "C", "c-text")];
        let fused = combine(&dense, &[], &[0.0, 0.0], &docs(), &scoring(), &[], "q", 10);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_bm25_only_hit_added_and_sorted() {
        let dense = vec![candidate(0.5, "A", "a-text")];
        let bm25 = vec![candidate(2.0, "B", "b-text")];
        let scores = vec![0.3, 2.0];

        let fused = combine(&dense, &bm25, &scores, &docs(), &scoring(), &[], "q", 10);
        assert_eq!(fused.len(), 2);
        // Undated BM25-only hit keeps its lexical score (no date weight).
        assert_eq!(fused[0].title, "B");
        assert!(fused[0].score >= fused[1].score);
    }

    #[test]
    fn test_top_k_cut() {
        let dense: Vec<Candidate> = (0..8)
            .map(|i| candidate(i as f64, &format!("T{i}"), "text"))
            .collect();
        let fused = combine(&dense, &[], &[], &[], &scoring(), &[], "q", 3);
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].title, "T7");
    }
}
