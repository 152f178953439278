//! Retrieval orchestration: from a question to enriched context chunks.
//!
//! The per-query state machine: noun extraction and temporal intent, the
//! list shortcut for "recent X" questions, BM25 and dense retrieval,
//! fusion, coarse recency boost, URL deduplication, optional reranking,
//! temporal re-boosting, the extreme-low-score guard, distinct-title
//! selection, and chunk enrichment from the metadata snapshot.

use anyhow::Result;
use std::sync::Arc;

use crate::bm25::Bm25Index;
use crate::clock::semester_of;
use crate::cluster;
use crate::combine;
use crate::compose;
use crate::dense;
use crate::gateway::Gateway;
use crate::intent::IntentParser;
use crate::models::{AiResponse, BoardKind, Candidate, DocEntry, TemporalIntent, NO_CONTENT};
use crate::pool;
use crate::rerank::{self, Reranker};
use crate::scoring::ScoringService;
use crate::snapshot::MetadataSnapshot;
use crate::tokenize::Tokenizer;

/// What retrieval produced for one question.
pub enum RetrievalOutcome {
    /// Nothing usable; answer with the structured "not found" response.
    NoResult,
    /// A bare "recent items" request satisfied straight from the snapshot.
    ListShortcut {
        board: BoardKind,
        token: String,
        docs: Vec<DocEntry>,
    },
    Ranked(RankedRetrieval),
}

pub struct RankedRetrieval {
    /// Enriched chunks of the selected posts, in rank order.
    pub chunks: Vec<Candidate>,
    pub top_title: String,
    pub top_url: String,
    pub top_date: String,
    pub query_tokens: Vec<String>,
    pub intent: Option<TemporalIntent>,
    pub reranked: bool,
}

/// The long-lived query engine: snapshot, lexical index, scorer, reranker.
/// Built once at startup; requests share it read-only.
pub struct QueryEngine {
    gateway: Arc<Gateway>,
    snapshot: MetadataSnapshot,
    bm25: Bm25Index,
    tokenizer: Tokenizer,
    scoring: ScoringService,
    intent_parser: IntentParser,
    reranker: Option<Box<dyn Reranker>>,
}

impl QueryEngine {
    pub async fn build(gateway: Arc<Gateway>) -> Result<Self> {
        let snapshot = MetadataSnapshot::load_or_refresh(&gateway.kv, &gateway.vector).await?;
        let tokenizer = Tokenizer::new(&gateway.config.keywords);
        let bm25 = Bm25Index::build(
            snapshot.docs(),
            &tokenizer,
            Some(&gateway.kv),
            gateway.config.retrieval.bm25_k1,
            gateway.config.retrieval.bm25_b,
            pool::default_workers(),
        )
        .await?;
        let scoring = ScoringService::new(gateway.config.scoring.clone(), gateway.clock);
        let intent_parser = IntentParser::new(gateway.clock);

        // Unknown reranker names abort startup; a configured-but-unreachable
        // backend degrades to pre-rerank order, logged exactly once here.
        let reranker = if gateway.config.reranker.enabled {
            let built = rerank::create(&gateway.config.reranker, &gateway.secrets)?;
            if built.is_available().await {
                let info = built.info();
                tracing::info!(name = %info.name, model = %info.model, "reranker active");
                Some(built)
            } else {
                let info = built.info();
                tracing::warn!(
                    name = %info.name,
                    "reranker unavailable; degrading to pre-rerank order"
                );
                None
            }
        } else {
            None
        };

        Ok(Self {
            gateway,
            snapshot,
            bm25,
            tokenizer,
            scoring,
            intent_parser,
            reranker,
        })
    }

    pub fn snapshot(&self) -> &MetadataSnapshot {
        &self.snapshot
    }

    /// Answer one question end to end.
    pub async fn answer(&self, question: &str) -> AiResponse {
        let notice_url = self.notice_board_url();

        let outcome = match self.retrieve(question).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "retrieval failed");
                return AiResponse::not_found(&notice_url);
            }
        };

        match outcome {
            RetrievalOutcome::NoResult => AiResponse::not_found(&notice_url),
            RetrievalOutcome::ListShortcut { board, token, docs } => {
                let board_url = self
                    .gateway
                    .config
                    .boards
                    .url_for(board)
                    .unwrap_or(&notice_url)
                    .to_string();
                compose::list_response(board, &token, &docs, &board_url)
            }
            RetrievalOutcome::Ranked(ranked) => {
                let images = match self.gateway.store.images_for_title(&ranked.top_title).await {
                    Ok(images) if !images.is_empty() => images
                        .into_iter()
                        .filter(|i| !i.is_empty() && i != NO_CONTENT)
                        .collect(),
                    _ => Vec::new(),
                };
                let images = if images.is_empty() {
                    vec![NO_CONTENT.to_string()]
                } else {
                    images
                };

                compose::compose_answer(
                    &self.gateway.llm,
                    &self.gateway.config,
                    &self.scoring,
                    &notice_url,
                    compose::AnswerInput {
                        chunks: ranked.chunks,
                        question: question.to_string(),
                        query_tokens: ranked.query_tokens,
                        intent: ranked.intent,
                        top_title: ranked.top_title,
                        top_url: ranked.top_url,
                        top_date: ranked.top_date,
                        images,
                    },
                )
                .await
            }
        }
    }

    fn notice_board_url(&self) -> String {
        self.gateway
            .config
            .boards
            .url_for(BoardKind::Notice)
            .unwrap_or("")
            .to_string()
    }

    /// The retrieval state machine.
    pub async fn retrieve(&self, question: &str) -> Result<RetrievalOutcome> {
        if self.snapshot.is_empty() {
            return Ok(RetrievalOutcome::NoResult);
        }

        // 1. Preprocess.
        let query_tokens = self.tokenizer.query_terms(question);
        if query_tokens.is_empty() {
            return Ok(RetrievalOutcome::NoResult);
        }
        let intent = self.intent_parser.parse(question, &self.gateway.llm).await;

        // 2. List shortcut.
        if let Some((board, token, count)) = self.detect_list_request(&query_tokens) {
            let prefix = self.gateway.config.boards.url_for(board)?.to_string();
            let docs = self.snapshot.find_recent_by_prefix(&prefix, count);
            if !docs.is_empty() {
                return Ok(RetrievalOutcome::ListShortcut { board, token, docs });
            }
        }

        let retrieval = &self.gateway.config.retrieval;

        // 3. BM25 and dense retrieval.
        let mut bm25_scores = self.bm25.scores(&query_tokens);
        for score in bm25_scores.iter_mut() {
            *score /= retrieval.bm25_normalize_factor;
        }
        self.scoring
            .adjust_similarity_scores(&query_tokens, self.snapshot.docs(), &mut bm25_scores);
        let bm25_hits = top_hits(&bm25_scores, self.snapshot.docs(), retrieval.bm25_top_k);

        let dense_hits = match dense::search(
            &self.gateway.embeddings,
            &self.gateway.vector,
            &self.scoring,
            retrieval,
            question,
            &query_tokens,
        )
        .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "dense retrieval failed; lexical-only");
                Vec::new()
            }
        };

        // 4. Combine.
        let mut combined = combine::combine(
            &dense_hits,
            &bm25_hits,
            &bm25_scores,
            self.snapshot.docs(),
            &self.scoring,
            &query_tokens,
            question,
            retrieval.top_k_documents,
        );

        // 5. Coarse recency boost.
        for candidate in combined.iter_mut() {
            candidate.score *= self.scoring.coarse_recency_boost(&candidate.date);
        }
        combined.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        cluster::apply_tiebreaks(&mut combined, retrieval.cluster_similarity_threshold);

        // 6. URL deduplication.
        let deduped = dedup_by_url(combined, retrieval.dedup_top_k);
        if deduped.is_empty() {
            return Ok(RetrievalOutcome::NoResult);
        }

        // 7. Rerank.
        let (mut ranked, reranked) = match &self.reranker {
            Some(reranker) if deduped.len() > 1 => {
                match reranker
                    .rerank(question, deduped.clone(), retrieval.rerank_top_k)
                    .await
                {
                    Ok(ranked) => (ranked, true),
                    Err(e) => {
                        tracing::warn!(error = %e, "rerank call failed; keeping original order");
                        (deduped, false)
                    }
                }
            }
            _ => (deduped, false),
        };

        // 8. Temporal re-boost (reranked results only; the reranker is
        // date-blind).
        if reranked {
            if let Some(intent) = &intent {
                apply_temporal_reboost(&mut ranked, intent, &self.scoring);
            }
        }

        // 9. Extreme-low-score guard. Top-k order is otherwise trusted; the
        // answerable round-trip makes the final call.
        let Some(top) = ranked.first() else {
            return Ok(RetrievalOutcome::NoResult);
        };
        if reranked && top.score < retrieval.rerank_low_score_floor {
            tracing::warn!(score = top.score, "reranked top below floor; no answer");
            return Ok(RetrievalOutcome::NoResult);
        }
        if !reranked && top.score < retrieval.initial_low_score_floor {
            tracing::warn!(score = top.score, "top score below floor; no answer");
            return Ok(RetrievalOutcome::NoResult);
        }

        // 10. First N distinct titles.
        let unique = first_distinct_titles(&ranked, retrieval.distinct_titles);
        let top = unique[0].clone();

        // 11. Chunk enrichment from the snapshot.
        let chunks = enrich_chunks(&unique, self.snapshot.docs());

        Ok(RetrievalOutcome::Ranked(RankedRetrieval {
            chunks,
            top_title: top.title,
            top_url: top.url,
            top_date: top.date,
            query_tokens,
            intent,
            reranked,
        }))
    }

    /// A "list recent X" request: a category token plus a recency token and
    /// almost nothing else, or an explicit item count.
    fn detect_list_request(&self, tokens: &[String]) -> Option<(BoardKind, String, usize)> {
        let keywords = &self.gateway.config.keywords;
        let recent_tokens = &self.gateway.config.scoring.recent_tokens;

        let category = tokens
            .iter()
            .find(|t| keywords.category_tokens.iter().any(|c| c == *t))?
            .clone();
        let has_recent = tokens.iter().any(|t| recent_tokens.iter().any(|r| r == t));
        let count = tokens
            .iter()
            .find_map(|t| t.parse::<usize>().ok())
            .filter(|n| (1..=50).contains(n));

        let residual: Vec<&String> = tokens
            .iter()
            .filter(|t| !keywords.list_strip_tokens.iter().any(|s| s == *t))
            .filter(|t| !recent_tokens.iter().any(|r| r == *t))
            .filter(|t| t.parse::<usize>().is_err())
            .collect();

        // Two independent triggers: a recency token with little else, or an
        // explicit item count ("5 seminars") on its own.
        if !has_recent && count.is_none() {
            return None;
        }
        if !residual.is_empty() && count.is_none() {
            return None;
        }

        let board = board_for_category(&category);
        Some((board, category, count.unwrap_or(5)))
    }
}

fn board_for_category(token: &str) -> BoardKind {
    match token {
        "notice" | "notices" | "announcement" | "announcements" => BoardKind::Notice,
        "job" | "jobs" | "hiring" | "posting" | "postings" => BoardKind::Job,
        _ => BoardKind::Seminar,
    }
}

/// Top-k snapshot entries by score, descending.
fn top_hits(scores: &[f64], docs: &[DocEntry], top_k: usize) -> Vec<Candidate> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
        .into_iter()
        .take(top_k)
        .map(|i| Candidate::from_entry(scores[i], &docs[i]))
        .collect()
}

/// Keep one candidate per canonical URL (the higher-scored one), cut to
/// `top_k`.
pub fn dedup_by_url(candidates: Vec<Candidate>, top_k: usize) -> Vec<Candidate> {
    let mut best: std::collections::HashMap<String, Candidate> = std::collections::HashMap::new();
    for candidate in candidates {
        match best.get(&candidate.url) {
            Some(existing) if existing.score >= candidate.score => {}
            _ => {
                best.insert(candidate.url.clone(), candidate);
            }
        }
    }
    let mut survivors: Vec<Candidate> = best.into_values().collect();
    survivors.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    survivors.truncate(top_k);
    survivors
}

/// Walk the ranked list and keep the first occurrence of each title.
pub fn first_distinct_titles(ranked: &[Candidate], n: usize) -> Vec<Candidate> {
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::new();
    for candidate in ranked {
        if seen.insert(candidate.title.clone()) {
            unique.push(candidate.clone());
            if unique.len() >= n {
                break;
            }
        }
    }
    unique
}

/// All snapshot chunks of the selected titles (body + OCR + parses), with
/// the parent document's score, globally deduplicated by
/// whitespace-normalized text.
pub fn enrich_chunks(unique: &[Candidate], docs: &[DocEntry]) -> Vec<Candidate> {
    let mut seen_texts = std::collections::HashSet::new();
    let mut chunks = Vec::new();

    for parent in unique {
        for doc in docs {
            if doc.title != parent.title {
                continue;
            }
            let text_key: String = doc.text.split_whitespace().collect();
            if !seen_texts.insert(text_key) {
                continue;
            }
            chunks.push(Candidate::from_entry(parent.score, doc));
        }
    }

    chunks
}

/// Correct the date-blind reranker with the user's explicit or ongoing
/// time constraint.
pub fn apply_temporal_reboost(
    candidates: &mut [Candidate],
    intent: &TemporalIntent,
    scoring: &ScoringService,
) {
    let has_explicit = intent.year.is_some() || intent.semester.is_some();
    if !has_explicit && !intent.is_ongoing {
        return;
    }

    let clock = scoring.clock();
    let now = clock.now();
    let (current_year, current_semester) = semester_of(&now);

    for candidate in candidates.iter_mut() {
        let Some(doc_date) = clock.parse_iso(&candidate.date) else {
            continue;
        };
        let (doc_year, doc_semester) = semester_of(&doc_date);

        let factor = if has_explicit {
            explicit_boost(intent, doc_year, doc_semester)
        } else {
            ongoing_boost(doc_year, doc_semester, current_year, current_semester)
        };
        candidate.score *= factor;
    }

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn explicit_boost(intent: &TemporalIntent, doc_year: i32, doc_semester: u8) -> f64 {
    let year_match = intent.year.map(|y| y == doc_year);
    let semester_match = intent.semester.map(|s| s == doc_semester);

    match (year_match, semester_match) {
        (Some(true), Some(true)) => 2.0,
        (Some(true), None) => 1.8,
        (Some(true), Some(false)) => 1.3,
        (None, Some(true)) => 1.5,
        (Some(false), Some(true)) => 0.9,
        _ => 0.6,
    }
}

fn ongoing_boost(doc_year: i32, doc_semester: u8, current_year: i32, current_semester: u8) -> f64 {
    if doc_year == current_year && doc_semester == current_semester {
        1.8
    } else if doc_year == current_year {
        1.3
    } else if doc_year == current_year - 1 {
        0.85
    } else {
        0.6
    }
}
