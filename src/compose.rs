//! Response composition: tiered context assembly, the LLM round-trip, and
//! the answerable safety nets.
//!
//! The assembled context lives under a hard character budget. Original post
//! bodies always go in first; image OCR of high-scoring posts second;
//! whatever else fits, third. The model is asked for strict JSON
//! `{answerable, answer}`; phrase matching survives only as an instrumented
//! fallback for non-conforming output.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::config::Config;
use crate::extract::flatten_html;
use crate::intent::describe_intent;
use crate::llm::ChatClient;
use crate::models::{
    AiResponse, BoardKind, Candidate, DocEntry, TemporalIntent, DISCLAIMER, NO_CONTENT,
};
use crate::scoring::ScoringService;
use crate::tokenize::looks_like_markdown;

/// Everything the composer needs for one answer.
pub struct AnswerInput {
    pub chunks: Vec<Candidate>,
    pub question: String,
    pub query_tokens: Vec<String>,
    pub intent: Option<TemporalIntent>,
    pub top_title: String,
    pub top_url: String,
    pub top_date: String,
    pub images: Vec<String>,
}

/// The list-shortcut response: titles and dates straight from the snapshot.
pub fn list_response(board: BoardKind, token: &str, docs: &[DocEntry], board_url: &str) -> AiResponse {
    let mut answer = format!("Here are recent {}s for '{}':\n\n", board.as_str(), token);
    for doc in docs {
        answer.push_str(&format!(
            "Title: {}, Date: {}\n----------------------------------------------------\n",
            doc.title, doc.date
        ));
    }

    AiResponse {
        answer: Some(answer),
        answerable: true,
        references: format!("{}&wr_id=", board_url),
        disclaimer: DISCLAIMER.to_string(),
        images: vec![NO_CONTENT.to_string()],
    }
}

/// Build the context, call the model, validate the verdict.
pub async fn compose_answer(
    llm: &ChatClient,
    config: &Config,
    scoring: &ScoringService,
    notice_url: &str,
    input: AnswerInput,
) -> AiResponse {
    let selected = select_context_chunks(&input, config);
    if selected.is_empty() {
        return AiResponse::not_found(notice_url);
    }

    let context = format_docs(&selected);
    let prompt = build_prompt(
        scoring,
        input.intent.as_ref(),
        &context,
        &input.question,
    );

    let raw = match llm.invoke(&prompt).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(error = %e, "answer generation failed");
            if input.images.first().map(|i| i.as_str()) != Some(NO_CONTENT) {
                return AiResponse {
                    answer: Some(
                        "Please refer to the attached image files for this question.".to_string(),
                    ),
                    answerable: true,
                    references: input.top_url,
                    disclaimer: DISCLAIMER.to_string(),
                    images: input.images,
                };
            }
            return AiResponse::not_found(notice_url);
        }
    };

    let (mut answer, mut answerable) = parse_answer(&raw, &config.keywords.negative_patterns);

    // Safety net: a "does not contain" answer can never be answerable.
    if answerable && contains_negative(&answer, &config.keywords.negative_patterns) {
        tracing::warn!("negative pattern in answerable answer; flipping to false");
        answerable = false;
    }

    // Ongoing questions answered from stale documents get an explicit
    // caveat and stop claiming answerability.
    if answerable {
        if let Some(intent) = &input.intent {
            if intent.is_ongoing {
                if let Some((doc_year, current_year)) =
                    stale_years(scoring, &input.top_date)
                {
                    let diff = current_year - doc_year;
                    tracing::warn!(doc_year, current_year, "ongoing intent but stale document");
                    answer = format!(
                        "Note: the referenced document is from {} ({} year(s) old). {}",
                        doc_year, diff, answer
                    );
                    answer.push_str(&format!(
                        " For current {} information please check the latest notices.",
                        current_year
                    ));
                    answerable = false;
                }
            }
        }
    }

    // Completeness check for roster-style questions.
    if wants_completeness(&input.question, &config.keywords.completeness_tokens) {
        if let Some(warning) = completeness_warning(&context, &answer) {
            answer.push_str(&warning);
        }
    }

    AiResponse {
        answer: Some(answer),
        answerable,
        references: input.top_url,
        disclaimer: DISCLAIMER.to_string(),
        images: input.images,
    }
}

/// Dedup markup, pick each chunk's content form, filter, and run the
/// tiered budget fill. Returns (content, chunk) pairs in fill order.
fn select_context_chunks(input: &AnswerInput, config: &Config) -> Vec<(String, Candidate)> {
    // 1. Markup dedup: the same extracted table often rides on several
    // chunks; keep the first.
    let mut seen_markup = HashSet::new();
    let mut deduped: Vec<&Candidate> = Vec::new();
    for chunk in &input.chunks {
        if !chunk.html.is_empty() && !seen_markup.insert(chunk.html.clone()) {
            continue;
        }
        deduped.push(chunk);
    }

    // 2. Content preference: markdown → HTML-to-text → plain text.
    let mut prepared: Vec<(String, Candidate)> = deduped
        .into_iter()
        .map(|chunk| (chunk_content(chunk), chunk.clone()))
        .collect();

    // 3. Same-post fast path: one title means the pipeline already chose
    // this post; keyword filtering would only lose chunks.
    let unique_titles: HashSet<&str> = prepared.iter().map(|(_, c)| c.title.as_str()).collect();
    if unique_titles.len() > 1 {
        prepared.retain(|(content, chunk)| {
            let lowered = content.to_lowercase();
            input
                .query_tokens
                .iter()
                .any(|t| lowered.contains(t.as_str()))
                || chunk.source == "image_ocr"
                || chunk.source == "document_parse"
        });
    }

    if prepared.is_empty() {
        return prepared;
    }

    // 4. Per-title max score; the high-score group is everything within
    // the configured ratio of the leader.
    let mut title_scores: HashMap<&str, f64> = HashMap::new();
    for (_, chunk) in &prepared {
        let entry = title_scores.entry(chunk.title.as_str()).or_insert(chunk.score);
        if chunk.score > *entry {
            *entry = chunk.score;
        }
    }
    let top_score = title_scores
        .values()
        .fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let high_score_titles: HashSet<String> = title_scores
        .iter()
        .filter(|(_, &score)| top_score > 0.0 && score / top_score >= config.retrieval.high_score_ratio)
        .map(|(title, _)| title.to_string())
        .collect();

    // 5. Tiered fill under the character budget.
    let budget = config.retrieval.max_context_chars;
    let mut used = 0usize;
    let mut selected: Vec<(String, Candidate)> = Vec::new();
    let mut taken: HashSet<usize> = HashSet::new();

    let mut try_take =
        |i: usize, prepared: &[(String, Candidate)], selected: &mut Vec<(String, Candidate)>, used: &mut usize, taken: &mut HashSet<usize>| -> bool {
            let len = prepared[i].0.chars().count();
            if *used + len <= budget {
                selected.push(prepared[i].clone());
                *used += len;
                taken.insert(i);
                true
            } else {
                false
            }
        };

    // Phase 1: every distinct post's body chunks.
    for i in 0..prepared.len() {
        let source = prepared[i].1.source.as_str();
        if source == "original_post" || source == "professor_info" {
            if !try_take(i, &prepared, &mut selected, &mut used, &mut taken) {
                tracing::warn!(title = %prepared[i].1.title, "body chunk does not fit the context budget");
            }
        }
    }

    // Phase 2: image OCR of high-score posts, best first.
    let mut phase2: Vec<usize> = (0..prepared.len())
        .filter(|&i| !taken.contains(&i))
        .filter(|&i| prepared[i].1.source == "image_ocr")
        .filter(|&i| high_score_titles.contains(&prepared[i].1.title))
        .collect();
    phase2.sort_by(|&a, &b| {
        prepared[b]
            .1
            .score
            .partial_cmp(&prepared[a].1.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for i in phase2 {
        try_take(i, &prepared, &mut selected, &mut used, &mut taken);
    }

    // Phase 3: everything else in score order until the budget is full.
    let mut phase3: Vec<usize> = (0..prepared.len()).filter(|i| !taken.contains(i)).collect();
    phase3.sort_by(|&a, &b| {
        prepared[b]
            .1
            .score
            .partial_cmp(&prepared[a].1.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for i in phase3 {
        if !try_take(i, &prepared, &mut selected, &mut used, &mut taken) {
            break;
        }
    }

    tracing::info!(
        chunks = selected.len(),
        chars = used,
        budget,
        "context assembled"
    );
    selected
}

/// A chunk's content for the prompt: markdown as-is, HTML flattened, plain
/// text otherwise.
fn chunk_content(chunk: &Candidate) -> String {
    if !chunk.html.is_empty() {
        if looks_like_markdown(&chunk.html) {
            return chunk.html.clone();
        }
        let flattened = flatten_html(&chunk.html);
        if !flattened.is_empty() {
            return flattened;
        }
    }
    chunk.text.clone()
}

fn format_docs(selected: &[(String, Candidate)]) -> String {
    let mut out = String::new();
    for (content, chunk) in selected {
        out.push_str(&format!(
            "\n\nDocument title: {}\nDate: {}\nContent: {}",
            chunk.title, chunk.date, content
        ));
    }
    out
}

fn build_prompt(
    scoring: &ScoringService,
    intent: Option<&TemporalIntent>,
    context: &str,
    question: &str,
) -> String {
    format!(
        r#"You are the assistant for a university department's notice boards. Answer strictly from the provided documents.

Current time: {now}
Time context: {intent}

Documents:
{context}

Question: {question}

Respond with exactly one JSON object and nothing else:
{{"answerable": <true when the documents contain the answer>, "answer": "<the answer; enumerate every item when the question asks for a list>"}}

If the documents do not contain the answer, set "answerable" to false and say briefly what is missing."#,
        now = scoring.clock().now().format("%Y-%m-%d %H:%M"),
        intent = describe_intent(intent),
        context = context,
        question = question,
    )
}

/// Parse the model verdict: strict JSON first, phrase-matching fallback for
/// backward compatibility (instrumented when used).
fn parse_answer(raw: &str, negative_patterns: &[String]) -> (String, bool) {
    let cleaned = strip_fences(raw);
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(cleaned) {
        let answer = value.get("answer").and_then(|v| v.as_str());
        let answerable = value.get("answerable").and_then(|v| v.as_bool());
        if let (Some(answer), Some(answerable)) = (answer, answerable) {
            return (answer.to_string(), answerable);
        }
    }

    tracing::warn!("non-JSON answer from model; phrase-matching fallback engaged");
    let head: String = raw.chars().take(150).collect();
    let answerable = !contains_negative(&head, negative_patterns);
    (raw.trim().to_string(), answerable)
}

fn strip_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

fn contains_negative(answer: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| answer.contains(p.as_str()))
}

/// (document year, current year) when the ongoing top document is at least
/// a year old.
fn stale_years(scoring: &ScoringService, top_date: &str) -> Option<(i32, i32)> {
    use chrono::Datelike;
    let doc = scoring.clock().parse_iso(top_date)?;
    let current_year = scoring.clock().now().year();
    if doc.year() < current_year {
        Some((doc.year(), current_year))
    } else {
        None
    }
}

fn wants_completeness(question: &str, tokens: &[String]) -> bool {
    let lowered = question.to_lowercase();
    tokens.iter().any(|t| lowered.contains(t.as_str()))
}

/// Identifier pattern for roster completeness (student-id style numbers).
fn identifier_count(text: &str) -> usize {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\b20\d{6,8}\b").expect("static regex"));
    re.find_iter(text).count()
}

fn completeness_warning(context: &str, answer: &str) -> Option<String> {
    let in_context = identifier_count(context);
    let in_answer = identifier_count(answer);
    if in_context >= 10 && in_answer * 2 < in_context {
        Some(format!(
            "\n\nNote: the answer may be truncated (documents list about {} entries, the answer contains {}). Check the referenced URL for the full list.",
            in_context, in_answer
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::ScoringConfig;

    fn chunk(score: f64, title: &str, text: &str, source: &str, html: &str) -> Candidate {
        Candidate {
            score,
            title: title.to_string(),
            date: "2024-01-01T00:00:00+09:00".to_string(),
            text: text.to_string(),
            url: "https://x/post".to_string(),
            html: html.to_string(),
            content_type: "text".to_string(),
            source: source.to_string(),
            attachment_type: String::new(),
        }
    }

    fn config() -> Config {
        Config::for_tests("https://o", "https://o/b", "https://o/api")
    }

    fn scoring() -> ScoringService {
        ScoringService::new(ScoringConfig::default(), Clock::new(9))
    }

    fn input(chunks: Vec<Candidate>, question: &str, tokens: &[&str]) -> AnswerInput {
        AnswerInput {
            chunks,
            question: question.to_string(),
            query_tokens: tokens.iter().map(|t| t.to_string()).collect(),
            intent: None,
            top_title: "T".to_string(),
            top_url: "https://x/post".to_string(),
            top_date: "2024-01-01T00:00:00+09:00".to_string(),
            images: vec![NO_CONTENT.to_string()],
        }
    }

    #[test]
    fn test_markup_dedup_drops_repeated_tables() {
        let table = "| schedule |\n|---|";
        let chunks = vec![
            chunk(1.0, "T", "a", "image_ocr", table),
            chunk(0.9, "T", "b", "image_ocr", table),
            chunk(0.8, "T", "c", "original_post", ""),
        ];
        let selected = select_context_chunks(&input(chunks, "q", &[]), &config());
        let with_markup = selected
            .iter()
            .filter(|(_, c)| !c.html.is_empty())
            .count();
        assert_eq!(with_markup, 1);
    }

    #[test]
    fn test_same_post_fast_path_keeps_all_chunks() {
        let chunks = vec![
            chunk(1.0, "T", "nothing matching here", "original_post", ""),
            chunk(0.9, "T", "also unrelated", "original_post", ""),
        ];
        let selected = select_context_chunks(&input(chunks, "scholarship?", &["scholarship"]), &config());
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_mixed_posts_filtered_by_keyword_or_source() {
        let chunks = vec![
            chunk(1.0, "A", "scholarship details", "original_post", ""),
            chunk(0.9, "B", "unrelated body", "original_post", ""),
            chunk(0.8, "B", "ocr text", "image_ocr", ""),
        ];
        let selected = select_context_chunks(&input(chunks, "scholarship?", &["scholarship"]), &config());
        let titles: Vec<&str> = selected.iter().map(|(_, c)| c.title.as_str()).collect();
        assert!(titles.contains(&"A"));
        // B's body is dropped, B's OCR survives (multimodal always kept).
        assert_eq!(selected.iter().filter(|(_, c)| c.title == "B").count(), 1);
        assert_eq!(
            selected
                .iter()
                .find(|(_, c)| c.title == "B")
                .map(|(_, c)| c.source.as_str()),
            Some("image_ocr")
        );
    }

    #[test]
    fn test_bodies_fill_before_low_score_extras() {
        let mut cfg = config();
        cfg.retrieval.max_context_chars = 30;
        let chunks = vec![
            chunk(0.2, "T", "low score attachment text", "document_parse", ""),
            chunk(1.0, "T", "body text", "original_post", ""),
        ];
        let selected = select_context_chunks(&input(chunks, "q", &[]), &cfg);
        // The body fits first even though the attachment chunk came first.
        assert_eq!(selected[0].1.source, "original_post");
    }

    #[test]
    fn test_budget_is_hard() {
        let mut cfg = config();
        cfg.retrieval.max_context_chars = 15;
        let chunks = vec![
            chunk(1.0, "T", "0123456789", "original_post", ""),
            chunk(0.9, "T", "0123456789", "document_parse", ""),
        ];
        let selected = select_context_chunks(&input(chunks, "q", &[]), &cfg);
        let total: usize = selected.iter().map(|(c, _)| c.chars().count()).sum();
        assert!(total <= 15);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_parse_answer_strict_json() {
        let (answer, answerable) = parse_answer(
            r#"{"answerable": true, "answer": "Yes, the scholarship notice is posted."}"#,
            &config().keywords.negative_patterns,
        );
        assert!(answerable);
        assert_eq!(answer, "Yes, the scholarship notice is posted.");
    }

    #[test]
    fn test_parse_answer_fenced_json() {
        let raw = "```json\n{\"answerable\": false, \"answer\": \"No.\"}\n```";
        let (answer, answerable) = parse_answer(raw, &config().keywords.negative_patterns);
        assert!(!answerable);
        assert_eq!(answer, "No.");
    }

    #[test]
    fn test_parse_answer_prose_fallback() {
        let patterns = config().keywords.negative_patterns;
        let (_, answerable) = parse_answer("The documents do not contain this topic.", &patterns);
        assert!(!answerable);
        let (_, answerable) = parse_answer("The deadline is March 15.", &patterns);
        assert!(answerable);
    }

    #[test]
    fn test_negative_pattern_safety_net() {
        // answerable=true but the text denies content → flipped to false.
        let patterns = config().keywords.negative_patterns;
        let (answer, answerable) = parse_answer(
            r#"{"answerable": true, "answer": "The documents do not contain scholarship details."}"#,
            &patterns,
        );
        assert!(answerable);
        assert!(contains_negative(&answer, &patterns));
    }

    #[test]
    fn test_completeness_warning_when_half_missing() {
        let context: String = (0..12)
            .map(|i| format!("2024{:06} ", 100000 + i))
            .collect();
        let answer = "2024100000 2024100001 2024100002";
        let warning = completeness_warning(&context, answer).unwrap();
        assert!(warning.contains("truncated"));
        assert!(completeness_warning(&context, &context).is_none());
    }

    #[test]
    fn test_stale_years_detects_old_document() {
        let svc = scoring();
        let old = "2023-05-01T00:00:00+09:00";
        let (doc_year, current_year) = stale_years(&svc, old).unwrap();
        assert_eq!(doc_year, 2023);
        assert!(current_year > doc_year);

        let current = svc.clock().now().to_rfc3339();
        assert!(stale_years(&svc, &current).is_none());
    }

    #[test]
    fn test_list_response_shape() {
        let docs = vec![
            DocEntry {
                title: "Rust Seminar".to_string(),
                date: "2024-05-01T00:00:00+09:00".to_string(),
                ..Default::default()
            },
            DocEntry {
                title: "AI Seminar".to_string(),
                date: "2024-04-01T00:00:00+09:00".to_string(),
                ..Default::default()
            },
        ];
        let response = list_response(BoardKind::Seminar, "seminar", &docs, "https://b/s");
        assert!(response.answerable);
        let answer = response.answer.unwrap();
        assert!(answer.starts_with("Here are recent seminars for 'seminar'"));
        assert!(answer.contains("Rust Seminar"));
        assert_eq!(response.references, "https://b/s&wr_id=");
        assert_eq!(response.images, vec![NO_CONTENT.to_string()]);
    }

    #[tokio::test]
    async fn test_negative_pattern_flips_answerable() {
        use httpmock::prelude::*;
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).json_body(serde_json::json!({
                    "choices": [{"message": {"content":
                        "{\"answerable\": true, \"answer\": \"The documents do not contain tuition details.\"}"}}]
                }));
            })
            .await;

        let llm = crate::llm::ChatClient::new(
            &crate::config::LlmConfig {
                api_base: server.base_url(),
                model: "m".into(),
                intent_model: None,
                max_tokens: 64,
                temperature: 0.0,
                timeout_secs: 5,
            },
            "key",
        )
        .unwrap();

        let chunks = vec![chunk(1.0, "T", "tuition body", "original_post", "")];
        let response = compose_answer(
            &llm,
            &config(),
            &scoring(),
            "https://notice",
            input(chunks, "tuition?", &["tuition"]),
        )
        .await;

        assert!(!response.answerable);
    }

    #[tokio::test]
    async fn test_ongoing_intent_with_stale_document_gets_caveat() {
        use httpmock::prelude::*;
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).json_body(serde_json::json!({
                    "choices": [{"message": {"content":
                        "{\"answerable\": true, \"answer\": \"The contest runs in May.\"}"}}]
                }));
            })
            .await;

        let llm = crate::llm::ChatClient::new(
            &crate::config::LlmConfig {
                api_base: server.base_url(),
                model: "m".into(),
                intent_model: None,
                max_tokens: 64,
                temperature: 0.0,
                timeout_secs: 5,
            },
            "key",
        )
        .unwrap();

        let chunks = vec![chunk(1.0, "Contest", "contest body", "original_post", "")];
        let mut answer_input = input(chunks, "is the contest open?", &["contest"]);
        answer_input.intent = Some(TemporalIntent {
            is_ongoing: true,
            ..Default::default()
        });
        answer_input.top_date = "2023-05-01T00:00:00+09:00".to_string();

        let response = compose_answer(&llm, &config(), &scoring(), "https://notice", answer_input).await;

        assert!(!response.answerable);
        let answer = response.answer.unwrap();
        assert!(answer.starts_with("Note: the referenced document is from 2023"));
        assert!(answer.contains("latest notices"));
    }

    #[test]
    fn test_chunk_content_preference() {
        let markdown = chunk(1.0, "T", "plain", "image_ocr", "| a |\n|---|");
        assert_eq!(chunk_content(&markdown), "| a |\n|---|");

        let html = chunk(1.0, "T", "plain", "image_ocr", "<p>from html</p>");
        assert_eq!(chunk_content(&html), "from html");

        let plain = chunk(1.0, "T", "plain", "original_post", "");
        assert_eq!(chunk_content(&plain), "plain");
    }
}
