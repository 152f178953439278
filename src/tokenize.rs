//! Query and document tokenization.
//!
//! The searchable surface is noun-oriented; when no morphological analyser
//! is wired in, tokenization falls back to whitespace splitting with
//! punctuation stripped. Query terms additionally get number-unit capture,
//! configurable synonym expansion, and stopword removal. Markup flattening
//! for the BM25 surface lives here too: markdown passes through unchanged
//! (table structure is already searchable), HTML is reduced to text.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::config::KeywordsConfig;
use crate::extract::flatten_html;

#[derive(Debug, Clone)]
pub struct Tokenizer {
    stopwords: HashSet<String>,
    synonyms: HashMap<String, Vec<String>>,
}

impl Tokenizer {
    pub fn new(config: &KeywordsConfig) -> Self {
        Self {
            stopwords: config.stopwords.iter().map(|s| s.to_lowercase()).collect(),
            synonyms: config
                .synonyms
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect(),
        }
    }

    /// Extract noun-oriented query terms from a question.
    pub fn query_terms(&self, question: &str) -> Vec<String> {
        static NUM_RE: OnceLock<Regex> = OnceLock::new();
        let num_re = NUM_RE.get_or_init(|| Regex::new(r"\d+[a-zA-Z]*").expect("static regex"));

        let lowered = question.to_lowercase();
        let mut terms: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut push = |term: String, terms: &mut Vec<String>, seen: &mut HashSet<String>| {
            if !term.is_empty() && seen.insert(term.clone()) {
                terms.push(term);
            }
        };

        // Number-bearing tokens first ("2024", "5", "2nd semester" pieces).
        let mut remainder = lowered.clone();
        for m in num_re.find_iter(&lowered) {
            push(m.as_str().to_string(), &mut terms, &mut seen);
            remainder = remainder.replacen(m.as_str(), " ", 1);
        }

        // Domain synonym expansion: aliases inject their expansions.
        for (alias, expansions) in &self.synonyms {
            if lowered.contains(alias) {
                for expansion in expansions {
                    push(expansion.to_lowercase(), &mut terms, &mut seen);
                }
            }
        }

        // Remaining words, stopword-filtered.
        for raw in remainder.split(|c: char| !c.is_alphanumeric()) {
            let token = raw.trim();
            if token.chars().count() <= 1 {
                continue;
            }
            if self.stopwords.contains(token) {
                continue;
            }
            push(token.to_string(), &mut terms, &mut seen);
        }

        terms
    }

    /// Tokenize a document surface for the lexical index.
    pub fn doc_tokens(&self, text: &str) -> Vec<String> {
        text.split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect()
    }
}

/// The combined lexical surface of one document.
pub fn combined_surface(title: &str, text: &str, html_text: &str) -> String {
    format!("{} {} {}", title, text, html_text)
        .trim()
        .to_string()
}

/// True when the markup looks like markdown (table pipes already carry the
/// structure; no parsing needed).
pub fn looks_like_markdown(markup: &str) -> bool {
    !markup.is_empty() && markup.contains('|') && (markup.contains("---") || markup.contains('\n'))
}

/// Flatten stored markup to searchable text: markdown passes through, HTML
/// is reduced to its text content.
pub fn flatten_markup(markup: &str) -> String {
    if markup.is_empty() {
        return String::new();
    }
    if looks_like_markdown(markup) {
        return markup.to_string();
    }
    flatten_html(markup)
}

pub fn has_digit(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> Tokenizer {
        let mut config = KeywordsConfig::default();
        config
            .synonyms
            .insert("comp sci".to_string(), vec!["computer-science".to_string()]);
        Tokenizer::new(&config)
    }

    #[test]
    fn test_query_terms_extracts_numbers() {
        let terms = tokenizer().query_terms("Course registration for 2023 semester 2");
        assert!(terms.contains(&"2023".to_string()));
        assert!(terms.contains(&"2".to_string()));
        assert!(terms.contains(&"registration".to_string()));
    }

    #[test]
    fn test_query_terms_filters_stopwords() {
        let terms = tokenizer().query_terms("Is there a scholarship notice?");
        assert!(terms.contains(&"scholarship".to_string()));
        assert!(terms.contains(&"notice".to_string()));
        assert!(!terms.contains(&"there".to_string()));
        assert!(!terms.contains(&"is".to_string()));
    }

    #[test]
    fn test_synonym_expansion() {
        let terms = tokenizer().query_terms("any comp sci seminars?");
        assert!(terms.contains(&"computer-science".to_string()));
    }

    #[test]
    fn test_query_terms_deduplicated() {
        let terms = tokenizer().query_terms("seminar seminar seminar");
        assert_eq!(terms.iter().filter(|t| *t == "seminar").count(), 1);
    }

    #[test]
    fn test_doc_tokens_strip_punctuation() {
        let tokens = tokenizer().doc_tokens("Hello, World! (2024)");
        assert_eq!(tokens, vec!["hello", "world", "2024"]);
    }

    #[test]
    fn test_markdown_passthrough() {
        let table = "| a | b |\n|---|---|\n| 1 | 2 |";
        assert!(looks_like_markdown(table));
        assert_eq!(flatten_markup(table), table);
    }

    #[test]
    fn test_html_flattened() {
        let flattened = flatten_markup("<p>Hello <b>world</b></p>");
        assert!(flattened.contains("Hello"));
        assert!(flattened.contains("world"));
        assert!(!flattened.contains('<'));
    }

    #[test]
    fn test_has_digit() {
        assert!(has_digit("2024"));
        assert!(has_digit("s2"));
        assert!(!has_digit("semester"));
    }
}
