//! Score adjustment: recency weighting and lexical similarity boosts.
//!
//! The day-band constants reflect accumulated tuning of the production
//! ranking; they arrive through `[scoring]` configuration and land here as
//! plain arithmetic. Two recency curves exist: the fine-grained band weight
//! used by both retrievers, and a coarse boost applied once after fusion.

use chrono::{DateTime, FixedOffset};

use crate::clock::Clock;
use crate::config::ScoringConfig;
use crate::models::{DocEntry, NO_CONTENT};
use crate::tokenize::has_digit;

/// Title-intersection boost per matched-token character.
const TITLE_MATCH_WEIGHT: f64 = 0.21;
/// Extra per-character boost for digit-bearing matched tokens.
const DIGIT_MATCH_WEIGHT: f64 = 0.22;
/// Boost for documents whose body is empty (title carries the weight).
const EMPTY_BODY_BOOST: f64 = 1.5;
/// Audience-token adjustment (matched / unmatched).
const AUDIENCE_BONUS: f64 = 2.0;
/// The recency curve never drops below this.
const WEIGHT_FLOOR: f64 = 0.88;

#[derive(Clone)]
pub struct ScoringService {
    config: ScoringConfig,
    clock: Clock,
    baseline: Option<DateTime<FixedOffset>>,
}

impl ScoringService {
    pub fn new(config: ScoringConfig, clock: Clock) -> Self {
        let baseline = clock.parse_iso(&config.baseline_date);
        if baseline.is_none() {
            tracing::warn!(date = %config.baseline_date, "unparseable scoring baseline date");
        }
        Self {
            config,
            clock,
            baseline,
        }
    }

    fn query_has(&self, tokens: &[String], vocabulary: &[String]) -> bool {
        tokens.iter().any(|t| vocabulary.iter().any(|v| v == t))
    }

    /// Fine-grained recency weight for one post date.
    pub fn weight_by_age(
        &self,
        post_date: &DateTime<FixedOffset>,
        now: &DateTime<FixedOffset>,
        query_tokens: &[String],
    ) -> f64 {
        let milestone = if self.query_has(query_tokens, &self.config.milestone_tokens) {
            1.0
        } else {
            0.0
        };
        let funding = if self.query_has(query_tokens, &self.config.funding_tokens) {
            1.0
        } else {
            0.0
        };

        if let Some(baseline) = &self.baseline {
            if post_date <= baseline {
                return self.config.baseline_weight + milestone / 5.0;
            }
        }

        let recent = if self.query_has(query_tokens, &self.config.recent_tokens) {
            1.5
        } else {
            0.0
        };

        let days = (*now - *post_date).num_days();
        let weight = match days {
            d if d <= 6 => 1.355 + recent + milestone + funding,
            d if d <= 12 => 1.330 + recent / 3.0 + milestone / 1.2 + funding / 1.5,
            d if d <= 18 => 1.321 + recent / 5.0 + milestone / 1.3 + funding / 2.0,
            d if d <= 24 => 1.310 + recent / 7.0 + milestone / 1.4 + funding / 2.5,
            d if d <= 30 => 1.290 + recent / 9.0 + milestone / 1.5 + funding / 3.0,
            d if d <= 36 => 1.270 + milestone / 1.6 + funding / 3.5,
            d if d <= 45 => 1.250 + milestone / 1.7 + funding / 4.0,
            d if d <= 60 => 1.230 + milestone / 1.8 + funding / 4.5,
            d if d <= 90 => 1.210 + milestone / 2.0 + funding / 5.0,
            d => {
                let months = (d - 90) / 30;
                match months {
                    0 => 1.19,
                    1 => 1.17 - recent / 6.0 - funding / 10.0,
                    2 => 1.15 - recent / 5.0 - funding / 9.0,
                    3 => 1.13 - recent / 4.0 - funding / 7.0,
                    4 => 1.11 - recent / 3.0 - funding / 5.0,
                    _ => WEIGHT_FLOOR - recent / 2.0 - funding / 5.0,
                }
            }
        };

        weight.max(WEIGHT_FLOOR)
    }

    /// Multiply a similarity by the recency weight of its document date.
    /// Unparseable dates leave the similarity unchanged.
    pub fn adjust_date_similarity(
        &self,
        similarity: f64,
        date: &str,
        query_tokens: &[String],
    ) -> f64 {
        match self.clock.parse_iso(date) {
            Some(post_date) => {
                similarity * self.weight_by_age(&post_date, &self.clock.now(), query_tokens)
            }
            None => similarity,
        }
    }

    /// Title-intersection similarity adjuster over the whole corpus.
    pub fn adjust_similarity_scores(
        &self,
        query_tokens: &[String],
        docs: &[DocEntry],
        scores: &mut [f64],
    ) {
        let query_set: std::collections::HashSet<&str> =
            query_tokens.iter().map(|s| s.as_str()).collect();
        let audience_in_query = self.query_has(query_tokens, &self.config.audience_tokens);

        for (i, doc) in docs.iter().enumerate() {
            let title_tokens: std::collections::HashSet<String> = doc
                .title
                .split_whitespace()
                .map(|t| t.to_lowercase())
                .collect();

            if doc.text.is_empty() || doc.text == NO_CONTENT {
                scores[i] *= EMPTY_BODY_BOOST;
            }

            for token in &title_tokens {
                if query_set.contains(token.as_str()) {
                    let len = token.chars().count() as f64;
                    scores[i] += len * TITLE_MATCH_WEIGHT;
                    if has_digit(token) {
                        scores[i] += len * DIGIT_MATCH_WEIGHT;
                    }
                }
            }

            let audience_in_title = self
                .config
                .audience_tokens
                .iter()
                .any(|a| title_tokens.contains(&a.to_lowercase()));
            if audience_in_query && audience_in_title {
                scores[i] += AUDIENCE_BONUS;
            } else if !audience_in_query && audience_in_title {
                scores[i] -= AUDIENCE_BONUS;
            }
        }
    }

    /// Coarse post-fusion boost: ≤6 months +50 %, ≤1 year +30 %, ≤2 years
    /// +10 %, older −10 %. Future or unparseable dates are neutral.
    pub fn coarse_recency_boost(&self, date: &str) -> f64 {
        let Some(post_date) = self.clock.parse_iso(date) else {
            return 1.0;
        };
        let days = (self.clock.now() - post_date).num_days();
        if days < 0 {
            1.0
        } else if days <= 180 {
            1.5
        } else if days <= 365 {
            1.3
        } else if days <= 730 {
            1.1
        } else {
            0.9
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn service() -> ScoringService {
        ScoringService::new(ScoringConfig::default(), Clock::new(9))
    }

    fn iso_days_ago(clock: &Clock, days: i64) -> String {
        (clock.now() - Duration::days(days)).to_rfc3339()
    }

    #[test]
    fn test_recency_weight_monotone_after_baseline() {
        let svc = service();
        let now = svc.clock.now();
        let query: Vec<String> = vec!["recent".to_string()];

        let mut last = f64::INFINITY;
        for days in [1i64, 10, 20, 28, 33, 40, 50, 70, 85, 100, 130, 160, 200, 230, 400] {
            let date = now - Duration::days(days);
            let weight = svc.weight_by_age(&date, &now, &query);
            assert!(
                weight <= last + 1e-9,
                "weight increased with age at {days} days: {weight} > {last}"
            );
            assert!(weight >= WEIGHT_FLOOR, "weight below floor at {days} days");
            last = weight;
        }
    }

    #[test]
    fn test_recent_token_boosts_fresh_posts() {
        let svc = service();
        let now = svc.clock.now();
        let fresh = now - Duration::days(3);
        let plain = svc.weight_by_age(&fresh, &now, &[]);
        let boosted = svc.weight_by_age(&fresh, &now, &["latest".to_string()]);
        assert!(boosted > plain);
    }

    #[test]
    fn test_pre_baseline_flat_weight() {
        let svc = service();
        let now = svc.clock.now();
        let old = svc.clock.parse_iso("2020-05-01T00:00:00+09:00").unwrap();
        assert!((svc.weight_by_age(&old, &now, &[]) - 1.35).abs() < 1e-9);
    }

    #[test]
    fn test_coarse_boost_bands() {
        let svc = service();
        let clock = svc.clock;
        assert_eq!(svc.coarse_recency_boost(&iso_days_ago(&clock, 30)), 1.5);
        assert_eq!(svc.coarse_recency_boost(&iso_days_ago(&clock, 300)), 1.3);
        assert_eq!(svc.coarse_recency_boost(&iso_days_ago(&clock, 700)), 1.1);
        assert_eq!(svc.coarse_recency_boost(&iso_days_ago(&clock, 900)), 0.9);
        assert_eq!(svc.coarse_recency_boost("not a date"), 1.0);
    }

    #[test]
    fn test_title_match_adjustment() {
        let svc = service();
        let docs = vec![
            DocEntry {
                title: "2024 Scholarship Notice".to_string(),
                text: "body".to_string(),
                ..Default::default()
            },
            DocEntry {
                title: "Unrelated Post".to_string(),
                text: "body".to_string(),
                ..Default::default()
            },
        ];
        let mut scores = vec![1.0, 1.0];
        svc.adjust_similarity_scores(
            &["scholarship".to_string(), "2024".to_string()],
            &docs,
            &mut scores,
        );
        // "scholarship" (11 chars × 0.21) + "2024" (4 × 0.21 + 4 × 0.22).
        assert!(scores[0] > scores[1]);
        assert!((scores[0] - (1.0 + 11.0 * 0.21 + 4.0 * 0.21 + 4.0 * 0.22)).abs() < 1e-9);
    }

    #[test]
    fn test_empty_body_boost() {
        let svc = service();
        let docs = vec![DocEntry {
            title: "Poster Only".to_string(),
            text: NO_CONTENT.to_string(),
            ..Default::default()
        }];
        let mut scores = vec![2.0];
        svc.adjust_similarity_scores(&[], &docs, &mut scores);
        assert!((scores[0] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_audience_penalty() {
        let svc = service();
        let docs = vec![DocEntry {
            title: "graduate school briefing".to_string(),
            text: "body".to_string(),
            ..Default::default()
        }];

        let mut without = vec![5.0];
        svc.adjust_similarity_scores(&["briefing".to_string()], &docs, &mut without);
        assert!(without[0] < 5.0);

        let mut with = vec![5.0];
        svc.adjust_similarity_scores(&["graduate".to_string()], &docs, &mut with);
        assert!(with[0] > 5.0);
    }
}
