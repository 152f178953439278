//! Temporal intent parsing.
//!
//! Two tiers: a fast path that matches a closed set of phrases, and an LLM
//! call instructed to emit strict JSON. The JSON parser is the source of
//! truth; anything non-conforming falls back to "no filter" (and the
//! fallback is logged so it can be watched).

use chrono::Datelike;

use crate::clock::{semester_of, Clock};
use crate::llm::ChatClient;
use crate::models::TemporalIntent;

#[derive(Clone)]
pub struct IntentParser {
    clock: Clock,
}

impl IntentParser {
    pub fn new(clock: Clock) -> Self {
        Self { clock }
    }

    /// Parse the temporal intent of a question. Returns `None` when the
    /// question carries no usable time constraint.
    pub async fn parse(&self, question: &str, llm: &ChatClient) -> Option<TemporalIntent> {
        if let Some(intent) = self.fast_path(question) {
            tracing::info!(?intent, "temporal intent via phrase rules");
            return Some(intent);
        }

        match self.llm_path(question, llm).await {
            Ok(Some(intent)) => {
                tracing::info!(?intent, "temporal intent via LLM");
                Some(intent)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "temporal intent LLM call failed; no filter");
                None
            }
        }
    }

    /// Closed phrase set handled without any model call.
    fn fast_path(&self, question: &str) -> Option<TemporalIntent> {
        let lowered = question.to_lowercase();
        let now = self.clock.now();
        let (year, semester) = semester_of(&now);

        if lowered.contains("this semester") || lowered.contains("current semester") {
            return Some(TemporalIntent {
                year: Some(year),
                semester: Some(semester),
                ..Default::default()
            });
        }
        if lowered.contains("this year") {
            return Some(TemporalIntent {
                year: Some(now.year()),
                ..Default::default()
            });
        }
        None
    }

    async fn llm_path(
        &self,
        question: &str,
        llm: &ChatClient,
    ) -> anyhow::Result<Option<TemporalIntent>> {
        let now = self.clock.now();
        let (year, semester) = semester_of(&now);
        let prev_year = if semester == 2 { year } else { year - 1 };
        let prev_semester = if semester == 1 { 2 } else { 1 };

        let prompt = format!(
            r#"You resolve the time frame a question refers to.
Today is {date}. The current academic term is year {year}, semester {semester}.
The previous term was year {prev_year}, semester {prev_semester}. Semesters: months 3-8 are semester 1, months 9-2 are semester 2 (January and February belong to the previous year's semester 2).

Question: {question}

Respond with exactly one JSON object and nothing else:
{{"year": <int or null>, "semester": <int or null>, "is_ongoing": <bool>, "is_policy": <bool>, "reasoning": "<short>"}}

Rules:
- "is_ongoing" is true when the question asks about something currently open, active, or valid rather than a specific term.
- "is_policy" is true for timeless policy/regulation questions.
- Set year/semester only when the question names or clearly implies them."#,
            date = now.format("%Y-%m-%d"),
            year = year,
            semester = semester,
            prev_year = prev_year,
            prev_semester = prev_semester,
            question = question,
        );

        let raw = llm.invoke_intent(&prompt).await?;
        match parse_intent_json(&raw) {
            Some(intent) if intent.is_empty() => Ok(None),
            Some(intent) => Ok(Some(intent)),
            None => {
                tracing::warn!(raw = %truncate(&raw), "non-conforming intent JSON; no filter");
                Ok(None)
            }
        }
    }
}

/// Parse the model's JSON, tolerating fenced code blocks.
pub fn parse_intent_json(raw: &str) -> Option<TemporalIntent> {
    let cleaned = strip_fences(raw);
    let value: serde_json::Value = serde_json::from_str(cleaned).ok()?;
    let object = value.as_object()?;

    let year = object.get("year").and_then(|v| v.as_i64()).map(|y| y as i32);
    let semester = object
        .get("semester")
        .and_then(|v| v.as_i64())
        .filter(|s| (1..=2).contains(s))
        .map(|s| s as u8);
    let is_ongoing = object
        .get("is_ongoing")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let is_policy = object
        .get("is_policy")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if is_ongoing {
        return Some(TemporalIntent {
            year: None,
            semester: None,
            is_ongoing: true,
            is_policy,
        });
    }
    if year.is_some() || semester.is_some() {
        return Some(TemporalIntent {
            year,
            semester,
            is_ongoing: false,
            is_policy,
        });
    }
    if is_policy {
        return Some(TemporalIntent {
            year: None,
            semester: None,
            is_ongoing: false,
            is_policy: true,
        });
    }
    Some(TemporalIntent::default())
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

/// Human description of an intent, injected into the answer prompt.
pub fn describe_intent(intent: Option<&TemporalIntent>) -> String {
    match intent {
        None => "No specific time constraint.".to_string(),
        Some(intent) if intent.is_ongoing => {
            "The user asks about something currently ongoing; prefer current-term information.".to_string()
        }
        Some(intent) if intent.is_policy => {
            "The question concerns standing policy; document age matters less.".to_string()
        }
        Some(intent) => match (intent.year, intent.semester) {
            (Some(y), Some(s)) => format!("The user asks about year {}, semester {}.", y, s),
            (Some(y), None) => format!("The user asks about year {}.", y),
            (None, Some(s)) => format!("The user asks about semester {}.", s),
            (None, None) => "No specific time constraint.".to_string(),
        },
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(200).collect()
}
