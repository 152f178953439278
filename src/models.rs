//! Core data types used throughout campus-qa.
//!
//! These types represent the posts, artefacts, chunks, and candidates that
//! flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Sentinel used where the original boards expose no content.
pub const NO_CONTENT: &str = "No content";

/// Disclaimer attached to every answer payload.
pub const DISCLAIMER: &str = "Answers may not always be accurate. Check the referenced URLs for exact and up-to-date information.";

/// The boards the service crawls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoardKind {
    Notice,
    Job,
    Seminar,
    Faculty,
    GuestFaculty,
    Staff,
}

impl BoardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoardKind::Notice => "notice",
            BoardKind::Job => "job",
            BoardKind::Seminar => "seminar",
            BoardKind::Faculty => "faculty",
            BoardKind::GuestFaculty => "guest-faculty",
            BoardKind::Staff => "staff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "notice" => Some(BoardKind::Notice),
            "job" => Some(BoardKind::Job),
            "seminar" => Some(BoardKind::Seminar),
            "faculty" => Some(BoardKind::Faculty),
            "guest-faculty" => Some(BoardKind::GuestFaculty),
            "staff" => Some(BoardKind::Staff),
            _ => None,
        }
    }

    /// Directory boards are single-page listings without post ids.
    pub fn is_directory(&self) -> bool {
        matches!(
            self,
            BoardKind::Faculty | BoardKind::GuestFaculty | BoardKind::Staff
        )
    }

    pub fn all() -> [BoardKind; 6] {
        [
            BoardKind::Notice,
            BoardKind::Job,
            BoardKind::Seminar,
            BoardKind::Faculty,
            BoardKind::GuestFaculty,
            BoardKind::Staff,
        ]
    }
}

impl std::fmt::Display for BoardKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A crawled post, immutable after successful ingestion.
#[derive(Debug, Clone)]
pub struct Post {
    pub board_type: BoardKind,
    /// Post id within the board; directory entries synthesize 0.
    pub board_id: u32,
    pub title: String,
    pub body_text: String,
    /// ISO-8601 with timezone offset, or empty when the board had no date.
    pub date: String,
    pub canonical_url: String,
    pub image_urls: Vec<String>,
    pub attachment_urls: Vec<String>,
    /// Stable hash over title + body; drives re-ingestion detection.
    pub content_hash: String,
}

/// Vector-index metadata `content_type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Text,
    Image,
    Attachment,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Attachment => "attachment",
        }
    }
}

/// Vector-index metadata `source` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSource {
    OriginalPost,
    ImageOcr,
    DocumentParse,
    ProfessorInfo,
}

impl ChunkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkSource::OriginalPost => "original_post",
            ChunkSource::ImageOcr => "image_ocr",
            ChunkSource::DocumentParse => "document_parse",
            ChunkSource::ProfessorInfo => "professor_info",
        }
    }
}

/// Metadata attached to each embedded chunk.
#[derive(Debug, Clone)]
pub struct ItemMetadata {
    pub title: String,
    pub url: String,
    pub date: String,
    pub content_type: ContentType,
    pub source: ChunkSource,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Markdown/HTML markup preserved alongside the chunk (never embedded).
    pub html: String,
    pub html_available: bool,
    pub image_url: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_type: Option<String>,
}

impl ItemMetadata {
    pub fn for_body(title: &str, url: &str, date: &str, source: ChunkSource) -> Self {
        Self {
            title: title.to_string(),
            url: url.to_string(),
            date: date.to_string(),
            content_type: ContentType::Text,
            source,
            chunk_index: 0,
            total_chunks: 1,
            html: String::new(),
            html_available: false,
            image_url: None,
            attachment_url: None,
            attachment_type: None,
        }
    }
}

/// The indivisible unit sent to the vector index.
#[derive(Debug, Clone)]
pub struct EmbeddingItem {
    pub text: String,
    pub metadata: ItemMetadata,
}

/// One document of the metadata snapshot (the query path's hot working set).
///
/// Held in a contiguous `Vec<DocEntry>` in memory; the legacy parallel-array
/// layout survives only at the cache-blob boundary (see `snapshot`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocEntry {
    pub title: String,
    /// Text preview (≤ ~200 chars of the embedded chunk).
    pub text: String,
    pub url: String,
    pub date: String,
    pub html: String,
    pub content_type: String,
    pub source: String,
    pub image_url: String,
    pub attachment_url: String,
    pub attachment_type: String,
}

/// A scored document flowing through the retrieval pipeline.
///
/// Every stage takes and returns `Candidate`s; no tuple plumbing.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub score: f64,
    pub title: String,
    pub date: String,
    pub text: String,
    pub url: String,
    pub html: String,
    pub content_type: String,
    pub source: String,
    pub attachment_type: String,
}

impl Candidate {
    pub fn from_entry(score: f64, entry: &DocEntry) -> Self {
        Self {
            score,
            title: entry.title.clone(),
            date: entry.date.clone(),
            text: entry.text.clone(),
            url: entry.url.clone(),
            html: entry.html.clone(),
            content_type: entry.content_type.clone(),
            source: entry.source.clone(),
            attachment_type: entry.attachment_type.clone(),
        }
    }
}

/// Structured time constraints extracted from a question.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemporalIntent {
    pub year: Option<i32>,
    pub semester: Option<u8>,
    pub is_ongoing: bool,
    pub is_policy: bool,
}

impl TemporalIntent {
    pub fn is_empty(&self) -> bool {
        self.year.is_none() && self.semester.is_none() && !self.is_ongoing && !self.is_policy
    }
}

/// Outcome of ingesting one post. The ingestion loop inspects the variant;
/// nothing unwinds across component boundaries.
#[derive(Debug, Clone)]
pub enum PostOutcome {
    /// Ingested; carries the number of embedding items produced.
    Ok { items: usize },
    Skipped(String),
    Failed { kind: String, detail: String },
}

/// Per-run ingestion report, printed at the end of a crawl.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub boards: Vec<BoardReport>,
    pub vectors_upserted: usize,
}

#[derive(Debug, Default)]
pub struct BoardReport {
    pub board: String,
    pub crawled: usize,
    pub new_posts: usize,
    pub skipped: usize,
    pub failed: usize,
    pub items: usize,
    pub artifact_warnings: Vec<String>,
}

/// The response payload of `POST /ai/ai-response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    pub answer: Option<String>,
    pub answerable: bool,
    pub references: String,
    pub disclaimer: String,
    pub images: Vec<String>,
}

impl AiResponse {
    pub fn not_found(notice_board_url: &str) -> Self {
        Self {
            answer: Some(
                "The question is not covered by the board postings. Please check the notice board for details.".to_string(),
            ),
            answerable: false,
            references: notice_board_url.to_string(),
            disclaimer: DISCLAIMER.to_string(),
            images: vec![NO_CONTENT.to_string()],
        }
    }
}
