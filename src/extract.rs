//! External content API adapter: image OCR and document parsing.
//!
//! A single multipart endpoint digitizes both images and binary documents
//! (the `model` field selects the parser, `ocr` is left on auto). The
//! adapter also expands ZIP archives locally, with zip-bomb guards, and
//! routes each supported member through the same endpoint.

use std::io::Read;
use std::time::Duration;

use crate::config::ExtractorConfig;

/// File extensions accepted by the digitization endpoint.
pub const IMAGE_EXTS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff", "tif", "heic",
];
pub const DOC_EXTS: &[&str] = &[
    "pdf", "doc", "docx", "ppt", "pptx", "xls", "xlsx", "hwp", "hwpx",
];

/// What an artefact URL routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Image,
    Document,
    Zip,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Image => "image",
            ArtifactKind::Document => "document",
            ArtifactKind::Zip => "zip-member",
        }
    }
}

/// Classify a filename or URL by extension.
pub fn kind_for_name(name: &str) -> Option<ArtifactKind> {
    let ext = extension_of(name)?;
    if ext == "zip" {
        return Some(ArtifactKind::Zip);
    }
    if IMAGE_EXTS.contains(&ext.as_str()) {
        return Some(ArtifactKind::Image);
    }
    if DOC_EXTS.contains(&ext.as_str()) {
        return Some(ArtifactKind::Document);
    }
    None
}

/// Lowercased extension of a filename or URL path (query stripped).
pub fn extension_of(name: &str) -> Option<String> {
    let no_fragment = name.split('#').next_back().unwrap_or(name);
    let no_query = no_fragment.split('?').next().unwrap_or(no_fragment);
    let file = no_query.rsplit('/').next().unwrap_or(no_query);
    let (_, ext) = file.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[derive(Debug)]
pub enum ExtractError {
    Unsupported(String),
    Api(String),
    Empty(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Unsupported(e) => write!(f, "unsupported file kind: {}", e),
            ExtractError::Api(e) => write!(f, "extraction API failed: {}", e),
            ExtractError::Empty(e) => write!(f, "empty extraction: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extraction result. `text` is already composed by priority (markdown over
/// flat text over element texts over flattened HTML); the raw markup rides
/// along for table-preserving consumers.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub text: String,
    pub markdown: String,
    pub html: String,
}

impl Extraction {
    /// The markup kept alongside embedded chunks: markdown when the API
    /// produced it, HTML otherwise.
    pub fn markup(&self) -> &str {
        if !self.markdown.is_empty() {
            &self.markdown
        } else {
            &self.html
        }
    }
}

/// One ZIP expansion run.
#[derive(Debug, Default)]
pub struct ZipOutcome {
    pub successful: Vec<(String, Extraction)>,
    /// (member filename, reason)
    pub failed: Vec<(String, String)>,
    pub total_files: usize,
}

pub struct ContentExtractor {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    max_retries: u32,
    max_zip_bytes: u64,
    max_zip_members: usize,
    max_unpacked_bytes: u64,
}

impl ContentExtractor {
    pub fn new(config: &ExtractorConfig, api_key: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            max_retries: config.max_retries,
            max_zip_bytes: config.max_zip_bytes,
            max_zip_members: config.max_zip_members,
            max_unpacked_bytes: config.max_unpacked_bytes,
        })
    }

    /// Extract text/markup from an image or document file.
    pub async fn extract(&self, bytes: &[u8], filename: &str) -> Result<Extraction, ExtractError> {
        match kind_for_name(filename) {
            Some(ArtifactKind::Image) | Some(ArtifactKind::Document) => {}
            Some(ArtifactKind::Zip) => {
                return Err(ExtractError::Unsupported(
                    "zip archives go through extract_zip".into(),
                ))
            }
            None => return Err(ExtractError::Unsupported(filename.to_string())),
        }

        let mut last_err = None;
        for attempt in 0..self.max_retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
            }

            let part = reqwest::multipart::Part::bytes(bytes.to_vec())
                .file_name(filename.to_string());
            let form = reqwest::multipart::Form::new()
                .part("document", part)
                .text("model", self.model.clone())
                .text("ocr", "auto");

            let response = self
                .client
                .post(&self.api_base)
                .bearer_auth(&self.api_key)
                .multipart(form)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body: serde_json::Value = resp
                            .json()
                            .await
                            .map_err(|e| ExtractError::Api(e.to_string()))?;
                        let extraction = compose_extraction(&body);
                        if extraction.text.is_empty() {
                            return Err(ExtractError::Empty(filename.to_string()));
                        }
                        return Ok(extraction);
                    }
                    let detail = resp.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(ExtractError::Api(format!("HTTP {}: {}", status, detail)));
                        continue;
                    }
                    return Err(ExtractError::Api(format!("HTTP {}: {}", status, detail)));
                }
                Err(e) => {
                    last_err = Some(ExtractError::Api(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ExtractError::Api("retries exhausted".into())))
    }

    /// Expand a ZIP archive and extract every supported member.
    ///
    /// Guards: archive size, member count, and cumulative uncompressed size
    /// are all bounded before any member is read.
    pub async fn extract_zip(&self, bytes: &[u8]) -> Result<ZipOutcome, ExtractError> {
        if bytes.len() as u64 > self.max_zip_bytes {
            return Err(ExtractError::Unsupported(format!(
                "archive exceeds {} bytes",
                self.max_zip_bytes
            )));
        }

        // Read members up front so the archive borrow never crosses an await.
        let members = self.read_members(bytes)?;
        let total_files = members.len();

        let mut outcome = ZipOutcome {
            total_files,
            ..Default::default()
        };

        for (name, data) in members {
            match kind_for_name(&name) {
                Some(ArtifactKind::Image) | Some(ArtifactKind::Document) => {
                    match self.extract(&data, &name).await {
                        Ok(extraction) => outcome.successful.push((name, extraction)),
                        Err(e) => outcome.failed.push((name, e.to_string())),
                    }
                }
                _ => outcome
                    .failed
                    .push((name.clone(), format!("unsupported file kind: {}", name))),
            }
        }

        Ok(outcome)
    }

    fn read_members(&self, bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, ExtractError> {
        let cursor = std::io::Cursor::new(bytes);
        let mut archive =
            zip::ZipArchive::new(cursor).map_err(|e| ExtractError::Api(e.to_string()))?;

        if archive.len() > self.max_zip_members {
            return Err(ExtractError::Unsupported(format!(
                "archive holds {} members (limit {})",
                archive.len(),
                self.max_zip_members
            )));
        }

        let mut members = Vec::new();
        let mut total_unpacked: u64 = 0;

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| ExtractError::Api(e.to_string()))?;
            if entry.is_dir() {
                continue;
            }

            total_unpacked = total_unpacked.saturating_add(entry.size());
            if total_unpacked > self.max_unpacked_bytes {
                return Err(ExtractError::Unsupported(format!(
                    "cumulative unpacked size exceeds {} bytes",
                    self.max_unpacked_bytes
                )));
            }

            let name = entry.name().to_string();
            let mut data = Vec::new();
            entry
                .take(self.max_unpacked_bytes)
                .read_to_end(&mut data)
                .map_err(|e| ExtractError::Api(e.to_string()))?;
            members.push((name, data));
        }

        Ok(members)
    }
}

/// Compose the extraction from an API response. Priority: `content.markdown`
/// (tables preserved) → `content.text` → element texts → flattened HTML.
fn compose_extraction(body: &serde_json::Value) -> Extraction {
    let content = body.get("content");
    let markdown = content
        .and_then(|c| c.get("markdown"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let html = content
        .and_then(|c| c.get("html"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let flat_text = content
        .and_then(|c| c.get("text"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let text = if !markdown.is_empty() {
        markdown.clone()
    } else if !flat_text.is_empty() {
        flat_text
    } else if let Some(joined) = element_texts(body) {
        joined
    } else if !html.is_empty() {
        flatten_html(&html)
    } else {
        String::new()
    };

    Extraction {
        text,
        markdown,
        html,
    }
}

fn element_texts(body: &serde_json::Value) -> Option<String> {
    let elements = body.get("elements")?.as_array()?;
    let mut parts = Vec::new();
    for element in elements {
        let content = element.get("content")?;
        let piece = content
            .get("markdown")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                content
                    .get("text")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
            });
        if let Some(p) = piece {
            parts.push(p.to_string());
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Flatten HTML to plain text. OCR responses sometimes carry their text in
/// `img[alt]` attributes, so those are collected first.
pub fn flatten_html(html: &str) -> String {
    let document = scraper::Html::parse_document(html);

    let mut parts: Vec<String> = Vec::new();
    if let Ok(selector) = scraper::Selector::parse("img") {
        for img in document.select(&selector) {
            if let Some(alt) = img.value().attr("alt") {
                let alt = alt.trim();
                if !alt.is_empty() && alt != "x" {
                    parts.push(alt.to_string());
                }
            }
        }
    }

    let body_text = document
        .root_element()
        .text()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if !body_text.is_empty() {
        parts.push(body_text);
    }

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::io::Write;

    fn extractor(server: &MockServer) -> ContentExtractor {
        let config = ExtractorConfig {
            api_base: server.url("/digitize"),
            model: "document-parse".into(),
            timeout_secs: 5,
            max_retries: 1,
            max_zip_bytes: 1024 * 1024,
            max_zip_members: 3,
            max_unpacked_bytes: 1024 * 1024,
        };
        ContentExtractor::new(&config, "test-key").unwrap()
    }

    fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_kind_for_name() {
        assert_eq!(kind_for_name("poster.PNG"), Some(ArtifactKind::Image));
        assert_eq!(kind_for_name("https://x/a/b/doc.pdf?x=1"), Some(ArtifactKind::Document));
        assert_eq!(kind_for_name("bundle.zip"), Some(ArtifactKind::Zip));
        assert_eq!(kind_for_name("script.exe"), None);
        assert_eq!(kind_for_name("no-extension"), None);
    }

    #[test]
    fn test_compose_prefers_markdown() {
        let body = serde_json::json!({
            "content": {"markdown": "| a | b |", "text": "a b", "html": "<table/>"}
        });
        let extraction = compose_extraction(&body);
        assert_eq!(extraction.text, "| a | b |");
        assert_eq!(extraction.markup(), "| a | b |");
    }

    #[test]
    fn test_compose_falls_back_to_elements_then_html() {
        let body = serde_json::json!({
            "content": {"markdown": "", "text": "", "html": ""},
            "elements": [
                {"content": {"markdown": "", "text": "first"}},
                {"content": {"markdown": "second"}}
            ]
        });
        assert_eq!(compose_extraction(&body).text, "first\n\nsecond");

        let html_only = serde_json::json!({
            "content": {"html": "<p>Location: Engineering Bldg 4</p>"}
        });
        assert_eq!(compose_extraction(&html_only).text, "Location: Engineering Bldg 4");
    }

    #[test]
    fn test_flatten_html_reads_img_alt() {
        let text = flatten_html(r#"<p><img alt="Poster text"/><img alt="x"/>body</p>"#);
        assert!(text.contains("Poster text"));
        assert!(text.contains("body"));
        assert!(!text.contains("\nx"));
    }

    #[tokio::test]
    async fn test_extract_unsupported_extension_no_api_call() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/digitize");
                then.status(200).json_body(serde_json::json!({"content": {"text": "x"}}));
            })
            .await;

        let err = extractor(&server).extract(b"bytes", "malware.exe").await.unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn test_extract_happy_path() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/digitize");
                then.status(200).json_body(serde_json::json!({
                    "content": {"markdown": "OCR result", "html": "<p>OCR result</p>"}
                }));
            })
            .await;

        let extraction = extractor(&server).extract(b"png-bytes", "poster.png").await.unwrap();
        assert_eq!(extraction.text, "OCR result");
        assert_eq!(extraction.html, "<p>OCR result</p>");
        mock.assert();
    }

    #[tokio::test]
    async fn test_zip_member_limit_guard() {
        let server = MockServer::start_async().await;
        let data = make_zip(&[
            ("a.pdf", b"1"),
            ("b.pdf", b"2"),
            ("c.pdf", b"3"),
            ("d.pdf", b"4"),
        ]);
        let err = extractor(&server).extract_zip(&data).await.unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_zip_unsupported_member_reported_job_continues() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/digitize");
                then.status(200).json_body(serde_json::json!({"content": {"text": "parsed"}}));
            })
            .await;

        let data = make_zip(&[("report.pdf", b"pdf"), ("tool.exe", b"bin")]);
        let outcome = extractor(&server).extract_zip(&data).await.unwrap();
        assert_eq!(outcome.total_files, 2);
        assert_eq!(outcome.successful.len(), 1);
        assert_eq!(outcome.successful[0].0, "report.pdf");
        assert_eq!(outcome.failed.len(), 1);
        mock.assert_hits(1);
    }
}
