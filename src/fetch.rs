//! Uniform file retrieval.
//!
//! Fetches bytes from `http(s)://` URLs, `data:` URIs, and the two proxy
//! forms the boards use: `view_image.php?fn=<encoded-path>` (rewritten to
//! the origin path) and `download.php?bo_table=…&wr_id=…` (requires a short
//! cookie-warming sequence before the download succeeds). Resolves filename
//! and MIME from headers or the URL, and retries transient failures with
//! exponential backoff.

use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

/// Fetch failure, categorised for the callers' retry/skip decisions.
#[derive(Debug)]
pub enum FetchError {
    Network(String),
    NotFound(String),
    Unsupported(String),
    Transient(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Network(e) => write!(f, "network error: {}", e),
            FetchError::NotFound(e) => write!(f, "not found: {}", e),
            FetchError::Unsupported(e) => write!(f, "unsupported source: {}", e),
            FetchError::Transient(e) => write!(f, "transient failure: {}", e),
        }
    }
}

impl std::error::Error for FetchError {}

/// A successfully fetched file.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    /// URL actually requested after proxy rewriting.
    pub resolved_url: String,
}

pub struct FileFetcher {
    client: reqwest::Client,
    max_retries: u32,
    retry_base: Duration,
}

impl FileFetcher {
    pub fn new(timeout_secs: u64, max_retries: u32, retry_base_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .cookie_store(true)
            .build()?;
        Ok(Self {
            client,
            max_retries,
            retry_base: Duration::from_secs(retry_base_secs),
        })
    }

    /// Fetch a file from any supported URL form.
    pub async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        if url.starts_with("data:") {
            return decode_data_uri(url);
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(FetchError::Unsupported(format!("scheme of {}", truncate(url))));
        }

        let resolved = rewrite_proxy_url(url);

        if url.contains("download.php") {
            self.warm_cookies(url).await;
        }

        let mut last_err = None;
        for attempt in 0..self.max_retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.retry_base * 2u32.pow(attempt - 1)).await;
            }

            match self.client.get(&resolved).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let content_type = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(|s| s.to_ascii_lowercase());
                        let disposition = response
                            .headers()
                            .get(reqwest::header::CONTENT_DISPOSITION)
                            .and_then(|v| v.to_str().ok())
                            .map(|s| s.to_string());
                        let bytes = response
                            .bytes()
                            .await
                            .map_err(|e| FetchError::Transient(e.to_string()))?;
                        let filename = resolve_filename(
                            disposition.as_deref(),
                            &resolved,
                            url,
                            content_type.as_deref(),
                        );
                        return Ok(Fetched {
                            bytes: bytes.to_vec(),
                            filename,
                            content_type,
                            resolved_url: resolved,
                        });
                    }
                    if status.as_u16() == 404 {
                        return Err(FetchError::NotFound(truncate(url)));
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(FetchError::Transient(format!(
                            "HTTP {} for {}",
                            status,
                            truncate(url)
                        )));
                        continue;
                    }
                    return Err(FetchError::Network(format!(
                        "HTTP {} for {}",
                        status,
                        truncate(url)
                    )));
                }
                Err(e) => {
                    last_err = Some(FetchError::Transient(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| FetchError::Transient(truncate(url))))
    }

    /// The board blocks bare download requests; visiting the board root and
    /// the enclosing post first establishes the session cookies it checks.
    async fn warm_cookies(&self, url: &str) {
        let Ok(parsed) = Url::parse(url) else { return };
        let Some(host) = parsed.host_str() else { return };
        let base = match parsed.port() {
            Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
            None => format!("{}://{}", parsed.scheme(), host),
        };

        let mut bo_table = None;
        let mut wr_id = None;
        for (k, v) in parsed.query_pairs() {
            match k.as_ref() {
                "bo_table" => bo_table = Some(v.to_string()),
                "wr_id" => wr_id = Some(v.to_string()),
                _ => {}
            }
        }

        if let Some(table) = &bo_table {
            let board_url = format!("{}/bbs/board.php?bo_table={}", base, table);
            tracing::debug!(url = %board_url, "cookie warm: board root");
            let _ = self.client.get(&board_url).send().await;

            if let Some(id) = &wr_id {
                let post_url = format!("{}/bbs/board.php?bo_table={}&wr_id={}", base, table, id);
                tracing::debug!(url = %post_url, "cookie warm: enclosing post");
                let _ = self.client.get(&post_url).send().await;
            }
        }
    }
}

/// Rewrite `view_image.php?fn=<encoded-path>` to the decoded path joined to
/// the origin. Other URLs pass through unchanged.
pub fn rewrite_proxy_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_string();
    };
    if !parsed.path().contains("view_image.php") {
        return url.to_string();
    }
    let Some(host) = parsed.host_str() else {
        return url.to_string();
    };
    let origin = match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    };

    for (k, v) in parsed.query_pairs() {
        if k == "fn" {
            let path = v.to_string();
            if path.starts_with('/') {
                return format!("{}{}", origin, path);
            }
            return format!("{}/{}", origin, path);
        }
    }
    url.to_string()
}

fn decode_data_uri(uri: &str) -> Result<Fetched, FetchError> {
    let Some((header, data)) = uri.split_once(";base64,") else {
        return Err(FetchError::Unsupported("data URI without base64 payload".into()));
    };
    let content_type = header.trim_start_matches("data:").trim().to_string();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| FetchError::Unsupported(format!("data URI decode: {}", e)))?;

    let filename = mime_fallback_name(Some(&content_type));
    Ok(Fetched {
        bytes,
        filename,
        content_type: Some(content_type),
        resolved_url: "data-uri".to_string(),
    })
}

/// Filename resolution order: Content-Disposition (including the RFC-5987
/// encoded form) → proxy query parameters (`fn`, `file`, `filename`) → URL
/// path → MIME-derived fallback.
pub fn resolve_filename(
    content_disposition: Option<&str>,
    resolved_url: &str,
    original_url: &str,
    content_type: Option<&str>,
) -> Option<String> {
    if let Some(disposition) = content_disposition {
        if let Some(name) = disposition_filename(disposition) {
            return Some(name);
        }
    }

    for candidate in [original_url, resolved_url] {
        if let Ok(parsed) = Url::parse(candidate) {
            for param in ["fn", "file", "filename"] {
                if let Some(value) = parsed
                    .query_pairs()
                    .find(|(k, _)| k == param)
                    .map(|(_, v)| v.to_string())
                {
                    if let Some(name) = value.rsplit('/').next() {
                        if !name.is_empty() {
                            return Some(name.to_string());
                        }
                    }
                }
            }
            if let Some(name) = parsed.path().rsplit('/').next() {
                if name.contains('.') && !name.ends_with(".php") {
                    return Some(name.to_string());
                }
            }
        }
    }

    mime_fallback_name(content_type)
}

fn disposition_filename(disposition: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"filename\*=(?:UTF-8'')?([^;]+)|filename=([^;]+)"#).expect("static regex")
    });

    let caps = re.captures(disposition)?;
    if let Some(encoded) = caps.get(1) {
        let decoded = percent_decode(encoded.as_str());
        return Some(decoded.trim_matches(['"', '\'']).to_string());
    }
    caps.get(2)
        .map(|m| m.as_str().trim().trim_matches(['"', '\'']).to_string())
}

fn mime_fallback_name(content_type: Option<&str>) -> Option<String> {
    let mime = content_type?.split(';').next()?.trim();
    let ext = match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        "image/webp" => "webp",
        "image/tiff" => "tiff",
        "application/pdf" => "pdf",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-powerpoint" => "ppt",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => "pptx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "application/x-hwp" | "application/haansofthwp" | "application/vnd.hancom.hwp" => "hwp",
        "application/vnd.hancom.hwpx" => "hwpx",
        "application/zip" => "zip",
        _ => return None,
    };
    Some(format!("document.{}", ext))
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn truncate(url: &str) -> String {
    if url.len() > 80 {
        format!("{}…", &url[..80])
    } else {
        url.to_string()
    }
}
