//! Board crawlers for the id-enumerated boards (notice, job, seminar).
//!
//! All variants share retrying HTTP, latest-id discovery from the landing
//! page, URL enumeration over an id range, and a bounded worker pool for
//! page fetches. Per-board differences are confined to which selectors
//! locate the title/body/date and which image/attachment URLs are pulled
//! out of the body.

use futures::stream::{self, StreamExt};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;
use std::time::Duration;

use crate::clock::{post_content_hash, Clock};
use crate::config::Config;
use crate::models::{BoardKind, Post};
use crate::snapshot::post_id_of;

const TITLE_SELECTOR: &str = "span.bo_v_tit";
const BODY_SELECTOR: &str = "div#bo_v_con";
const DATE_SELECTOR: &str = "strong.if_date";
const FILE_SELECTOR: &str = "section#bo_v_file a, div.bo_v_file a";

const IMAGE_LINK_EXTS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp"];
const ATTACHMENT_EXTS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".ppt", ".pptx", ".xls", ".xlsx", ".hwp", ".hwpx", ".zip",
];

#[derive(Clone)]
pub struct BoardCrawler {
    pub kind: BoardKind,
    base_url: String,
    origin: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
    workers: usize,
    clock: Clock,
}

impl BoardCrawler {
    pub fn new(kind: BoardKind, config: &Config, clock: Clock) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.crawl.http_timeout_secs))
            .build()?;
        Ok(Self {
            kind,
            base_url: config.boards.url_for(kind)?.to_string(),
            origin: config.boards.origin.trim_end_matches('/').to_string(),
            client,
            max_retries: config.crawl.max_retries,
            retry_delay: Duration::from_secs(config.crawl.retry_delay_secs),
            workers: config.crawl.max_workers,
            clock,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET a page with retry; `None` after the final failure (the post is
    /// simply omitted).
    pub async fn fetch_page(&self, url: &str) -> Option<String> {
        for attempt in 0..self.max_retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.text().await {
                        Ok(text) => return Some(text),
                        Err(e) => {
                            tracing::warn!(url, error = %e, "body read failed");
                        }
                    }
                }
                Ok(response) => {
                    tracing::debug!(url, status = %response.status(), "non-success status");
                }
                Err(e) => {
                    tracing::debug!(url, error = %e, attempt, "request failed");
                }
            }
        }
        tracing::warn!(url, "page fetch failed after retries");
        None
    }

    /// Largest post id visible on the board landing page.
    pub async fn latest_id(&self) -> Option<u32> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"wr_id=(\d+)").expect("static regex"));

        let page = self.fetch_page(&self.base_url).await?;
        re.captures_iter(&page)
            .filter_map(|c| c.get(1))
            .filter_map(|m| m.as_str().parse::<u32>().ok())
            .max()
    }

    pub fn post_url(&self, id: u32) -> String {
        format!("{}&wr_id={}", self.base_url, id)
    }

    pub fn enumerate(&self, ids: &[u32]) -> Vec<String> {
        ids.iter().map(|id| self.post_url(*id)).collect()
    }

    /// Fetch and parse one post page. A page whose title cannot be located
    /// is silently dropped.
    pub async fn extract_from_url(&self, url: &str) -> Option<Post> {
        let page = self.fetch_page(url).await?;
        parse_post_page(self.kind, &self.origin, url, &page, &self.clock)
    }

    /// Crawl many post URLs through the bounded worker pool, preserving
    /// input order among the survivors.
    pub async fn crawl_many(&self, urls: &[String]) -> Vec<Post> {
        let posts: Vec<Option<Post>> = stream::iter(urls)
            .map(|url| self.extract_from_url(url))
            .buffered(self.workers.max(1))
            .collect()
            .await;

        let found: Vec<Post> = posts.into_iter().flatten().collect();
        println!(
            "crawl {}: {} urls, {} posts extracted",
            self.kind,
            urls.len(),
            found.len()
        );
        found
    }
}

/// Parse a post page into a `Post`.
pub fn parse_post_page(
    kind: BoardKind,
    origin: &str,
    url: &str,
    html: &str,
    clock: &Clock,
) -> Option<Post> {
    let document = Html::parse_document(html);

    let title_selector = Selector::parse(TITLE_SELECTOR).ok()?;
    let title = document
        .select(&title_selector)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<Vec<_>>().join(" ")))?;
    if title.is_empty() {
        return None;
    }

    let body_selector = Selector::parse(BODY_SELECTOR).ok()?;
    let body_el = document.select(&body_selector).next();

    let body_text = body_el
        .map(|el| {
            el.text()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    let mut image_urls = body_el
        .map(|el| extract_image_urls(&el, origin))
        .unwrap_or_default();
    image_urls.dedup();

    let mut attachment_urls = extract_attachment_urls(&document, origin);
    // An attachment that also appears as a body image is already handled by
    // the image path; drop it here.
    let image_set: std::collections::HashSet<&str> =
        image_urls.iter().map(|s| s.as_str()).collect();
    attachment_urls.retain(|a| !image_set.contains(a.as_str()));

    let date_selector = Selector::parse(DATE_SELECTOR).ok()?;
    let date_raw = document
        .select(&date_selector)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    let date = clock.board_date_to_iso(&date_raw);

    let body_for_hash = body_text.clone();
    Some(Post {
        board_type: kind,
        board_id: post_id_of(url).unwrap_or(0),
        content_hash: post_content_hash(&title, &body_for_hash),
        title,
        body_text,
        date,
        canonical_url: url.to_string(),
        image_urls,
        attachment_urls,
    })
}

/// Pull image URLs out of the post body, preferring originals over
/// thumbnails: parent `<a href>` to an image file first, then lazy-load
/// `data-original`, then plain `src`. `/thumb-` URLs are skipped.
fn extract_image_urls(body: &ElementRef, origin: &str) -> Vec<String> {
    let Ok(img_selector) = Selector::parse("img") else {
        return Vec::new();
    };

    let mut urls = Vec::new();
    for img in body.select(&img_selector) {
        let mut candidate: Option<String> = None;

        if let Some(anchor) = img
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "a")
        {
            if let Some(href) = anchor.value().attr("href") {
                let lower = href.to_lowercase();
                if IMAGE_LINK_EXTS.iter().any(|ext| lower.contains(ext)) {
                    candidate = Some(href.to_string());
                }
            }
        }

        if candidate.is_none() {
            if let Some(lazy) = img.value().attr("data-original") {
                candidate = Some(lazy.to_string());
            }
        }
        if candidate.is_none() {
            if let Some(src) = img.value().attr("src") {
                candidate = Some(src.to_string());
            }
        }

        if let Some(raw) = candidate {
            let absolute = absolutize(origin, &raw);
            if !absolute.contains("/thumb-") {
                urls.push(absolute);
            }
        }
    }
    urls
}

fn extract_attachment_urls(document: &Html, origin: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse(FILE_SELECTOR) else {
        return Vec::new();
    };

    let mut urls = Vec::new();
    for link in document.select(&selector) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let lower = href.to_lowercase();
        let is_download = lower.contains("download.php")
            || ATTACHMENT_EXTS.iter().any(|ext| lower.contains(ext));
        if is_download {
            urls.push(absolutize(origin, href));
        }
    }
    urls.dedup();
    urls
}

fn absolutize(origin: &str, href: &str) -> String {
    if href.starts_with("http") || href.starts_with("data:") {
        return href.to_string();
    }
    if href.starts_with('/') {
        format!("{}{}", origin, href)
    } else {
        format!("{}/{}", origin, href)
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const ORIGIN: &str = "https://cse.example.ac.kr";

    fn page(title: &str, body: &str, files: &str, date: &str) -> String {
        format!(
            r#"<html><body>
            <span class="bo_v_tit">{title}</span>
            <strong class="if_date">written {date}</strong>
            <div id="bo_v_con">{body}</div>
            <section id="bo_v_file">{files}</section>
            </body></html>"#
        )
    }

    fn clock() -> Clock {
        Clock::new(9)
    }

    #[test]
    fn test_parse_full_post() {
        let html = page(
            "2024 Spring Scholarship Notice",
            r#"<p>Apply by March.</p>
               <a href="/data/editor/poster.png"><img src="/thumb-poster.png"/></a>
               <img data-original="/data/editor/lazy.jpg" src="/thumb-lazy.jpg"/>"#,
            r#"<a class="view_file_download" href="/bbs/download.php?bo_table=n&wr_id=77&no=0">guide.pdf</a>"#,
            "24-02-15 09:00",
        );
        let url = format!("{ORIGIN}/bbs/board.php?bo_table=n&wr_id=77");
        let post = parse_post_page(BoardKind::Notice, ORIGIN, &url, &html, &clock()).unwrap();

        assert_eq!(post.title, "2024 Spring Scholarship Notice");
        assert_eq!(post.board_id, 77);
        assert!(post.body_text.contains("Apply by March."));
        assert_eq!(post.date, "2024-02-15T09:00:00+09:00");
        assert_eq!(
            post.image_urls,
            vec![
                format!("{ORIGIN}/data/editor/poster.png"),
                format!("{ORIGIN}/data/editor/lazy.jpg"),
            ]
        );
        assert_eq!(
            post.attachment_urls,
            vec![format!("{ORIGIN}/bbs/download.php?bo_table=n&wr_id=77&no=0")]
        );
        assert!(!post.content_hash.is_empty());
    }

    #[test]
    fn test_post_without_title_dropped() {
        let html = r#"<html><body><div id="bo_v_con">orphan body</div></body></html>"#;
        assert!(parse_post_page(BoardKind::Notice, ORIGIN, "https://x?wr_id=1", html, &clock()).is_none());
    }

    #[test]
    fn test_thumbnail_only_image_skipped() {
        let html = page(
            "Poster Post",
            r#"<img src="/data/thumb-abc__123.png"/>"#,
            "",
            "24-01-02 10:00",
        );
        let post =
            parse_post_page(BoardKind::Seminar, ORIGIN, "https://x?wr_id=2", &html, &clock()).unwrap();
        assert!(post.image_urls.is_empty());
    }

    #[test]
    fn test_attachment_duplicated_as_image_removed() {
        let shared = "/data/editor/poster.png";
        let html = page(
            "Post",
            &format!(r#"<a href="{shared}"><img src="{shared}"/></a>"#),
            &format!(r#"<a class="view_file_download" href="{shared}">poster.png</a>"#),
            "24-01-02 10:00",
        );
        let post =
            parse_post_page(BoardKind::Notice, ORIGIN, "https://x?wr_id=3", &html, &clock()).unwrap();
        assert_eq!(post.image_urls.len(), 1);
        assert!(post.attachment_urls.is_empty());
    }

    #[test]
    fn test_content_hash_tracks_body_changes() {
        let a = page("T", "<p>old body</p>", "", "24-01-02 10:00");
        let b = page("T", "<p>new body</p>", "", "24-01-02 10:00");
        let post_a = parse_post_page(BoardKind::Notice, ORIGIN, "https://x?wr_id=4", &a, &clock()).unwrap();
        let post_b = parse_post_page(BoardKind::Notice, ORIGIN, "https://x?wr_id=4", &b, &clock()).unwrap();
        assert_ne!(post_a.content_hash, post_b.content_hash);
    }

    #[tokio::test]
    async fn test_latest_id_scans_landing_page() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/bbs/board.php");
                then.status(200).body(
                    r#"<a href="board.php?bo_table=n&wr_id=101">a</a>
                       <a href="board.php?bo_table=n&wr_id=99">b</a>"#,
                );
            })
            .await;

        let config = Config::for_tests(
            &server.base_url(),
            &server.url("/bbs/board.php?bo_table=n"),
            &server.base_url(),
        );

        let crawler = BoardCrawler::new(BoardKind::Notice, &config, clock()).unwrap();
        assert_eq!(crawler.latest_id().await, Some(101));
    }
}
