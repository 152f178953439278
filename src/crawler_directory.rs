//! Directory crawlers: faculty, guest-faculty, and staff listings.
//!
//! Directory boards are single pages of profile cards rather than
//! id-enumerated posts. Each card flattens to one text record (name plus
//! labelled detail fields), carries at most one profile image, and uses a
//! fixed sentinel date so directory entries never compete on recency.
//! Re-ingestion happens when a card's content hash changes.

use scraper::{ElementRef, Html, Selector};
use std::time::Duration;

use crate::clock::{post_content_hash, Clock};
use crate::config::Config;
use crate::models::{BoardKind, Post};

/// Sentinel date for directory entries (the recency baseline).
const DIRECTORY_DATE: &str = "24-01-01 00:00";

/// Card containers per directory variant. The faculty page nests its cards
/// under `#dr`; the guest-faculty and staff pages share a `#Student` list.
fn container_selector(kind: BoardKind) -> &'static str {
    match kind {
        BoardKind::Faculty => "div#dr li",
        _ => "div#Student li",
    }
}

#[derive(Clone)]
pub struct DirectoryCrawler {
    pub kind: BoardKind,
    base_url: String,
    origin: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
    clock: Clock,
}

impl DirectoryCrawler {
    pub fn new(kind: BoardKind, config: &Config, clock: Clock) -> anyhow::Result<Self> {
        debug_assert!(kind.is_directory());
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
            clock,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Crawl the whole directory page.
    pub async fn crawl_all(&self) -> Vec<Post> {
        let mut page = None;
        for attempt in 0..self.max_retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.client.get(&self.base_url).send().await {
                Ok(response) if response.status().is_success() => {
                    page = response.text().await.ok();
                    break;
                }
                Ok(response) => {
                    tracing::debug!(url = %self.base_url, status = %response.status(), "directory fetch");
                }
                Err(e) => {
                    tracing::debug!(url = %self.base_url, error = %e, "directory fetch failed");
                }
            }
        }

        let Some(page) = page else {
            tracing::warn!(board = %self.kind, "directory page unavailable");
            return Vec::new();
        };

        let posts = parse_directory_page(self.kind, &self.origin, &self.base_url, &page, &self.clock);
        println!("crawl {}: {} entries", self.kind, posts.len());
        posts
    }
}

/// Parse all profile cards on a directory page.
pub fn parse_directory_page(
    kind: BoardKind,
    origin: &str,
    base_url: &str,
    html: &str,
    clock: &Clock,
) -> Vec<Post> {
    let document = Html::parse_document(html);
    let Ok(card_selector) = Selector::parse(container_selector(kind)) else {
        return Vec::new();
    };

    let date = clock.board_date_to_iso(DIRECTORY_DATE);
    let mut posts = Vec::new();

    for card in document.select(&card_selector) {
        let Some(name) = card_name(&card) else {
            continue;
        };

        let details = card_details(&card);
        let body_text = if details.is_empty() {
            format!("Name: {}", name)
        } else {
            format!("Name: {}, {}", name, details.join(", "))
        };

        let image_urls = card_image(&card, origin).into_iter().collect();
        let url = card_link(&card, origin).unwrap_or_else(|| base_url.to_string());

        posts.push(Post {
            board_type: kind,
            board_id: 0,
            content_hash: post_content_hash(&name, &body_text),
            title: name,
            body_text,
            date: date.clone(),
            canonical_url: url,
            image_urls,
            attachment_urls: Vec::new(),
        });
    }

    posts
}

fn card_name(card: &ElementRef) -> Option<String> {
    for selector in ["h1", "h3", "div.name", ".name"] {
        let Ok(sel) = Selector::parse(selector) else {
            continue;
        };
        if let Some(el) = card.select(&sel).next() {
            let name = el
                .text()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            if !name.is_empty() {
                return Some(name);
            }
        }
    }
    None
}

/// Labelled detail fields: every `dt`/`dd` pair, or bare `dd` values when
/// the card carries no terms.
fn card_details(card: &ElementRef) -> Vec<String> {
    let Ok(dl_selector) = Selector::parse("dl") else {
        return Vec::new();
    };
    let (Ok(dt_selector), Ok(dd_selector)) = (Selector::parse("dt"), Selector::parse("dd")) else {
        return Vec::new();
    };

    let text_of = |el: &ElementRef| {
        el.text()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    };

    let mut details = Vec::new();
    for dl in card.select(&dl_selector) {
        let terms: Vec<String> = dl.select(&dt_selector).map(|el| text_of(&el)).collect();
        let values: Vec<String> = dl.select(&dd_selector).map(|el| text_of(&el)).collect();
        for (i, value) in values.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            match terms.get(i) {
                Some(term) if !term.is_empty() => details.push(format!("{}: {}", term, value)),
                _ => details.push(value.clone()),
            }
        }
    }
    details
}

fn card_image(card: &ElementRef, origin: &str) -> Option<String> {
    let Ok(img_selector) = Selector::parse("img") else {
        return None;
    };
    let src = card
        .select(&img_selector)
        .next()
        .and_then(|img| img.value().attr("src"))?;
    if src.is_empty() {
        return None;
    }
    Some(absolutize(origin, src))
}

fn card_link(card: &ElementRef, origin: &str) -> Option<String> {
    let Ok(a_selector) = Selector::parse("a") else {
        return None;
    };
    let href = card
        .select(&a_selector)
        .next()
        .and_then(|a| a.value().attr("href"))?;
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    Some(absolutize(origin, href))
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

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://cse.example.ac.kr";

    fn clock() -> Clock {
        Clock::new(9)
    }

    #[test]
    fn test_parse_faculty_cards() {
        let html = r#"
        <div id="dr"><ul>
          <li>
            <a href="/prof/1"><div class="dr_img"><img src="/img/kim.jpg"/></div></a>
            <div class="dr_txt"><h3>Kim Minsoo</h3>
              <dl><dt>Office</dt><dd>Bldg 4, 201</dd><dt>Email</dt><dd>kim@cse.example.ac.kr</dd></dl>
            </div>
          </li>
          <li>
            <div class="dr_txt"><h3>Lee Jiyoon</h3>
              <dl><dt>Office</dt><dd>Bldg 4, 305</dd></dl>
            </div>
          </li>
        </ul></div>"#;

        let posts =
            parse_directory_page(BoardKind::Faculty, ORIGIN, "https://x/faculty", html, &clock());
        assert_eq!(posts.len(), 2);

        let kim = &posts[0];
        assert_eq!(kim.title, "Kim Minsoo");
        assert!(kim.body_text.contains("Office: Bldg 4, 201"));
        assert!(kim.body_text.contains("Email: kim@cse.example.ac.kr"));
        assert_eq!(kim.image_urls, vec![format!("{ORIGIN}/img/kim.jpg")]);
        assert_eq!(kim.canonical_url, format!("{ORIGIN}/prof/1"));
        assert_eq!(kim.date, "2024-01-01T00:00:00+09:00");

        let lee = &posts[1];
        assert!(lee.image_urls.is_empty());
        assert_eq!(lee.canonical_url, "https://x/faculty");
    }

    #[test]
    fn test_parse_staff_cards_use_student_container() {
        let html = r#"
        <div id="Student"><ul>
          <li>
            <div class="img"><img src="/img/park.jpg"/></div>
            <div class="cnt"><h1>Park Admin</h1></div>
            <dl class="dep"><dt>Duties</dt><dd>Registrar support</dd></dl>
          </li>
        </ul></div>"#;

        let posts = parse_directory_page(BoardKind::Staff, ORIGIN, "https://x/staff", html, &clock());
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "Park Admin");
        assert!(posts[0].body_text.contains("Duties: Registrar support"));
    }

    #[test]
    fn test_nameless_card_dropped() {
        let html = r#"<div id="dr"><ul><li><div class="dr_img"><img src="/x.jpg"/></div></li></ul></div>"#;
        let posts = parse_directory_page(BoardKind::Faculty, ORIGIN, "https://x", html, &clock());
        assert!(posts.is_empty());
    }

    #[test]
    fn test_hash_changes_with_details() {
        let a = r#"<div id="dr"><ul><li><h3>Kim</h3><dl><dt>Office</dt><dd>201</dd></dl></li></ul></div>"#;
        let b = r#"<div id="dr"><ul><li><h3>Kim</h3><dl><dt>Office</dt><dd>305</dd></dl></li></ul></div>"#;
        let post_a = parse_directory_page(BoardKind::Faculty, ORIGIN, "u", a, &clock());
        let post_b = parse_directory_page(BoardKind::Faculty, ORIGIN, "u", b, &clock());
        assert_ne!(post_a[0].content_hash, post_b[0].content_hash);
    }
}
