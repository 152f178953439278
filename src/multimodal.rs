//! Multimodal artefact processing.
//!
//! Turns a post's image and attachment URLs into extracted text with
//! two-key caching: a URL-keyed entry for the fast path and a
//! content-hash-keyed entry that catches identical bytes at distinct URLs.
//! A byte sequence is sent to the external extraction API at most once,
//! ever. ZIP attachments fan out to their members under `<zip_url>#<member>`
//! synthetic URLs. Finally, the post plus its artefacts become embedding
//! items, chunked to the configured size.

use crate::chunk::CharacterChunker;
use crate::extract::{kind_for_name, ArtifactKind, ContentExtractor};
use crate::fetch::FileFetcher;
use crate::models::{
    ChunkSource, ContentType, EmbeddingItem, ItemMetadata, Post,
};
use crate::store::{CachedExtraction, DocumentStore};
use crate::{clock, extract};

/// One successfully extracted artefact.
#[derive(Debug, Clone)]
pub struct ArtifactText {
    pub url: String,
    pub kind: ArtifactKind,
    pub text: String,
    /// Markdown or HTML markup preserved for enrichment.
    pub markup: String,
    /// File extension label for attachments ("pdf", "hwp", …).
    pub type_label: String,
}

/// Everything extracted for one post.
#[derive(Debug, Default)]
pub struct ProcessedArtifacts {
    pub images: Vec<ArtifactText>,
    pub attachments: Vec<ArtifactText>,
    pub failures: Vec<String>,
}

impl ProcessedArtifacts {
    pub fn succeeded(&self) -> usize {
        self.images.len() + self.attachments.len()
    }
}

pub struct MultimodalProcessor<'a> {
    fetcher: &'a FileFetcher,
    extractor: &'a ContentExtractor,
    store: &'a DocumentStore,
}

impl<'a> MultimodalProcessor<'a> {
    pub fn new(
        fetcher: &'a FileFetcher,
        extractor: &'a ContentExtractor,
        store: &'a DocumentStore,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            store,
        }
    }

    /// Process every artefact of a post. Failures never abort the post;
    /// they are collected for the run report.
    pub async fn process_post(&self, post: &Post) -> ProcessedArtifacts {
        let mut out = ProcessedArtifacts::default();

        for url in &post.image_urls {
            match self.process_one(url, ArtifactKind::Image).await {
                Ok(Some(artifact)) => out.images.push(artifact),
                Ok(None) => {}
                Err(reason) => out.failures.push(format!("{}: {}", short(url), reason)),
            }
        }

        for url in &post.attachment_urls {
            // Image-extension attachments route through OCR; archives fan
            // out; everything else is a document parse.
            let kind = kind_for_name(url).unwrap_or(ArtifactKind::Document);
            match kind {
                ArtifactKind::Zip => {
                    self.process_zip(url, &mut out).await;
                }
                ArtifactKind::Image => match self.process_one(url, ArtifactKind::Image).await {
                    Ok(Some(mut artifact)) => {
                        artifact.type_label = "image".to_string();
                        out.attachments.push(artifact);
                    }
                    Ok(None) => {}
                    Err(reason) => out.failures.push(format!("{}: {}", short(url), reason)),
                },
                ArtifactKind::Document => match self.process_one(url, ArtifactKind::Document).await
                {
                    Ok(Some(artifact)) => out.attachments.push(artifact),
                    Ok(None) => {}
                    Err(reason) => out.failures.push(format!("{}: {}", short(url), reason)),
                },
            }
        }

        out
    }

    /// The per-URL algorithm: URL cache → fetch + hash → hash cache →
    /// extraction → store under both keys. `Ok(None)` means a remembered
    /// failure (not retried).
    async fn process_one(
        &self,
        url: &str,
        kind: ArtifactKind,
    ) -> Result<Option<ArtifactText>, String> {
        // 1. URL-keyed cache.
        if let Ok(Some(cached)) = self.store.extraction_by_url(url).await {
            if cached.failed {
                return Ok(None);
            }
            if !cached.text.is_empty() {
                tracing::debug!(url = %short(url), "artefact served from URL cache");
                return Ok(Some(cached_to_artifact(url, kind, &cached)));
            }
        }

        // 2. Fetch bytes and compute the content address.
        let fetched = match self.fetcher.fetch(url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.remember_failure(url, kind, None).await;
                return Err(e.to_string());
            }
        };
        let file_hash = clock::file_bytes_hash(&fetched.bytes);

        // 3. Content-hash cache: identical bytes at another URL. Alias this
        // URL to the same result; no second API call, ever.
        if let Ok(Some(cached)) = self.store.extraction_by_hash(&file_hash).await {
            if !cached.failed && !cached.text.is_empty() {
                tracing::debug!(url = %short(url), hash = %file_hash, "duplicate bytes; extraction reused");
                let artifact = cached_to_artifact(url, kind, &cached);
                self.store_success(url, kind, &file_hash, &artifact).await;
                return Ok(Some(artifact));
            }
        }

        // 4. New content: one external extraction.
        let filename = fetched
            .filename
            .clone()
            .or_else(|| url.rsplit('/').next().map(|s| s.to_string()))
            .unwrap_or_else(|| "document".to_string());

        match self.extractor.extract(&fetched.bytes, &filename).await {
            Ok(extraction) => {
                let artifact = ArtifactText {
                    url: url.to_string(),
                    kind,
                    text: extraction.text.clone(),
                    markup: extraction.markup().to_string(),
                    type_label: extract::extension_of(&filename).unwrap_or_default(),
                };
                // 5. Store under both keys.
                self.store_success(url, kind, &file_hash, &artifact).await;
                Ok(Some(artifact))
            }
            Err(e) => {
                self.remember_failure(url, kind, Some(&file_hash)).await;
                Err(e.to_string())
            }
        }
    }

    async fn process_zip(&self, url: &str, out: &mut ProcessedArtifacts) {
        let fetched = match self.fetcher.fetch(url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                out.failures.push(format!("{}: {}", short(url), e));
                return;
            }
        };

        match self.extractor.extract_zip(&fetched.bytes).await {
            Ok(outcome) => {
                for (member, extraction) in outcome.successful {
                    let member_url = format!("{}#{}", url, member);
                    let artifact = ArtifactText {
                        url: member_url.clone(),
                        kind: ArtifactKind::Zip,
                        text: extraction.text.clone(),
                        markup: extraction.markup().to_string(),
                        type_label: extract::extension_of(&member).unwrap_or_default(),
                    };
                    self.store_success(&member_url, ArtifactKind::Zip, "", &artifact)
                        .await;
                    out.attachments.push(artifact);
                }
                for (member, reason) in outcome.failed {
                    out.failures
                        .push(format!("{}#{}: {}", short(url), member, reason));
                }
            }
            Err(e) => out.failures.push(format!("{}: {}", short(url), e)),
        }
    }

    async fn store_success(
        &self,
        url: &str,
        kind: ArtifactKind,
        file_hash: &str,
        artifact: &ArtifactText,
    ) {
        let (markdown, html) = split_markup(&artifact.markup);
        let entry = CachedExtraction {
            url: url.to_string(),
            file_hash: if file_hash.is_empty() {
                None
            } else {
                Some(file_hash.to_string())
            },
            kind: kind.as_str().to_string(),
            text: artifact.text.clone(),
            markdown,
            html,
            failed: false,
        };
        if let Err(e) = self.store.put_extraction(&entry).await {
            tracing::warn!(url = %short(url), error = %e, "failed to cache extraction");
        }
    }

    async fn remember_failure(&self, url: &str, kind: ArtifactKind, file_hash: Option<&str>) {
        let entry = CachedExtraction {
            url: url.to_string(),
            file_hash: file_hash.map(|h| h.to_string()),
            kind: kind.as_str().to_string(),
            failed: true,
            ..Default::default()
        };
        if let Err(e) = self.store.put_extraction(&entry).await {
            tracing::warn!(url = %short(url), error = %e, "failed to record extraction failure");
        }
    }
}

fn cached_to_artifact(url: &str, kind: ArtifactKind, cached: &CachedExtraction) -> ArtifactText {
    let markup = if !cached.markdown.is_empty() {
        cached.markdown.clone()
    } else {
        cached.html.clone()
    };
    ArtifactText {
        url: url.to_string(),
        kind,
        text: cached.text.clone(),
        markup,
        type_label: extract::extension_of(url).unwrap_or_default(),
    }
}

fn split_markup(markup: &str) -> (String, String) {
    if crate::tokenize::looks_like_markdown(markup) {
        (markup.to_string(), String::new())
    } else {
        (String::new(), markup.to_string())
    }
}

fn short(url: &str) -> String {
    if url.len() > 60 {
        format!("{}…", &url[..60])
    } else {
        url.to_string()
    }
}

/// Convert a post plus its extracted artefacts into embedding items.
///
/// Body text chunks come first, then image OCR, then attachment parses.
/// Long extraction texts are chunked like body text; markup is carried in
/// metadata, never embedded.
pub fn to_embedding_items(
    post: &Post,
    artifacts: &ProcessedArtifacts,
    chunker: &CharacterChunker,
    body_source: ChunkSource,
) -> Vec<EmbeddingItem> {
    let mut items = Vec::new();

    let body_chunks = chunker.split(&post.body_text);
    let total = body_chunks.len();
    for (index, chunk) in body_chunks.into_iter().enumerate() {
        let mut metadata =
            ItemMetadata::for_body(&post.title, &post.canonical_url, &post.date, body_source);
        metadata.chunk_index = index;
        metadata.total_chunks = total;
        items.push(EmbeddingItem {
            text: chunk,
            metadata,
        });
    }

    for artifact in &artifacts.images {
        let labelled = format!("[Image text]\n{}", artifact.text);
        push_artifact_items(
            &mut items,
            post,
            artifact,
            labelled,
            ContentType::Image,
            ChunkSource::ImageOcr,
            chunker,
        );
    }

    for artifact in &artifacts.attachments {
        let label = if artifact.type_label.is_empty() {
            "FILE".to_string()
        } else {
            artifact.type_label.to_uppercase()
        };
        let labelled = format!("[Attachment: {}]\n{}", label, artifact.text);
        push_artifact_items(
            &mut items,
            post,
            artifact,
            labelled,
            ContentType::Attachment,
            ChunkSource::DocumentParse,
            chunker,
        );
    }

    items
}

fn push_artifact_items(
    items: &mut Vec<EmbeddingItem>,
    post: &Post,
    artifact: &ArtifactText,
    text: String,
    content_type: ContentType,
    source: ChunkSource,
    chunker: &CharacterChunker,
) {
    if artifact.text.is_empty() {
        return;
    }

    let chunks = if text.chars().count() > chunker.chunk_size() {
        chunker.split(&text)
    } else {
        vec![text]
    };
    let total = chunks.len();

    for (index, chunk) in chunks.into_iter().enumerate() {
        let mut metadata = ItemMetadata {
            title: post.title.clone(),
            url: post.canonical_url.clone(),
            date: post.date.clone(),
            content_type,
            source,
            chunk_index: index,
            total_chunks: total,
            html: artifact.markup.clone(),
            html_available: !artifact.markup.is_empty(),
            image_url: None,
            attachment_url: None,
            attachment_type: None,
        };
        match content_type {
            ContentType::Image => metadata.image_url = Some(artifact.url.clone()),
            ContentType::Attachment => {
                metadata.attachment_url = Some(artifact.url.clone());
                metadata.attachment_type = Some(artifact.type_label.clone());
            }
            ContentType::Text => {}
        }
        items.push(EmbeddingItem {
            text: chunk,
            metadata,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractorConfig;
    use crate::models::BoardKind;
    use crate::{db, migrate};
    use httpmock::prelude::*;

    async fn test_store() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("mm.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (dir, DocumentStore::new(pool))
    }

    fn extractor_for(server: &MockServer) -> ContentExtractor {
        let config = ExtractorConfig {
            api_base: server.url("/digitize"),
            model: "document-parse".into(),
            timeout_secs: 5,
            max_retries: 1,
            max_zip_bytes: 1024 * 1024,
            max_zip_members: 50,
            max_unpacked_bytes: 1024 * 1024,
        };
        ContentExtractor::new(&config, "key").unwrap()
    }

    fn post_with(images: Vec<String>, attachments: Vec<String>) -> Post {
        Post {
            board_type: BoardKind::Notice,
            board_id: 1,
            title: "Post".to_string(),
            body_text: "body".to_string(),
            date: "2024-01-01T00:00:00+09:00".to_string(),
            canonical_url: "https://b/board.php?bo_table=n&wr_id=1".to_string(),
            image_urls: images,
            attachment_urls: attachments,
            content_hash: "h".to_string(),
        }
    }

    #[tokio::test]
    async fn test_content_hash_single_flight() {
        // Two URLs serving identical bytes → exactly one extraction call.
        let server = MockServer::start_async().await;
        let file_a = server
            .mock_async(|when, then| {
                when.method(GET).path("/a.png");
                then.status(200).body("SAME-BYTES");
            })
            .await;
        let file_b = server
            .mock_async(|when, then| {
                when.method(GET).path("/b.png");
                then.status(200).body("SAME-BYTES");
            })
            .await;
        let api = server
            .mock_async(|when, then| {
                when.method(POST).path("/digitize");
                then.status(200)
                    .json_body(serde_json::json!({"content": {"text": "ocr text"}}));
            })
            .await;

        let (_dir, store) = test_store().await;
        let fetcher = FileFetcher::new(5, 1, 0).unwrap();
        let extractor = extractor_for(&server);
        let processor = MultimodalProcessor::new(&fetcher, &extractor, &store);

        let post = post_with(
            vec![server.url("/a.png"), server.url("/b.png")],
            Vec::new(),
        );
        let artifacts = processor.process_post(&post).await;

        assert_eq!(artifacts.images.len(), 2);
        assert!(artifacts.failures.is_empty());
        api.assert_hits(1);
        file_a.assert_hits(1);
        file_b.assert_hits(1);

        // The second URL now has its own cache row pointing at the result.
        let aliased = store
            .extraction_by_url(&server.url("/b.png"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(aliased.text, "ocr text");
    }

    #[tokio::test]
    async fn test_url_cache_short_circuits_fetch() {
        let server = MockServer::start_async().await;
        let file = server
            .mock_async(|when, then| {
                when.method(GET).path("/img.png");
                then.status(200).body("BYTES");
            })
            .await;
        let api = server
            .mock_async(|when, then| {
                when.method(POST).path("/digitize");
                then.status(200)
                    .json_body(serde_json::json!({"content": {"text": "cached later"}}));
            })
            .await;

        let (_dir, store) = test_store().await;
        let fetcher = FileFetcher::new(5, 1, 0).unwrap();
        let extractor = extractor_for(&server);
        let processor = MultimodalProcessor::new(&fetcher, &extractor, &store);

        let post = post_with(vec![server.url("/img.png")], Vec::new());
        processor.process_post(&post).await;
        processor.process_post(&post).await;

        // Second pass hits the URL cache: no extra fetch, no extra API call.
        file.assert_hits(1);
        api.assert_hits(1);
    }

    #[tokio::test]
    async fn test_failure_recorded_and_not_retried() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/bad.png");
                then.status(200).body("BYTES");
            })
            .await;
        let api = server
            .mock_async(|when, then| {
                when.method(POST).path("/digitize");
                then.status(400).body("cannot parse");
            })
            .await;

        let (_dir, store) = test_store().await;
        let fetcher = FileFetcher::new(5, 1, 0).unwrap();
        let extractor = extractor_for(&server);
        let processor = MultimodalProcessor::new(&fetcher, &extractor, &store);

        let post = post_with(vec![server.url("/bad.png")], Vec::new());
        let first = processor.process_post(&post).await;
        assert_eq!(first.failures.len(), 1);
        api.assert_hits(1);

        // The failure entry suppresses a retry on the next run.
        let second = processor.process_post(&post).await;
        assert!(second.images.is_empty());
        api.assert_hits(1);
    }

    #[test]
    fn test_embedding_items_carry_chunk_counters() {
        let chunker = CharacterChunker::new(10, 2);
        let mut post = post_with(Vec::new(), Vec::new());
        post.body_text = "abcdefghijklmnopqrstuvwxyz".to_string();

        let artifacts = ProcessedArtifacts {
            images: vec![ArtifactText {
                url: "https://x/i.png".to_string(),
                kind: ArtifactKind::Image,
                text: "Location: Engineering Bldg 4".to_string(),
                markup: String::new(),
                type_label: "png".to_string(),
            }],
            attachments: vec![ArtifactText {
                url: "https://x/f.pdf".to_string(),
                kind: ArtifactKind::Document,
                text: "short".to_string(),
                markup: "| t |".to_string(),
                type_label: "pdf".to_string(),
            }],
            failures: Vec::new(),
        };

        let items = to_embedding_items(&post, &artifacts, &chunker, ChunkSource::OriginalPost);

        let body_items: Vec<_> = items
            .iter()
            .filter(|i| i.metadata.source == ChunkSource::OriginalPost)
            .collect();
        assert!(body_items.len() > 1);
        assert_eq!(body_items[0].metadata.total_chunks, body_items.len());
        for (i, item) in body_items.iter().enumerate() {
            assert_eq!(item.metadata.chunk_index, i);
        }

        let image_item = items
            .iter()
            .find(|i| i.metadata.source == ChunkSource::ImageOcr)
            .unwrap();
        assert!(image_item.text.starts_with("[Image"));
        assert_eq!(image_item.metadata.image_url.as_deref(), Some("https://x/i.png"));

        let attachment_item = items
            .iter()
            .find(|i| i.metadata.source == ChunkSource::DocumentParse)
            .unwrap();
        assert!(attachment_item.text.starts_with("[Attach"));
        assert_eq!(
            attachment_item.metadata.attachment_type.as_deref(),
            Some("pdf")
        );
        assert!(attachment_item.metadata.html_available);
    }

    #[test]
    fn test_empty_artifact_text_skipped() {
        let chunker = CharacterChunker::new(850, 100);
        let post = post_with(Vec::new(), Vec::new());
        let artifacts = ProcessedArtifacts {
            images: vec![ArtifactText {
                url: "u".to_string(),
                kind: ArtifactKind::Image,
                text: String::new(),
                markup: String::new(),
                type_label: String::new(),
            }],
            ..Default::default()
        };
        let items = to_embedding_items(&post, &artifacts, &chunker, ChunkSource::OriginalPost);
        assert!(items.iter().all(|i| i.metadata.source != ChunkSource::ImageOcr));
    }
}
