//! Ingestion pipeline orchestration.
//!
//! Coordinates a full crawl: state → crawler → dedup → chunking →
//! multimodal extraction → embedding upload → state update → snapshot
//! refresh. One post's failure never aborts a run; the per-board
//! high-watermark only advances after every vector of the batch has been
//! accepted by the index.

use anyhow::Result;
use serde_json::json;

use crate::chunk::CharacterChunker;
use crate::crawler::BoardCrawler;
use crate::crawler_directory::DirectoryCrawler;
use crate::embedding::EmbeddingClient;
use crate::gateway::Gateway;
use crate::models::{
    BoardKind, BoardReport, ChunkSource, EmbeddingItem, IngestReport, Post, PostOutcome,
};
use crate::multimodal::{self, MultimodalProcessor};
use crate::snapshot::MetadataSnapshot;
use crate::state::CrawlStateManager;
use crate::vector::{PointInsert, VectorIndexClient};
use crate::{bm25, models::NO_CONTENT};

/// Run ingestion for every board (or a single one).
pub async fn run_crawl(gateway: &Gateway, board: Option<BoardKind>) -> Result<IngestReport> {
    let boards: Vec<BoardKind> = match board {
        Some(kind) => vec![kind],
        None => BoardKind::all().to_vec(),
    };

    let chunker = CharacterChunker::new(
        gateway.config.chunking.chunk_size,
        gateway.config.chunking.chunk_overlap,
    );
    let processor = MultimodalProcessor::new(&gateway.fetcher, &gateway.extractor, &gateway.store);
    let state = CrawlStateManager::new(&gateway.store, gateway.clock);

    let mut report = IngestReport::default();

    for kind in boards {
        let board_report = if kind.is_directory() {
            crawl_directory_board(gateway, &processor, &chunker, kind).await?
        } else {
            crawl_id_board(gateway, &processor, &state, &chunker, kind).await?
        };
        report.vectors_upserted += board_report.items;
        report.boards.push(board_report);
    }

    // Refresh the hot working set and invalidate the lexical cache so the
    // next query engine build picks up the new corpus.
    if report.vectors_upserted > 0 {
        MetadataSnapshot::refresh_from_index(&gateway.vector, &gateway.kv).await?;
        gateway.kv.delete(bm25::BM25_CACHE_KEY).await?;
    }

    print_report(&report);
    Ok(report)
}

async fn crawl_id_board(
    gateway: &Gateway,
    processor: &MultimodalProcessor<'_>,
    state: &CrawlStateManager<'_>,
    chunker: &CharacterChunker,
    kind: BoardKind,
) -> Result<BoardReport> {
    let mut report = BoardReport {
        board: kind.to_string(),
        ..Default::default()
    };

    let crawler = BoardCrawler::new(kind, &gateway.config, gateway.clock)?;
    let Some(latest_id) = crawler.latest_id().await else {
        tracing::error!(board = %kind, "latest id discovery failed");
        return Ok(report);
    };

    let range = state
        .get_crawl_range(
            kind,
            latest_id,
            gateway.config.boards.floor_for(kind),
            gateway.config.boards.first_crawl_window,
        )
        .await?;

    let mut urls = crawler.enumerate(&range);
    if kind == BoardKind::Notice {
        for id in &gateway.config.boards.additional_notice_ids {
            urls.push(crawler.post_url(*id));
        }
    }

    if urls.is_empty() {
        println!("crawl {}: up to date (latest id {})", kind, latest_id);
        return Ok(report);
    }

    let posts = crawler.crawl_many(&urls).await;
    report.crawled = posts.len();

    let items = process_posts(gateway, processor, chunker, &posts, &mut report).await?;
    report.items = items.len();

    if !items.is_empty() {
        upload_items(&gateway.embeddings, &gateway.vector, &items).await?;
    }

    // The watermark moves only after the whole batch is in the index.
    state
        .update_last_processed_id(kind, latest_id, report.new_posts as i64)
        .await?;

    Ok(report)
}

async fn crawl_directory_board(
    gateway: &Gateway,
    processor: &MultimodalProcessor<'_>,
    chunker: &CharacterChunker,
    kind: BoardKind,
) -> Result<BoardReport> {
    let mut report = BoardReport {
        board: kind.to_string(),
        ..Default::default()
    };

    let crawler = DirectoryCrawler::new(kind, &gateway.config, gateway.clock)?;
    let posts = crawler.crawl_all().await;
    report.crawled = posts.len();

    let items = process_posts(gateway, processor, chunker, &posts, &mut report).await?;
    report.items = items.len();

    if !items.is_empty() {
        upload_items(&gateway.embeddings, &gateway.vector, &items).await?;
    }

    Ok(report)
}

/// Dedup, extract, and collect embedding items for a batch of posts.
async fn process_posts(
    gateway: &Gateway,
    processor: &MultimodalProcessor<'_>,
    chunker: &CharacterChunker,
    posts: &[Post],
    report: &mut BoardReport,
) -> Result<Vec<EmbeddingItem>> {
    let mut items = Vec::new();

    for post in posts {
        match ingest_one(
            gateway,
            processor,
            chunker,
            post,
            &mut items,
            &mut report.artifact_warnings,
        )
        .await
        {
            PostOutcome::Ok { items: count } => {
                report.new_posts += 1;
                tracing::info!(title = %post.title, items = count, "post ingested");
            }
            PostOutcome::Skipped(reason) => {
                report.skipped += 1;
                tracing::debug!(title = %post.title, reason, "post skipped");
            }
            PostOutcome::Failed { kind, detail } => {
                report.failed += 1;
                tracing::warn!(title = %post.title, kind, detail, "post failed; queued for re-run");
            }
        }
    }

    Ok(items)
}

async fn ingest_one(
    gateway: &Gateway,
    processor: &MultimodalProcessor<'_>,
    chunker: &CharacterChunker,
    post: &Post,
    items: &mut Vec<EmbeddingItem>,
    warnings: &mut Vec<String>,
) -> PostOutcome {
    // Dedup on (title, content hash): unchanged posts are skipped, edited
    // posts fall through and re-ingest.
    match gateway
        .store
        .is_post_processed(&post.title, &post.content_hash)
        .await
    {
        Ok(true) => return PostOutcome::Skipped("already ingested".to_string()),
        Ok(false) => {}
        Err(e) => {
            return PostOutcome::Failed {
                kind: "store".to_string(),
                detail: e.to_string(),
            }
        }
    }

    let artifacts = processor.process_post(post).await;

    let artifact_total = post.image_urls.len() + post.attachment_urls.len();
    if artifact_total > 0 && artifacts.succeeded() == 0 {
        // Critical multimodal failure: every artefact of the post failed.
        // Leave it unmarked so a later run reprocesses it.
        return PostOutcome::Failed {
            kind: "multimodal".to_string(),
            detail: artifacts.failures.join("; "),
        };
    }

    let body_source = if post.board_type.is_directory() {
        ChunkSource::ProfessorInfo
    } else {
        ChunkSource::OriginalPost
    };
    let mut post_items = multimodal::to_embedding_items(post, &artifacts, chunker, body_source);

    // Posts with neither body nor artefacts still get a placeholder record
    // so the title remains findable.
    if post_items.is_empty() {
        post_items.push(EmbeddingItem {
            text: NO_CONTENT.to_string(),
            metadata: crate::models::ItemMetadata::for_body(
                &post.title,
                &post.canonical_url,
                &post.date,
                body_source,
            ),
        });
    }

    let produced = post_items.len();
    items.append(&mut post_items);

    for failure in &artifacts.failures {
        tracing::warn!(title = %post.title, failure, "artefact failed; post ingested without it");
        warnings.push(format!("{}: {}", post.title, failure));
    }

    if let Err(e) = gateway
        .store
        .mark_post_processed(
            &post.title,
            &post.image_urls,
            &post.content_hash,
            post.board_type,
            &post.date,
        )
        .await
    {
        return PostOutcome::Failed {
            kind: "store".to_string(),
            detail: e.to_string(),
        };
    }

    PostOutcome::Ok { items: produced }
}

/// Embed a batch of items and upsert them with sequential ids.
///
/// Ids start at the index's current total, so `min(new) == previous_total`
/// and `max(new) == previous_total + count − 1`. Metadata stores a ≤200-char
/// preview of the text; the full text lives in the document store.
pub async fn upload_items(
    embeddings: &EmbeddingClient,
    vector: &VectorIndexClient,
    items: &[EmbeddingItem],
) -> Result<(u64, usize)> {
    if items.is_empty() {
        return Ok((0, 0));
    }

    let texts: Vec<String> = items.iter().map(|i| i.text.clone()).collect();
    let vectors = embeddings.embed_documents(&texts).await?;
    let start_id = vector.total_vector_count().await?;

    let points: Vec<PointInsert> = items
        .iter()
        .zip(vectors.into_iter())
        .enumerate()
        .map(|(offset, (item, vec))| PointInsert {
            id: start_id + offset as u64,
            vector: vec,
            metadata: item_metadata_json(item),
        })
        .collect();

    let written = vector.upsert(&points).await?;
    println!("upload: {} vectors, ids {}..{}", written, start_id, start_id + written as u64 - 1);
    Ok((start_id, written))
}

fn item_metadata_json(item: &EmbeddingItem) -> serde_json::Value {
    let meta = &item.metadata;
    let preview: String = if item.text.chars().count() > 200 {
        let head: String = item.text.chars().take(200).collect();
        format!("{}...", head)
    } else {
        item.text.clone()
    };

    let mut value = json!({
        "title": meta.title,
        "url": meta.url,
        "date": meta.date,
        "content_type": meta.content_type.as_str(),
        "source": meta.source.as_str(),
        "chunk_index": meta.chunk_index,
        "total_chunks": meta.total_chunks,
        "html": meta.html,
        "html_available": meta.html_available,
        "text_preview": preview,
    });

    let object = value.as_object_mut().expect("metadata is an object");
    if let Some(image_url) = &meta.image_url {
        object.insert("image_url".to_string(), json!(image_url));
    }
    if let Some(attachment_url) = &meta.attachment_url {
        object.insert("attachment_url".to_string(), json!(attachment_url));
    }
    if let Some(attachment_type) = &meta.attachment_type {
        object.insert("attachment_type".to_string(), json!(attachment_type));
    }
    value
}

fn print_report(report: &IngestReport) {
    println!("\ningestion report");
    for board in &report.boards {
        println!(
            "  {}: crawled {}, new {}, skipped {}, failed {}, items {}",
            board.board, board.crawled, board.new_posts, board.skipped, board.failed, board.items
        );
        for warning in &board.artifact_warnings {
            println!("    warning: {}", warning);
        }
    }
    println!("  vectors upserted: {}", report.vectors_upserted);
    println!("ok");
}
