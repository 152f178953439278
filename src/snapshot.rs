//! The metadata snapshot: the query path's hot working set.
//!
//! In memory the snapshot is one struct per document in a contiguous
//! vector, ordered by vector id. The legacy parallel-array layout survives
//! only at the cache-blob boundary, for wire compatibility with warm
//! caches. Only the ingestion run writes the snapshot; the query path reads
//! its hydrated copy and tolerates staleness until the next refresh.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::kv::KvCache;
use crate::models::DocEntry;
use crate::vector::VectorIndexClient;

pub const SNAPSHOT_CACHE_KEY: &str = "pinecone_metadata";
const SNAPSHOT_TTL_SECS: i64 = 86_400;

/// Wire form: parallel arrays, one per field.
#[derive(Serialize, Deserialize, Default)]
struct SnapshotBlob {
    titles: Vec<String>,
    texts: Vec<String>,
    urls: Vec<String>,
    dates: Vec<String>,
    htmls: Vec<String>,
    content_types: Vec<String>,
    sources: Vec<String>,
    image_urls: Vec<String>,
    attachment_urls: Vec<String>,
    attachment_types: Vec<String>,
}

#[derive(Default)]
pub struct MetadataSnapshot {
    docs: Vec<DocEntry>,
}

impl MetadataSnapshot {
    pub fn from_docs(docs: Vec<DocEntry>) -> Self {
        Self { docs }
    }

    pub fn docs(&self) -> &[DocEntry] {
        &self.docs
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Hydrate from the cache blob, if present and fresh.
    pub async fn hydrate(kv: &KvCache) -> Result<Option<Self>> {
        let Some(raw) = kv.get(SNAPSHOT_CACHE_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<SnapshotBlob>(&raw) {
            Ok(blob) => Ok(Some(Self::from_blob(blob))),
            Err(e) => {
                tracing::warn!(error = %e, "snapshot blob unreadable; ignoring");
                Ok(None)
            }
        }
    }

    /// Rebuild the snapshot from the vector index (list + fetch) and persist
    /// it. Ordering follows ascending vector id so the BM25 corpus stays
    /// aligned.
    pub async fn refresh_from_index(vector: &VectorIndexClient, kv: &KvCache) -> Result<Self> {
        let ids = vector.list_ids().await?;
        let metadata = vector.fetch_metadata(&ids).await?;

        let mut docs = Vec::with_capacity(ids.len());
        for id in &ids {
            match metadata.get(id) {
                Some(value) => docs.push(entry_from_metadata(value)),
                None => {
                    tracing::warn!(id, "vector listed but not fetchable; skipping");
                }
            }
        }

        let snapshot = Self { docs };
        snapshot.persist(kv).await?;
        tracing::info!(docs = snapshot.len(), "metadata snapshot refreshed");
        Ok(snapshot)
    }

    /// Cached copy when fresh, otherwise a rebuild from the index.
    pub async fn load_or_refresh(kv: &KvCache, vector: &VectorIndexClient) -> Result<Self> {
        if let Some(snapshot) = Self::hydrate(kv).await? {
            tracing::info!(docs = snapshot.len(), "metadata snapshot loaded from cache");
            return Ok(snapshot);
        }
        Self::refresh_from_index(vector, kv).await
    }

    pub async fn persist(&self, kv: &KvCache) -> Result<()> {
        let raw = serde_json::to_vec(&self.to_blob())?;
        kv.setex(SNAPSHOT_CACHE_KEY, SNAPSHOT_TTL_SECS, &raw).await
    }

    /// Most recent distinct posts under a board URL prefix, newest first
    /// (by the numeric post id in the URL, falling back to date order).
    pub fn find_recent_by_prefix(&self, prefix: &str, n: usize) -> Vec<DocEntry> {
        let mut seen = std::collections::HashSet::new();
        let mut hits: Vec<&DocEntry> = Vec::new();
        for doc in &self.docs {
            if doc.url.starts_with(prefix) && seen.insert(doc.url.as_str()) {
                hits.push(doc);
            }
        }
        hits.sort_by(|a, b| {
            post_id_of(&b.url)
                .cmp(&post_id_of(&a.url))
                .then(b.date.cmp(&a.date))
        });
        hits.into_iter().take(n).cloned().collect()
    }

    fn to_blob(&self) -> SnapshotBlob {
        let mut blob = SnapshotBlob::default();
        for doc in &self.docs {
            blob.titles.push(doc.title.clone());
            blob.texts.push(doc.text.clone());
            blob.urls.push(doc.url.clone());
            blob.dates.push(doc.date.clone());
            blob.htmls.push(doc.html.clone());
            blob.content_types.push(doc.content_type.clone());
            blob.sources.push(doc.source.clone());
            blob.image_urls.push(doc.image_url.clone());
            blob.attachment_urls.push(doc.attachment_url.clone());
            blob.attachment_types.push(doc.attachment_type.clone());
        }
        blob
    }

    fn from_blob(blob: SnapshotBlob) -> Self {
        let n = blob.titles.len();
        let field = |v: &[String], i: usize| v.get(i).cloned().unwrap_or_default();

        let mut docs = Vec::with_capacity(n);
        for i in 0..n {
            docs.push(DocEntry {
                title: field(&blob.titles, i),
                text: field(&blob.texts, i),
                url: field(&blob.urls, i),
                date: field(&blob.dates, i),
                html: field(&blob.htmls, i),
                content_type: field(&blob.content_types, i),
                source: field(&blob.sources, i),
                image_url: field(&blob.image_urls, i),
                attachment_url: field(&blob.attachment_urls, i),
                attachment_type: field(&blob.attachment_types, i),
            });
        }
        Self { docs }
    }
}

/// Numeric post id embedded in a board URL, when present.
pub fn post_id_of(url: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"wr_id=(\d+)").expect("static regex"));
    re.captures(url)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Decode one vector's metadata into a snapshot entry.
pub fn entry_from_metadata(metadata: &serde_json::Value) -> DocEntry {
    let get = |key: &str| {
        metadata
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };

    let mut text = get("text_preview");
    if text.is_empty() {
        text = get("text");
    }

    DocEntry {
        title: get("title"),
        text,
        url: get("url"),
        date: get("date"),
        html: get("html"),
        content_type: get("content_type"),
        source: get("source"),
        image_url: get("image_url"),
        attachment_url: get("attachment_url"),
        attachment_type: get("attachment_type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    fn doc(title: &str, url: &str, date: &str) -> DocEntry {
        DocEntry {
            title: title.to_string(),
            url: url.to_string(),
            date: date.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_blob_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("snap.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let kv = KvCache::new(pool);

        let docs = vec![
            doc("A", "https://b/board.php?bo_table=n&wr_id=3", "2024-01-01"),
            doc("B", "https://b/board.php?bo_table=n&wr_id=4", "2024-02-01"),
        ];
        let snapshot = MetadataSnapshot::from_docs(docs.clone());
        snapshot.persist(&kv).await.unwrap();

        let loaded = MetadataSnapshot::hydrate(&kv).await.unwrap().unwrap();
        assert_eq!(loaded.docs(), docs.as_slice());
    }

    #[test]
    fn test_wire_layout_is_parallel_arrays() {
        let snapshot = MetadataSnapshot::from_docs(vec![doc("T", "u", "d")]);
        let raw = serde_json::to_value(snapshot.to_blob()).unwrap();
        assert_eq!(raw["titles"][0], "T");
        assert_eq!(raw["urls"][0], "u");
        assert!(raw["attachment_types"].is_array());
    }

    #[test]
    fn test_find_recent_by_prefix_orders_by_post_id() {
        let prefix = "https://b/board.php?bo_table=seminar";
        let docs = vec![
            doc("Old", &format!("{prefix}&wr_id=10"), "2023-01-01"),
            doc("New", &format!("{prefix}&wr_id=42"), "2024-01-01"),
            doc("Mid", &format!("{prefix}&wr_id=30"), "2023-06-01"),
            doc("Other board", "https://b/board.php?bo_table=job&wr_id=99", "2024-01-01"),
            // Same URL twice (another chunk) must not duplicate.
            doc("New", &format!("{prefix}&wr_id=42"), "2024-01-01"),
        ];
        let snapshot = MetadataSnapshot::from_docs(docs);
        let recent = snapshot.find_recent_by_prefix(prefix, 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].title, "New");
        assert_eq!(recent[1].title, "Mid");
    }

    #[test]
    fn test_entry_from_metadata_prefers_preview() {
        let metadata = serde_json::json!({
            "title": "T", "text_preview": "short", "text": "long",
            "url": "u", "date": "d", "content_type": "text", "source": "original_post"
        });
        let entry = entry_from_metadata(&metadata);
        assert_eq!(entry.text, "short");
        assert_eq!(entry.title, "T");
    }

    #[test]
    fn test_post_id_of() {
        assert_eq!(post_id_of("https://x/board.php?bo_table=n&wr_id=123"), Some(123));
        assert_eq!(post_id_of("https://x/profile"), None);
    }
}
