//! Incremental crawl-state management.
//!
//! Tracks the last processed post id per board and computes the descending
//! id range a crawl should visit: everything above the high-watermark, or a
//! bounded backfill (down to the configured floor, or a fixed window) on
//! the first run. An incomplete batch must not advance the watermark, so
//! the update happens only after the batch's vectors are accepted.

use anyhow::Result;

use crate::clock::Clock;
use crate::models::BoardKind;
use crate::store::DocumentStore;

pub struct CrawlStateManager<'a> {
    store: &'a DocumentStore,
    clock: Clock,
}

impl<'a> CrawlStateManager<'a> {
    pub fn new(store: &'a DocumentStore, clock: Clock) -> Self {
        Self { store, clock }
    }

    pub async fn get_last_processed_id(&self, board: BoardKind) -> Result<Option<u32>> {
        self.store.get_last_processed_id(board).await
    }

    pub async fn update_last_processed_id(
        &self,
        board: BoardKind,
        last_id: u32,
        processed_count: i64,
    ) -> Result<()> {
        self.store
            .update_last_processed_id(board, last_id, processed_count, &self.clock.now_iso())
            .await
    }

    /// Ids to crawl, descending from `current_max_id`. Inclusive on the
    /// high end; already-processed ids are excluded.
    pub async fn get_crawl_range(
        &self,
        board: BoardKind,
        current_max_id: u32,
        floor: Option<u32>,
        first_crawl_window: u32,
    ) -> Result<Vec<u32>> {
        let last = self.get_last_processed_id(board).await?;
        Ok(compute_range(current_max_id, last, floor, first_crawl_window))
    }
}

pub fn compute_range(
    current_max_id: u32,
    last_processed: Option<u32>,
    floor: Option<u32>,
    first_crawl_window: u32,
) -> Vec<u32> {
    match last_processed {
        None => {
            let low = match floor {
                Some(floor) => floor,
                None => current_max_id.saturating_sub(first_crawl_window).max(1),
            };
            if low > current_max_id {
                return Vec::new();
            }
            (low..=current_max_id).rev().collect()
        }
        Some(last) if current_max_id > last => ((last + 1)..=current_max_id).rev().collect(),
        Some(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    #[test]
    fn test_first_crawl_reaches_floor() {
        let range = compute_range(100, None, Some(95), 100);
        assert_eq!(range, vec![100, 99, 98, 97, 96, 95]);
    }

    #[test]
    fn test_first_crawl_without_floor_uses_window() {
        let range = compute_range(50, None, None, 10);
        assert_eq!(range.first(), Some(&50));
        assert_eq!(range.last(), Some(&40));
        assert_eq!(range.len(), 11);
    }

    #[test]
    fn test_incremental_range_excludes_processed() {
        let range = compute_range(105, Some(100), Some(1), 100);
        assert_eq!(range, vec![105, 104, 103, 102, 101]);
    }

    #[test]
    fn test_no_new_posts_empty_range() {
        assert!(compute_range(100, Some(100), None, 100).is_empty());
        assert!(compute_range(99, Some(100), None, 100).is_empty());
    }

    #[test]
    fn test_floor_above_max_is_empty() {
        assert!(compute_range(10, None, Some(20), 100).is_empty());
    }

    #[tokio::test]
    async fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("state.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let store = DocumentStore::new(pool);
        let manager = CrawlStateManager::new(&store, Clock::new(9));

        let range = manager
            .get_crawl_range(BoardKind::Seminar, 250, Some(246), 100)
            .await
            .unwrap();
        assert_eq!(range, vec![250, 249, 248, 247, 246]);

        manager
            .update_last_processed_id(BoardKind::Seminar, 250, 5)
            .await
            .unwrap();
        let incremental = manager
            .get_crawl_range(BoardKind::Seminar, 252, Some(246), 100)
            .await
            .unwrap();
        assert_eq!(incremental, vec![252, 251]);
    }
}
