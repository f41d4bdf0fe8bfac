// In-memory catalog with the same transition semantics as the Postgres
// implementation. Backs tests and local runs without a database.

use super::{
    Broadcast, Catalog, CatalogError, HistoryPage, MAX_PAGE_LIMIT, NewBroadcast, SortOrder,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    rows: Mutex<HashMap<String, Broadcast>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn insert_broadcast(&self, broadcast: NewBroadcast) -> Result<Broadcast, CatalogError> {
        let mut rows = self.rows.lock();
        if rows.contains_key(&broadcast.id) {
            return Err(CatalogError::AlreadyExists { id: broadcast.id });
        }
        let row = Broadcast {
            id: broadcast.id.clone(),
            submitters: vec![broadcast.submitter],
            start: broadcast.start,
            finished: false,
            title: broadcast.title,
            channel_name: broadcast.channel_name,
            channel_id: broadcast.channel_id,
            thumbnail: broadcast.thumbnail,
            file_size: None,
            video_length: None,
            downloads: 0,
        };
        rows.insert(broadcast.id, row.clone());
        Ok(row)
    }

    async fn append_submitter(
        &self,
        id: &str,
        submitter: &str,
        new_start: DateTime<Utc>,
    ) -> Result<Broadcast, CatalogError> {
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(id)
            .ok_or_else(|| CatalogError::NotFound { id: id.to_string() })?;
        if !row.submitters.iter().any(|s| s == submitter) {
            row.submitters.push(submitter.to_string());
        }
        row.start = new_start;
        Ok(row.clone())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Broadcast>, CatalogError> {
        Ok(self.rows.lock().get(id).cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<Broadcast>, CatalogError> {
        let rows = self.rows.lock();
        let mut unfinished: Vec<_> = rows.values().filter(|b| !b.finished).cloned().collect();
        unfinished.sort_by_key(|b| b.start);
        Ok(unfinished)
    }

    async fn mark_finished(
        &self,
        id: &str,
        size_bytes: i64,
        duration_seconds: i32,
    ) -> Result<Broadcast, CatalogError> {
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(id)
            .ok_or_else(|| CatalogError::NotFound { id: id.to_string() })?;
        row.finished = true;
        row.file_size = Some(size_bytes);
        row.video_length = Some(duration_seconds);
        Ok(row.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), CatalogError> {
        let mut rows = self.rows.lock();
        if rows.get(id).is_some_and(|row| !row.finished) {
            rows.remove(id);
        }
        Ok(())
    }

    async fn list_all(
        &self,
        sort: SortOrder,
        page: i64,
        limit: i64,
        include_unfinished: bool,
    ) -> Result<HistoryPage, CatalogError> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT) as usize;
        let page = page.max(0) as usize;

        let rows = self.rows.lock();
        let mut all: Vec<_> = rows
            .values()
            .filter(|b| include_unfinished || b.finished)
            .cloned()
            .collect();
        all.sort_by_key(|b| b.start);
        if sort == SortOrder::Descending {
            all.reverse();
        }

        let total = all.len() as i64;
        let offset = page * limit;
        let broadcasts: Vec<_> = all.into_iter().skip(offset).take(limit + 1).collect();
        let has_more = broadcasts.len() == limit + 1;
        let broadcasts = if has_more {
            broadcasts[..limit].to_vec()
        } else {
            broadcasts
        };

        Ok(HistoryPage {
            broadcasts,
            has_more,
            total,
        })
    }

    async fn increment_downloads(&self, id: &str) -> Result<(), CatalogError> {
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(id)
            .ok_or_else(|| CatalogError::NotFound { id: id.to_string() })?;
        row.downloads += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_broadcast(id: &str, submitter: &str) -> NewBroadcast {
        NewBroadcast {
            id: id.to_string(),
            submitter: submitter.to_string(),
            start: Utc::now(),
            title: "title".to_string(),
            channel_name: "channel".to_string(),
            channel_id: "chan-id".to_string(),
            thumbnail: String::new(),
        }
    }

    #[tokio::test]
    async fn append_submitter_deduplicates() {
        let catalog = MemoryCatalog::new();
        let row = catalog.insert_broadcast(new_broadcast("abc", "u1")).await.unwrap();

        let row2 = catalog
            .append_submitter("abc", "u2", row.start)
            .await
            .unwrap();
        assert_eq!(row2.submitters, vec!["u1", "u2"]);

        let row3 = catalog
            .append_submitter("abc", "u2", row.start)
            .await
            .unwrap();
        assert_eq!(row3.submitters, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn double_insert_is_a_conflict() {
        let catalog = MemoryCatalog::new();
        catalog.insert_broadcast(new_broadcast("abc", "u1")).await.unwrap();
        assert!(matches!(
            catalog.insert_broadcast(new_broadcast("abc", "u2")).await,
            Err(CatalogError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn mark_finished_sets_terminal_fields() {
        let catalog = MemoryCatalog::new();
        catalog.insert_broadcast(new_broadcast("abc", "u1")).await.unwrap();
        let row = catalog.mark_finished("abc", 1024, 90).await.unwrap();
        assert!(row.finished);
        assert_eq!(row.file_size, Some(1024));
        assert_eq!(row.video_length, Some(90));
    }

    #[tokio::test]
    async fn delete_spares_finished_rows() {
        let catalog = MemoryCatalog::new();
        catalog.insert_broadcast(new_broadcast("abc", "u1")).await.unwrap();
        catalog.mark_finished("abc", 1, 1).await.unwrap();
        catalog.delete("abc").await.unwrap();
        assert!(catalog.find_by_id("abc").await.unwrap().is_some());

        catalog.insert_broadcast(new_broadcast("xyz", "u1")).await.unwrap();
        catalog.delete("xyz").await.unwrap();
        assert!(catalog.find_by_id("xyz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_all_paginates_with_has_more() {
        let catalog = MemoryCatalog::new();
        for i in 0..5 {
            let mut b = new_broadcast(&format!("b{i}"), "u1");
            b.start = Utc::now() + chrono::Duration::seconds(i);
            catalog.insert_broadcast(b).await.unwrap();
            catalog.mark_finished(&format!("b{i}"), 1, 1).await.unwrap();
        }

        let page = catalog
            .list_all(SortOrder::Ascending, 0, 2, false)
            .await
            .unwrap();
        assert_eq!(page.broadcasts.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.total, 5);
        assert_eq!(page.broadcasts[0].id, "b0");

        let last = catalog
            .list_all(SortOrder::Ascending, 2, 2, false)
            .await
            .unwrap();
        assert_eq!(last.broadcasts.len(), 1);
        assert!(!last.has_more);

        let newest_first = catalog
            .list_all(SortOrder::Descending, 0, 2, false)
            .await
            .unwrap();
        assert_eq!(newest_first.broadcasts[0].id, "b4");
    }

    #[tokio::test]
    async fn download_counter_increments() {
        let catalog = MemoryCatalog::new();
        catalog.insert_broadcast(new_broadcast("abc", "u1")).await.unwrap();
        catalog.increment_downloads("abc").await.unwrap();
        catalog.increment_downloads("abc").await.unwrap();
        let row = catalog.find_by_id("abc").await.unwrap().unwrap();
        assert_eq!(row.downloads, 2);

        assert!(matches!(
            catalog.increment_downloads("missing").await,
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unfinished_rows_are_hidden_unless_requested() {
        let catalog = MemoryCatalog::new();
        catalog.insert_broadcast(new_broadcast("abc", "u1")).await.unwrap();

        let hidden = catalog
            .list_all(SortOrder::Ascending, 0, 10, false)
            .await
            .unwrap();
        assert!(hidden.broadcasts.is_empty());

        let shown = catalog
            .list_all(SortOrder::Ascending, 0, 10, true)
            .await
            .unwrap();
        assert_eq!(shown.broadcasts.len(), 1);
    }
}
