//! Catalog of broadcasts and their lifecycle fields.
//!
//! Every lifecycle transition is a single transaction; partial state from a
//! failed capture is never visible. The production implementation is
//! Postgres; the in-memory one backs tests.

pub mod memory;
pub mod postgres;

pub use memory::MemoryCatalog;
pub use postgres::PgCatalog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One archived (or in-flight) broadcast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Broadcast {
    pub id: String,
    pub submitters: Vec<String>,
    pub start: DateTime<Utc>,
    pub finished: bool,
    pub title: String,
    pub channel_name: String,
    pub channel_id: String,
    pub thumbnail: String,
    /// Archived size in bytes; unknown until the capture finishes.
    pub file_size: Option<i64>,
    /// Duration in seconds; unknown until the capture finishes.
    pub video_length: Option<i32>,
    pub downloads: i64,
}

#[derive(Debug, Clone)]
pub struct NewBroadcast {
    pub id: String,
    pub submitter: String,
    pub start: DateTime<Utc>,
    pub title: String,
    pub channel_name: String,
    pub channel_id: String,
    pub thumbnail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub broadcasts: Vec<Broadcast>,
    pub has_more: bool,
    pub total: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("broadcast not found: {id}")]
    NotFound { id: String },

    #[error("broadcast already exists: {id}")]
    AlreadyExists { id: String },

    #[error("database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },
}

/// Upper bound on the history page size; user-supplied limits are clamped.
pub const MAX_PAGE_LIMIT: i64 = 100;

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn insert_broadcast(&self, broadcast: NewBroadcast) -> Result<Broadcast, CatalogError>;

    /// Adds a submitter to an existing broadcast and refreshes its start.
    /// Idempotent: a submitter is never recorded twice.
    async fn append_submitter(
        &self,
        id: &str,
        submitter: &str,
        new_start: DateTime<Utc>,
    ) -> Result<Broadcast, CatalogError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Broadcast>, CatalogError>;

    async fn list_unfinished(&self) -> Result<Vec<Broadcast>, CatalogError>;

    async fn mark_finished(
        &self,
        id: &str,
        size_bytes: i64,
        duration_seconds: i32,
    ) -> Result<Broadcast, CatalogError>;

    /// Removes an unfinished broadcast. Finished rows are never deleted.
    async fn delete(&self, id: &str) -> Result<(), CatalogError>;

    async fn list_all(
        &self,
        sort: SortOrder,
        page: i64,
        limit: i64,
        include_unfinished: bool,
    ) -> Result<HistoryPage, CatalogError>;

    async fn increment_downloads(&self, id: &str) -> Result<(), CatalogError>;
}
