// Postgres-backed catalog. Every operation runs inside one transaction so
// concurrent scheduler and HTTP access never observes half a transition.

use super::{
    Broadcast, Catalog, CatalogError, HistoryPage, MAX_PAGE_LIMIT, NewBroadcast, SortOrder,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

const BROADCAST_COLUMNS: &str = "id, submitters, start, finished, title, channel_name, \
                                 channel_id, thumbnail, file_size, video_length, downloads";

pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn broadcast_from_row(row: &PgRow) -> Result<Broadcast, sqlx::Error> {
    Ok(Broadcast {
        id: row.try_get("id")?,
        submitters: row.try_get("submitters")?,
        start: row.try_get::<DateTime<Utc>, _>("start")?,
        finished: row.try_get("finished")?,
        title: row.try_get("title")?,
        channel_name: row.try_get("channel_name")?,
        channel_id: row.try_get("channel_id")?,
        thumbnail: row.try_get("thumbnail")?,
        file_size: row.try_get("file_size")?,
        video_length: row.try_get("video_length")?,
        downloads: row.try_get("downloads")?,
    })
}

fn map_insert_error(id: &str, error: sqlx::Error) -> CatalogError {
    if let Some(db_error) = error.as_database_error()
        && db_error.is_unique_violation()
    {
        return CatalogError::AlreadyExists { id: id.to_string() };
    }
    CatalogError::from(error)
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn insert_broadcast(&self, broadcast: NewBroadcast) -> Result<Broadcast, CatalogError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "insert into videos (id, submitters, start, title, channel_name, channel_id, thumbnail) \
             values ($1, $2, $3, $4, $5, $6, $7) returning {BROADCAST_COLUMNS}"
        ))
        .bind(&broadcast.id)
        .bind(vec![broadcast.submitter.clone()])
        .bind(broadcast.start)
        .bind(&broadcast.title)
        .bind(&broadcast.channel_name)
        .bind(&broadcast.channel_id)
        .bind(&broadcast.thumbnail)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_insert_error(&broadcast.id, e))?;
        tx.commit().await?;
        broadcast_from_row(&row).map_err(CatalogError::from)
    }

    async fn append_submitter(
        &self,
        id: &str,
        submitter: &str,
        new_start: DateTime<Utc>,
    ) -> Result<Broadcast, CatalogError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "update videos set \
                 submitters = case when $2 = any(submitters) then submitters \
                                   else array_append(submitters, $2) end, \
                 start = $3 \
             where id = $1 returning {BROADCAST_COLUMNS}"
        ))
        .bind(id)
        .bind(submitter)
        .bind(new_start)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CatalogError::NotFound { id: id.to_string() })?;
        tx.commit().await?;
        broadcast_from_row(&row).map_err(CatalogError::from)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Broadcast>, CatalogError> {
        let row = sqlx::query(&format!(
            "select {BROADCAST_COLUMNS} from videos where id = $1 limit 1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(broadcast_from_row)
            .transpose()
            .map_err(CatalogError::from)
    }

    async fn list_unfinished(&self) -> Result<Vec<Broadcast>, CatalogError> {
        let rows = sqlx::query(&format!(
            "select {BROADCAST_COLUMNS} from videos where finished = false order by start"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(broadcast_from_row)
            .collect::<Result<_, _>>()
            .map_err(CatalogError::from)
    }

    async fn mark_finished(
        &self,
        id: &str,
        size_bytes: i64,
        duration_seconds: i32,
    ) -> Result<Broadcast, CatalogError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "update videos set finished = true, file_size = $2, video_length = $3 \
             where id = $1 returning {BROADCAST_COLUMNS}"
        ))
        .bind(id)
        .bind(size_bytes)
        .bind(duration_seconds)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CatalogError::NotFound { id: id.to_string() })?;
        tx.commit().await?;
        broadcast_from_row(&row).map_err(CatalogError::from)
    }

    async fn delete(&self, id: &str) -> Result<(), CatalogError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("delete from videos where id = $1 and finished = false")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_all(
        &self,
        sort: SortOrder,
        page: i64,
        limit: i64,
        include_unfinished: bool,
    ) -> Result<HistoryPage, CatalogError> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let page = page.max(0);
        let order = match sort {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        };
        let where_clause = if include_unfinished {
            ""
        } else {
            "where finished = true"
        };

        let mut tx = self.pool.begin().await?;

        // Fetch one extra row to learn whether another page exists.
        let rows = sqlx::query(&format!(
            "select {BROADCAST_COLUMNS} from videos {where_clause} \
             order by start {order} limit $1 offset $2"
        ))
        .bind(limit + 1)
        .bind(page * limit)
        .fetch_all(&mut *tx)
        .await?;

        let total: i64 = sqlx::query_scalar(&format!("select count(*) from videos {where_clause}"))
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        let mut broadcasts = rows
            .iter()
            .map(broadcast_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let has_more = broadcasts.len() as i64 == limit + 1;
        if has_more {
            broadcasts.pop();
        }

        Ok(HistoryPage {
            broadcasts,
            has_more,
            total,
        })
    }

    async fn increment_downloads(&self, id: &str) -> Result<(), CatalogError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("update videos set downloads = downloads + 1 where id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound { id: id.to_string() });
        }
        Ok(())
    }
}
