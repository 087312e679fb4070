//! # Blob Repository
//!
//! Durable local blob storage.
//!
//! ## Soft Delete
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   upsert ──► row visible         (deleted_at = NULL)                    │
//! │                 │                                                       │
//! │   delete(false) ▼                                                       │
//! │              row hidden          (deleted_at = now, payload kept)       │
//! │                 │                                                       │
//! │   release()     ▼                                                       │
//! │              row purged                                                 │
//! │                                                                         │
//! │   delete(true) purges immediately; upsert revives a hidden row.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use blobsync_core::{BlobRecord, ListedBlob};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::error::DbResult;

#[derive(Debug, FromRow)]
struct BlobRow {
    key: String,
    data: Vec<u8>,
    mime: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<BlobRow> for BlobRecord {
    fn from(row: BlobRow) -> Self {
        BlobRecord {
            key: row.key,
            data: row.data.into(),
            mime: row.mime,
            created_at: Some(row.created_at),
        }
    }
}

#[derive(Debug, FromRow)]
struct ListingRow {
    key: String,
    size: i64,
    mime: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<ListingRow> for ListedBlob {
    fn from(row: ListingRow) -> Self {
        ListedBlob {
            key: row.key,
            size: row.size.max(0) as u64,
            mime: row.mime,
            created_at: Some(row.created_at),
        }
    }
}

/// Repository for the `blobs` table.
#[derive(Debug, Clone)]
pub struct BlobRepository {
    pool: SqlitePool,
}

impl BlobRepository {
    /// Creates a new BlobRepository.
    pub fn new(pool: SqlitePool) -> Self {
        BlobRepository { pool }
    }

    /// Fetches a live (not soft-deleted) blob.
    pub async fn get(&self, key: &str) -> DbResult<Option<BlobRecord>> {
        let row = sqlx::query_as::<_, BlobRow>(
            r#"
            SELECT key, data, mime, created_at
            FROM blobs
            WHERE key = ?1 AND deleted_at IS NULL
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BlobRecord::from))
    }

    /// Inserts or replaces a blob, reviving it if it was soft-deleted.
    ///
    /// A record without `created_at` is stamped with the current time.
    pub async fn upsert(&self, record: &BlobRecord) -> DbResult<()> {
        let created_at = record.created_at.unwrap_or_else(Utc::now);

        debug!(key = %record.key, size = record.size(), "Storing blob");

        sqlx::query(
            r#"
            INSERT INTO blobs (key, data, mime, size, created_at, deleted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL)
            ON CONFLICT(key) DO UPDATE SET
                data = excluded.data,
                mime = excluded.mime,
                size = excluded.size,
                created_at = excluded.created_at,
                deleted_at = NULL
            "#,
        )
        .bind(&record.key)
        .bind(record.data.as_ref())
        .bind(&record.mime)
        .bind(record.size() as i64)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lists live blobs, optionally restricted to keys with an exact prefix.
    ///
    /// The prefix is compared literally; `%` and `_` have no special meaning.
    pub async fn list(&self, prefix: Option<&str>) -> DbResult<Vec<ListedBlob>> {
        let rows = sqlx::query_as::<_, ListingRow>(
            r#"
            SELECT key, size, mime, created_at
            FROM blobs
            WHERE deleted_at IS NULL
              AND (?1 IS NULL OR substr(key, 1, length(?1)) = ?1)
            ORDER BY key ASC
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ListedBlob::from).collect())
    }

    /// Deletes a blob.
    ///
    /// ## Arguments
    /// * `permanently` - `true` removes the row, `false` only hides it until
    ///   [`release`](Self::release) or a later upsert
    ///
    /// ## Returns
    /// Whether a live row was affected.
    pub async fn delete(&self, key: &str, permanently: bool) -> DbResult<bool> {
        let result = if permanently {
            sqlx::query("DELETE FROM blobs WHERE key = ?1")
                .bind(key)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query("UPDATE blobs SET deleted_at = ?2 WHERE key = ?1 AND deleted_at IS NULL")
                .bind(key)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?
        };

        debug!(key = %key, permanently, "Blob deleted");
        Ok(result.rows_affected() > 0)
    }

    /// Purges every soft-deleted blob. Returns the number of rows removed.
    pub async fn release(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM blobs WHERE deleted_at IS NOT NULL")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
