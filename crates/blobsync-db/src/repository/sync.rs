//! # Peer Blob Sync Repository
//!
//! Stores the upload watermark: for each `(peer, blob)` pair, the time the
//! blob was last confirmed present on that peer.
//!
//! ## Watermark Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   (no row)  ──── upload starts ────►  uploaded_at = NULL                │
//! │                                             │                           │
//! │                             remote.set() ok │                           │
//! │                                             ▼                           │
//! │                                       uploaded_at = now                 │
//! │                                                                         │
//! │   Reconciliation uploads every blob whose watermark is missing or NULL, │
//! │   so an interrupted upload is retried on the next pass.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

/// Repository for the `peer_blob_sync` table.
#[derive(Debug, Clone)]
pub struct PeerBlobSyncRepository {
    pool: SqlitePool,
}

impl PeerBlobSyncRepository {
    /// Creates a new PeerBlobSyncRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PeerBlobSyncRepository { pool }
    }

    /// Returns the watermark, or `None` when missing or cleared.
    pub async fn get_uploaded_at(
        &self,
        peer: &str,
        blob_id: &str,
    ) -> DbResult<Option<DateTime<Utc>>> {
        let uploaded_at = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT uploaded_at FROM peer_blob_sync WHERE peer = ?1 AND blob_id = ?2",
        )
        .bind(peer)
        .bind(blob_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(uploaded_at.flatten())
    }

    /// Sets (or clears, with `None`) the watermark.
    pub async fn set_uploaded_at(
        &self,
        peer: &str,
        blob_id: &str,
        uploaded_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        debug!(peer = %peer, blob_id = %blob_id, ?uploaded_at, "Updating upload watermark");

        sqlx::query(
            r#"
            INSERT INTO peer_blob_sync (peer, blob_id, uploaded_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(peer, blob_id) DO UPDATE SET uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(peer)
        .bind(blob_id)
        .bind(uploaded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lists every blob confirmed on `peer`, oldest confirmation first.
    pub async fn list_uploaded(&self, peer: &str) -> DbResult<Vec<(String, DateTime<Utc>)>> {
        let rows = sqlx::query_as::<_, (String, DateTime<Utc>)>(
            r#"
            SELECT blob_id, uploaded_at
            FROM peer_blob_sync
            WHERE peer = ?1 AND uploaded_at IS NOT NULL
            ORDER BY uploaded_at ASC, blob_id ASC
            "#,
        )
        .bind(peer)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Forgets every watermark of a peer. Returns the number of rows removed.
    pub async fn clear_peer(&self, peer: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM peer_blob_sync WHERE peer = ?1")
            .bind(peer)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_watermark_roundtrip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.peer_blob_sync();
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        assert_eq!(repo.get_uploaded_at("cloud", "a").await.unwrap(), None);

        repo.set_uploaded_at("cloud", "a", Some(at)).await.unwrap();
        assert_eq!(repo.get_uploaded_at("cloud", "a").await.unwrap(), Some(at));

        // Watermarks are per peer
        assert_eq!(repo.get_uploaded_at("mirror", "a").await.unwrap(), None);

        repo.set_uploaded_at("cloud", "a", None).await.unwrap();
        assert_eq!(repo.get_uploaded_at("cloud", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_and_clear_peer() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.peer_blob_sync();
        let first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        repo.set_uploaded_at("cloud", "b", Some(second)).await.unwrap();
        repo.set_uploaded_at("cloud", "a", Some(first)).await.unwrap();
        repo.set_uploaded_at("cloud", "pending", None).await.unwrap();
        repo.set_uploaded_at("mirror", "a", Some(first)).await.unwrap();

        let uploaded = repo.list_uploaded("cloud").await.unwrap();
        assert_eq!(
            uploaded,
            vec![("a".to_string(), first), ("b".to_string(), second)]
        );

        assert_eq!(repo.clear_peer("cloud").await.unwrap(), 3);
        assert!(repo.list_uploaded("cloud").await.unwrap().is_empty());
        assert_eq!(repo.list_uploaded("mirror").await.unwrap().len(), 1);
    }
}
