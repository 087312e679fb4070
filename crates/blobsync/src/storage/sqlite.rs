//! # SQLite Storage
//!
//! Durable local store and watermark store over `blobsync-db`.

use async_trait::async_trait;
use blobsync_core::{BlobRecord, ListedBlob, StorageError, StorageResult};
use blobsync_db::Database;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::{BlobStorage, SyncMetadataStore};
use crate::connection::ConnectionHandle;

/// Local blob store persisted in the `blobs` table.
#[derive(Debug, Clone)]
pub struct SqliteBlobStorage {
    db: Database,
    connection: ConnectionHandle,
}

impl SqliteBlobStorage {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            connection: ConnectionHandle::connected(),
        }
    }

    /// The underlying database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl BlobStorage for SqliteBlobStorage {
    fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    async fn get(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<Option<BlobRecord>> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(self.db.blobs().get(key).await?)
    }

    async fn set(&self, record: &BlobRecord, cancel: &CancellationToken) -> StorageResult<()> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(self.db.blobs().upsert(record).await?)
    }

    async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<ListedBlob>> {
        Ok(self.db.blobs().list(prefix).await?)
    }

    async fn delete(&self, key: &str, permanently: bool) -> StorageResult<()> {
        self.db.blobs().delete(key, permanently).await?;
        Ok(())
    }

    async fn release(&self) -> StorageResult<()> {
        self.db.blobs().release().await?;
        Ok(())
    }
}

#[async_trait]
impl SyncMetadataStore for Database {
    async fn get_blob_uploaded_at(
        &self,
        peer: &str,
        key: &str,
    ) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self.peer_blob_sync().get_uploaded_at(peer, key).await?)
    }

    async fn set_blob_uploaded_at(
        &self,
        peer: &str,
        key: &str,
        uploaded_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        Ok(self
            .peer_blob_sync()
            .set_uploaded_at(peer, key, uploaded_at)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobsync_db::DbConfig;

    #[tokio::test]
    async fn test_sqlite_store_behaves_like_blob_storage() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let store = SqliteBlobStorage::new(db);
        let cancel = CancellationToken::new();

        assert!(!store.is_readonly());
        assert!(store.connection().is_connected());

        store
            .set(&BlobRecord::new("a", "hello").with_mime("text/plain"), &cancel)
            .await
            .unwrap();
        let got = store.get("a", &cancel).await.unwrap().unwrap();
        assert_eq!(&got.data[..], b"hello");
        assert_eq!(got.mime.as_deref(), Some("text/plain"));

        store.delete("a", false).await.unwrap();
        assert!(store.list(None).await.unwrap().is_empty());
        store.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let store = SqliteBlobStorage::new(db);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(
            store.set(&BlobRecord::new("a", "x"), &cancel).await,
            Err(StorageError::Cancelled)
        );
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_database_as_metadata_store() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let at = Utc::now();

        db.set_blob_uploaded_at("cloud", "k", Some(at)).await.unwrap();
        let stored = db.get_blob_uploaded_at("cloud", "k").await.unwrap().unwrap();
        assert_eq!(stored.timestamp_micros(), at.timestamp_micros());

        db.set_blob_uploaded_at("cloud", "k", None).await.unwrap();
        assert_eq!(db.get_blob_uploaded_at("cloud", "k").await.unwrap(), None);
    }
}
