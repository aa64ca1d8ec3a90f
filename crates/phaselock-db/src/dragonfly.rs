//! `Dragonfly` (Redis-compatible) blob storage for exported snapshots.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `blob:{content_id}` | Bytes | Snapshot export, addressed by BLAKE3 hex |
//! | `blob:latest` | String | Content id of the export to resume from |

use fred::prelude::*;
use tracing::debug;

use phaselock_core::blob::{BlobError, BlobStore};
use phaselock_types::ContentId;

use crate::error::DbError;

/// Key holding the resume pointer.
const LATEST_KEY: &str = "blob:latest";

fn blob_key(id: &ContentId) -> String {
    format!("blob:{id}")
}

/// Connection handle to a `Dragonfly` instance.
#[derive(Clone)]
pub struct DragonflyPool {
    client: Client,
}

impl DragonflyPool {
    /// Connect to `Dragonfly` at the given URL.
    ///
    /// The URL follows the Redis scheme: `redis://host:port` or
    /// `redis://host:port/db`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed.
    /// Returns [`DbError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!("Connected to Dragonfly");
        Ok(Self { client })
    }

    /// Return a reference to the underlying [`Client`].
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Delete every key. Only for tests.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the flush fails.
    pub async fn flush_all(&self) -> Result<(), DbError> {
        let _: () = self.client.flushall(false).await?;
        Ok(())
    }
}

/// [`BlobStore`] backed by `Dragonfly`.
///
/// Every read re-hashes the bytes, so a value overwritten outside this
/// store surfaces as [`BlobError::Corrupted`].
#[derive(Clone)]
pub struct DragonflyBlobStore {
    pool: DragonflyPool,
}

impl DragonflyBlobStore {
    /// Store blobs through `pool`.
    pub const fn new(pool: DragonflyPool) -> Self {
        Self { pool }
    }

    async fn write(&self, id: &ContentId, bytes: Vec<u8>) -> Result<(), DbError> {
        let value = Value::Bytes(bytes.into());
        let _: () = self
            .pool
            .client
            .set(blob_key(id), value, None, None, false)
            .await?;
        Ok(())
    }

    async fn read(&self, id: &ContentId) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.pool.client.get(blob_key(id)).await?)
    }

    async fn write_latest(&self, id: &ContentId) -> Result<(), DbError> {
        let _: () = self
            .pool
            .client
            .set(LATEST_KEY, id.as_str(), None, None, false)
            .await?;
        Ok(())
    }

    async fn read_latest(&self) -> Result<Option<ContentId>, DbError> {
        let value: Option<String> = self.pool.client.get(LATEST_KEY).await?;
        Ok(value.map(ContentId))
    }
}

impl BlobStore for DragonflyBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentId, BlobError> {
        let id = ContentId::of(&bytes);
        let len = bytes.len();
        self.write(&id, bytes).await?;
        debug!(blob = %id, bytes = len, "Blob stored in Dragonfly");
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, BlobError> {
        let bytes = self
            .read(id)
            .await?
            .ok_or_else(|| BlobError::NotFound { id: id.clone() })?;
        if ContentId::of(&bytes) != *id {
            return Err(BlobError::Corrupted { id: id.clone() });
        }
        Ok(bytes)
    }

    async fn record_latest(&self, id: &ContentId) -> Result<(), BlobError> {
        self.write_latest(id).await?;
        debug!(blob = %id, "Resume pointer moved");
        Ok(())
    }

    async fn latest(&self) -> Result<Option<ContentId>, BlobError> {
        Ok(self.read_latest().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let id = ContentId::of(b"snapshot");
        assert_eq!(blob_key(&id), format!("blob:{}", id.as_str()));
        assert_ne!(blob_key(&id), LATEST_KEY);
    }
}
