//! Content-addressed blob storage for exported snapshots.
//!
//! Blobs are addressed by the lowercase hex of their BLAKE3 hash. Writing
//! the same bytes twice yields the same [`ContentId`] and stores one copy.
//!
//! Each store also keeps a pointer to the export a restarting node should
//! resume from. Writing a blob never moves it; only
//! [`BlobStore::record_latest`] does.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use phaselock_types::ContentId;

/// Errors returned by blob stores.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// No blob is stored under this id.
    #[error("blob {id} not found")]
    NotFound {
        /// The requested id.
        id: ContentId,
    },

    /// The stored bytes no longer hash to their id.
    #[error("blob {id} is corrupted")]
    Corrupted {
        /// The damaged blob.
        id: ContentId,
    },

    /// The backend could not be reached or refused the call.
    #[error("blob backend unavailable: {reason}")]
    Unavailable {
        /// What went wrong.
        reason: String,
    },

    /// A filesystem operation failed.
    #[error("blob I/O error at {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
}

impl BlobError {
    /// Whether retrying the same call might succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Io { .. })
    }
}

/// Durable, content-addressed byte storage.
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return their content id.
    fn put(&self, bytes: Vec<u8>) -> impl Future<Output = Result<ContentId, BlobError>> + Send;

    /// Fetch the bytes stored under `id`.
    fn get(&self, id: &ContentId) -> impl Future<Output = Result<Vec<u8>, BlobError>> + Send;

    /// Point the resume pointer at `id`.
    fn record_latest(&self, id: &ContentId) -> impl Future<Output = Result<(), BlobError>> + Send;

    /// The blob the resume pointer names, if one was recorded.
    fn latest(&self) -> impl Future<Output = Result<Option<ContentId>, BlobError>> + Send;
}

impl<T: BlobStore> BlobStore for Arc<T> {
    fn put(&self, bytes: Vec<u8>) -> impl Future<Output = Result<ContentId, BlobError>> + Send {
        T::put(self, bytes)
    }

    fn get(&self, id: &ContentId) -> impl Future<Output = Result<Vec<u8>, BlobError>> + Send {
        T::get(self, id)
    }

    fn record_latest(&self, id: &ContentId) -> impl Future<Output = Result<(), BlobError>> + Send {
        T::record_latest(self, id)
    }

    fn latest(&self) -> impl Future<Output = Result<Option<ContentId>, BlobError>> + Send {
        T::latest(self)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Blob store held in process memory, with failure injection for tests.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<ContentId, Vec<u8>>>,
    latest: RwLock<Option<ContentId>>,
    pending_failures: AtomicU32,
}

impl InMemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with [`BlobError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// Whether nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentId, BlobError> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BlobError::Unavailable {
                reason: String::from("injected failure"),
            });
        }
        let id = ContentId::of(&bytes);
        self.blobs.write().await.entry(id.clone()).or_insert(bytes);
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BlobError::NotFound { id: id.clone() })
    }

    async fn record_latest(&self, id: &ContentId) -> Result<(), BlobError> {
        *self.latest.write().await = Some(id.clone());
        Ok(())
    }

    async fn latest(&self) -> Result<Option<ContentId>, BlobError> {
        Ok(self.latest.read().await.clone())
    }
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// File under the store root naming the resume export.
const LATEST_FILE: &str = "LATEST";

/// Blob store over a directory: `<root>/<id[..2]>/<id>`, plus a `LATEST`
/// pointer file at the root.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Use `root` as the store directory. It is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &ContentId) -> PathBuf {
        let fan_out = id.as_str().get(..2).unwrap_or("00");
        self.root.join(fan_out).join(id.as_str())
    }

    fn latest_path(&self) -> PathBuf {
        self.root.join(LATEST_FILE)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> BlobError {
    BlobError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentId, BlobError> {
        let id = ContentId::of(&bytes);
        let path = self.path_for(&id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(id);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        // Stage then rename: readers never observe a partial blob.
        let staging = path.with_extension("partial");
        tokio::fs::write(&staging, &bytes)
            .await
            .map_err(|e| io_error(&staging, e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| io_error(&path, e))?;
        debug!(blob = %id, bytes = bytes.len(), "Blob written");
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound { id: id.clone() });
            }
            Err(e) => return Err(io_error(&path, e)),
        };
        if ContentId::of(&bytes) != *id {
            return Err(BlobError::Corrupted { id: id.clone() });
        }
        Ok(bytes)
    }

    async fn record_latest(&self, id: &ContentId) -> Result<(), BlobError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;
        let path = self.latest_path();
        let staging = path.with_extension("partial");
        tokio::fs::write(&staging, id.as_str())
            .await
            .map_err(|e| io_error(&staging, e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| io_error(&path, e))
    }

    async fn latest(&self) -> Result<Option<ContentId>, BlobError> {
        let path = self.latest_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(ContentId::from(text.trim()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_round_trip_and_dedupe() {
        let store = InMemoryBlobStore::new();
        let a = store.put(b"snapshot".to_vec()).await.unwrap();
        let b = store.put(b"snapshot".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&a).await.unwrap(), b"snapshot");
    }

    #[tokio::test]
    async fn memory_missing_blob() {
        let store = InMemoryBlobStore::new();
        let missing = ContentId::of(b"nothing");
        assert!(matches!(
            store.get(&missing).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn memory_failure_injection() {
        let store = InMemoryBlobStore::new();
        store.fail_next(1);
        let err = store.put(vec![1, 2, 3]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.put(vec![1, 2, 3]).await.is_ok());
    }

    #[tokio::test]
    async fn fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let id = store.put(b"lattice".to_vec()).await.unwrap();
        assert_eq!(id, ContentId::of(b"lattice"));
        assert_eq!(store.get(&id).await.unwrap(), b"lattice");
        // Second write of the same content is a no-op.
        assert_eq!(store.put(b"lattice".to_vec()).await.unwrap(), id);
    }

    #[tokio::test]
    async fn fs_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let id = store.put(b"lattice".to_vec()).await.unwrap();
        tokio::fs::write(store.path_for(&id), b"tampered").await.unwrap();
        assert!(matches!(
            store.get(&id).await,
            Err(BlobError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn writes_leave_latest_pointer_alone() {
        let store = InMemoryBlobStore::new();
        let first = store.put(b"first".to_vec()).await.unwrap();
        store.record_latest(&first).await.unwrap();
        store.put(b"second".to_vec()).await.unwrap();
        assert_eq!(store.latest().await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn fs_latest_pointer_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert_eq!(store.latest().await.unwrap(), None);
        let id = store.put(b"lattice".to_vec()).await.unwrap();
        store.record_latest(&id).await.unwrap();

        let reopened = FsBlobStore::new(dir.path());
        assert_eq!(reopened.latest().await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn fs_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(
            store.get(&ContentId::of(b"absent")).await,
            Err(BlobError::NotFound { .. })
        ));
    }
}
