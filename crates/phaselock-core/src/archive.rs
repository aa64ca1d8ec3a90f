//! Pushes exported snapshots to a blob store.
//!
//! A new export gets the full retry budget. When that runs out the export
//! is parked and retried ahead of the next one, one attempt each, stopping
//! at the first failure. The store's resume pointer only ever moves to a
//! more advanced export, so a parked export that lands late never hides a
//! newer one.

use std::collections::VecDeque;

use tracing::{info, warn};

use phaselock_types::{ContentId, NumericValue, SnapshotId};

use crate::blob::{BlobError, BlobStore};
use crate::checkpoint::{CheckpointError, CheckpointManager};
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Upper bound on parked exports; the oldest are dropped beyond it.
pub const MAX_PENDING_EXPORTS: usize = 64;

/// Errors from loading an archived snapshot.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The blob could not be fetched.
    #[error("failed to fetch archived snapshot: {source}")]
    Blob {
        /// The underlying store error.
        #[from]
        source: BlobError,
    },

    /// The fetched bytes are not a valid snapshot.
    #[error("archived snapshot is invalid: {source}")]
    Checkpoint {
        /// The underlying decode error.
        #[from]
        source: CheckpointError,
    },
}

/// One exported snapshot waiting for, or done with, the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Snapshot the bytes came from.
    pub snapshot: SnapshotId,
    /// Evolution count the snapshot was captured at.
    pub evolution_count: u64,
    /// Encoded snapshot.
    pub bytes: Vec<u8>,
}

/// An export the store holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedExport {
    /// Snapshot the blob came from.
    pub snapshot: SnapshotId,
    /// Evolution count the snapshot was captured at.
    pub evolution_count: u64,
    /// Content address of the blob.
    pub content_id: ContentId,
}

/// Result of archiving one export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// The export is stored under this id.
    Stored {
        /// Content address of the blob.
        content_id: ContentId,
    },
    /// Every attempt failed; the export waits for the next checkpoint.
    Queued,
}

/// Archives exports to a [`BlobStore`].
#[derive(Debug)]
pub struct SnapshotArchiver<B> {
    store: B,
    retry: RetryPolicy,
    pending: VecDeque<Export>,
    latest: Option<ArchivedExport>,
}

impl<B: BlobStore> SnapshotArchiver<B> {
    /// Wrap a blob store.
    pub const fn new(store: B, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            pending: VecDeque::new(),
            latest: None,
        }
    }

    /// The wrapped store.
    pub const fn store(&self) -> &B {
        &self.store
    }

    /// Store an export, after first retrying any parked ones.
    pub async fn archive(&mut self, export: Export) -> ArchiveOutcome {
        self.flush_pending().await;
        let result = retry_with_backoff(&self.retry, "blob.put", BlobError::is_retryable, || {
            self.store.put(export.bytes.clone())
        })
        .await;
        match result {
            Ok(content_id) => {
                info!(
                    snapshot = %export.snapshot,
                    evolution_count = export.evolution_count,
                    blob = %content_id,
                    "Snapshot archived"
                );
                self.promote(&export, &content_id).await;
                ArchiveOutcome::Stored { content_id }
            }
            Err(err) => {
                warn!(
                    snapshot = %export.snapshot,
                    error = %err,
                    "Snapshot export failed, queued for next checkpoint"
                );
                self.park(export);
                ArchiveOutcome::Queued
            }
        }
    }

    /// Try each parked export once, oldest first, stopping at the first
    /// failure. Returns how many were stored.
    pub async fn flush_pending(&mut self) -> usize {
        let mut stored = 0_usize;
        while let Some(export) = self.pending.pop_front() {
            match self.store.put(export.bytes.clone()).await {
                Ok(content_id) => {
                    info!(snapshot = %export.snapshot, blob = %content_id, "Queued snapshot archived");
                    self.promote(&export, &content_id).await;
                    stored = stored.saturating_add(1);
                }
                Err(err) => {
                    warn!(
                        snapshot = %export.snapshot,
                        error = %err,
                        remaining = self.pending.len().saturating_add(1),
                        "Queued snapshot export failed again"
                    );
                    self.pending.push_front(export);
                    break;
                }
            }
        }
        stored
    }

    /// Fetch an archived export and import it into `manager`.
    pub async fn load_into<N: NumericValue>(
        &self,
        content_id: &ContentId,
        manager: &mut CheckpointManager<N>,
    ) -> Result<SnapshotId, ArchiveError> {
        let bytes = self.store.get(content_id).await?;
        Ok(manager.import(&bytes)?)
    }

    /// The most advanced export stored by this archiver.
    pub const fn latest(&self) -> Option<&ArchivedExport> {
        self.latest.as_ref()
    }

    /// Number of parked exports.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Move the resume pointer to `export` if it is the most advanced
    /// export stored so far.
    async fn promote(&mut self, export: &Export, content_id: &ContentId) {
        let advanced = self
            .latest
            .as_ref()
            .is_none_or(|latest| export.evolution_count > latest.evolution_count);
        if !advanced {
            return;
        }
        if let Err(err) = self.store.record_latest(content_id).await {
            warn!(blob = %content_id, error = %err, "Failed to move resume pointer");
            return;
        }
        self.latest = Some(ArchivedExport {
            snapshot: export.snapshot,
            evolution_count: export.evolution_count,
            content_id: content_id.clone(),
        });
    }

    fn park(&mut self, export: Export) {
        if self.pending.len() >= MAX_PENDING_EXPORTS {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(snapshot = %dropped.snapshot, "Export queue full, dropping oldest");
            }
        }
        self.pending.push_back(export);
    }
}
