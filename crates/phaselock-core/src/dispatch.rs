//! Background delivery of commitments and snapshot exports.
//!
//! The evolution loop never awaits a collaborator. It hands each job to a
//! [`Dispatcher`], which queues it on a bounded channel for a worker task
//! owning the [`CommitmentPublisher`] and [`SnapshotArchiver`]. Retries and
//! backoff happen on the worker. When the channel is full the job is
//! dropped and counted, and the loop carries on.
//!
//! ```text
//! run_evolution --try_send--> [ channel ] --> worker --> ledger
//!                                                   \--> blob store
//! ```

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use phaselock_ledger::LedgerClient;
use phaselock_types::Commitment;

use crate::archive::{ArchivedExport, Export, SnapshotArchiver};
use crate::blob::BlobStore;
use crate::publisher::CommitmentPublisher;

/// Jobs the channel holds before new ones are dropped.
pub const DISPATCH_QUEUE_CAPACITY: usize = 256;

/// Errors from stopping the delivery worker.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The worker task panicked or was cancelled.
    #[error("delivery worker failed: {source}")]
    Worker {
        /// The underlying join error.
        #[from]
        source: tokio::task::JoinError,
    },
}

/// One unit of work for the worker.
#[derive(Debug)]
enum Delivery {
    Commit(Commitment),
    Export(Export),
}

/// What happened to a job handed to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The worker will deliver it.
    Enqueued,
    /// The channel was full or closed; the job is gone.
    Dropped,
}

/// State of delivery when the worker stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Commitments the ledger now holds.
    pub commitments_recorded: u64,
    /// Commitments still parked.
    pub commitments_pending: usize,
    /// Exports still parked.
    pub exports_pending: usize,
    /// The export the store's resume pointer names.
    pub latest_export: Option<ArchivedExport>,
}

impl DeliveryReport {
    /// Jobs that never reached their collaborator.
    pub const fn undelivered(&self) -> usize {
        self.commitments_pending.saturating_add(self.exports_pending)
    }
}

/// Loop-side handle to the delivery worker.
#[derive(Debug)]
pub struct Dispatcher {
    sender: mpsc::Sender<Delivery>,
    worker: JoinHandle<DeliveryReport>,
    dropped: u64,
    dropping: bool,
}

impl Dispatcher {
    /// Spawn the worker on the current runtime.
    pub fn spawn<L, B>(
        publisher: CommitmentPublisher<L>,
        archiver: SnapshotArchiver<B>,
        capacity: usize,
    ) -> Self
    where
        L: LedgerClient + 'static,
        B: BlobStore + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(deliver(publisher, archiver, receiver));
        Self {
            sender,
            worker,
            dropped: 0,
            dropping: false,
        }
    }

    /// Queue a commitment for the ledger.
    pub fn commit(&mut self, commitment: Commitment) -> DispatchOutcome {
        self.enqueue(Delivery::Commit(commitment))
    }

    /// Queue an export for the blob store.
    pub fn export(&mut self, export: Export) -> DispatchOutcome {
        self.enqueue(Delivery::Export(export))
    }

    /// Jobs dropped because the channel was full or closed.
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Close the channel and wait for the worker to drain it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Worker`] if the worker panicked.
    pub async fn shutdown(self) -> Result<DeliveryReport, DispatchError> {
        drop(self.sender);
        Ok(self.worker.await?)
    }

    fn enqueue(&mut self, delivery: Delivery) -> DispatchOutcome {
        match self.sender.try_send(delivery) {
            Ok(()) => {
                if self.dropping {
                    info!(dropped = self.dropped, "Delivery queue accepting jobs again");
                    self.dropping = false;
                }
                DispatchOutcome::Enqueued
            }
            Err(err) => {
                self.dropped = self.dropped.saturating_add(1);
                if !self.dropping {
                    let reason = match err {
                        TrySendError::Full(_) => "full",
                        TrySendError::Closed(_) => "closed",
                    };
                    warn!(reason, "Delivery queue unavailable, dropping jobs");
                    self.dropping = true;
                }
                DispatchOutcome::Dropped
            }
        }
    }
}

/// Worker body: deliver jobs in arrival order until the channel closes,
/// then make one last pass over anything parked.
async fn deliver<L, B>(
    publisher: CommitmentPublisher<L>,
    mut archiver: SnapshotArchiver<B>,
    mut receiver: mpsc::Receiver<Delivery>,
) -> DeliveryReport
where
    L: LedgerClient,
    B: BlobStore,
{
    let mut recorded = 0_u64;
    while let Some(delivery) = receiver.recv().await {
        match delivery {
            Delivery::Commit(commitment) => {
                recorded = recorded.saturating_add(flushed(publisher.flush_pending().await));
                let evolution_count = commitment.evolution_count;
                let outcome = publisher.publish(commitment).await;
                debug!(evolution_count, outcome = ?outcome, "Commitment delivered");
                if outcome.is_recorded() {
                    recorded = recorded.saturating_add(1);
                }
            }
            Delivery::Export(export) => {
                let outcome = archiver.archive(export).await;
                debug!(outcome = ?outcome, "Export delivered");
            }
        }
    }

    recorded = recorded.saturating_add(flushed(publisher.flush_pending().await));
    archiver.flush_pending().await;
    DeliveryReport {
        commitments_recorded: recorded,
        commitments_pending: publisher.pending_len().await,
        exports_pending: archiver.pending_len(),
        latest_export: archiver.latest().cloned(),
    }
}

fn flushed(count: usize) -> u64 {
    u64::try_from(count).unwrap_or(u64::MAX)
}
