//! The ledger collaborator interface.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use phaselock_types::{Digest, TxRef};

use crate::LedgerError;

/// Events announced by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// A submitted digest was confirmed by the ledger.
    ConsensusAchieved {
        /// The confirmed digest.
        digest: Digest,
        /// When the ledger confirmed it.
        timestamp: DateTime<Utc>,
    },
}

/// External ledger that anchors state commitments.
///
/// Implementations must be safe to share between the runner and any
/// background retry task, so every method takes `&self`.
pub trait LedgerClient: Send + Sync {
    /// Submit a commitment digest taken at `evolution_count`.
    fn submit_commitment(
        &self,
        digest: Digest,
        evolution_count: u64,
    ) -> impl Future<Output = Result<TxRef, LedgerError>> + Send;

    /// Whether `digest` has been confirmed. Unknown digests are `false`.
    fn is_confirmed(&self, digest: Digest) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    /// Subscribe to ledger events from this point on.
    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent>;
}

impl<T: LedgerClient> LedgerClient for Arc<T> {
    fn submit_commitment(
        &self,
        digest: Digest,
        evolution_count: u64,
    ) -> impl Future<Output = Result<TxRef, LedgerError>> + Send {
        T::submit_commitment(self, digest, evolution_count)
    }

    fn is_confirmed(&self, digest: Digest) -> impl Future<Output = Result<bool, LedgerError>> + Send {
        T::is_confirmed(self, digest)
    }

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        T::subscribe(self)
    }
}
