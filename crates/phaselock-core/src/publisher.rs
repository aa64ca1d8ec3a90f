//! Commitment submission with retry and a resubmission queue.
//!
//! A new submission gets the full retry budget. Submissions that exhaust
//! it are parked, and [`CommitmentPublisher::flush_pending`] resubmits them
//! oldest first with one attempt each, stopping at the first retryable
//! failure. A digest the ledger already holds counts as success.

use std::collections::VecDeque;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use phaselock_ledger::{LedgerClient, LedgerError, LedgerEvent};
use phaselock_types::{Commitment, TxRef};

use crate::retry::{RetryPolicy, retry_with_backoff};

/// Upper bound on parked commitments; the oldest are dropped beyond it.
pub const MAX_PENDING_COMMITMENTS: usize = 1024;

/// Result of handing one commitment to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The ledger accepted a new submission.
    Submitted {
        /// Reference returned by the ledger.
        tx_ref: TxRef,
    },
    /// The digest was already on the ledger and confirmed.
    AlreadyConfirmed,
    /// The digest was already on the ledger, awaiting confirmation.
    AlreadyPending,
    /// Every attempt failed; the commitment is parked for resubmission.
    Queued,
    /// The ledger refused the commitment outright.
    Rejected {
        /// The ledger's reason.
        reason: String,
    },
}

impl PublishOutcome {
    /// Whether the ledger now holds the digest.
    pub const fn is_recorded(&self) -> bool {
        matches!(
            self,
            Self::Submitted { .. } | Self::AlreadyConfirmed | Self::AlreadyPending
        )
    }
}

/// Hands commitments to a ledger collaborator.
#[derive(Debug)]
pub struct CommitmentPublisher<L> {
    ledger: L,
    retry: RetryPolicy,
    pending: Mutex<VecDeque<Commitment>>,
}

impl<L: LedgerClient> CommitmentPublisher<L> {
    /// Wrap a ledger client.
    pub fn new(ledger: L, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            retry,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// The wrapped ledger.
    pub const fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Subscribe to the ledger's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.ledger.subscribe()
    }

    /// Submit a commitment, parking it if the ledger stays unreachable.
    pub async fn publish(&self, commitment: Commitment) -> PublishOutcome {
        match self.submit(&commitment, &self.retry).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_retryable() => {
                warn!(
                    digest = %commitment.digest,
                    evolution_count = commitment.evolution_count,
                    error = %err,
                    "Commitment submission exhausted retries, queued"
                );
                self.park(commitment).await;
                PublishOutcome::Queued
            }
            Err(err) => {
                warn!(
                    digest = %commitment.digest,
                    error = %err,
                    "Commitment rejected by ledger"
                );
                PublishOutcome::Rejected {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Resubmit parked commitments once each, oldest first, until one
    /// fails retryably. Returns how many the ledger now holds; the rest stay
    /// parked in order.
    pub async fn flush_pending(&self) -> usize {
        let once = RetryPolicy::once();
        let mut recorded = 0_usize;
        loop {
            let Some(commitment) = self.pending.lock().await.pop_front() else {
                break;
            };
            match self.submit(&commitment, &once).await {
                Ok(_) => recorded = recorded.saturating_add(1),
                Err(err) if err.is_retryable() => {
                    debug!(digest = %commitment.digest, error = %err, "Ledger still unavailable");
                    self.pending.lock().await.push_front(commitment);
                    break;
                }
                Err(err) => {
                    warn!(digest = %commitment.digest, error = %err, "Queued commitment rejected");
                }
            }
        }
        if recorded > 0 {
            let remaining = self.pending_len().await;
            info!(recorded, remaining, "Flushed queued commitments");
        }
        recorded
    }

    /// Number of parked commitments.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Submit with retry, folding duplicate digests into success.
    async fn submit(
        &self,
        commitment: &Commitment,
        policy: &RetryPolicy,
    ) -> Result<PublishOutcome, LedgerError> {
        let digest = commitment.digest;
        let evolution_count = commitment.evolution_count;
        let result = retry_with_backoff(
            policy,
            "ledger.submit_commitment",
            LedgerError::is_retryable,
            || self.ledger.submit_commitment(digest, evolution_count),
        )
        .await;

        match result {
            Ok(tx_ref) => {
                info!(
                    digest = %digest,
                    evolution_count,
                    tx_ref = %tx_ref,
                    "Commitment submitted"
                );
                Ok(PublishOutcome::Submitted { tx_ref })
            }
            Err(LedgerError::DuplicateDigest { .. }) => {
                let confirmed = self.ledger.is_confirmed(digest).await.unwrap_or(false);
                debug!(digest = %digest, confirmed, "Commitment already on ledger");
                Ok(if confirmed {
                    PublishOutcome::AlreadyConfirmed
                } else {
                    PublishOutcome::AlreadyPending
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn park(&self, commitment: Commitment) {
        let mut pending = self.pending.lock().await;
        if pending.iter().any(|queued| queued.digest == commitment.digest) {
            return;
        }
        if pending.len() >= MAX_PENDING_COMMITMENTS {
            if let Some(dropped) = pending.pop_front() {
                warn!(digest = %dropped.digest, "Commitment queue full, dropping oldest");
            }
        }
        pending.push_back(commitment);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use phaselock_ledger::InMemoryLedger;
    use phaselock_types::Digest;

    use super::*;

    fn commitment(tag: &[u8], evolution_count: u64) -> Commitment {
        Commitment {
            digest: Digest::of(tag),
            evolution_count,
            timestamp_ns: 0,
            confirmed: false,
        }
    }

    fn publisher(ledger: Arc<InMemoryLedger>) -> CommitmentPublisher<Arc<InMemoryLedger>> {
        CommitmentPublisher::new(
            ledger,
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn submits_new_commitment() {
        let ledger = Arc::new(InMemoryLedger::new());
        let publisher = publisher(Arc::clone(&ledger));
        let outcome = publisher.publish(commitment(b"a", 10)).await;
        assert!(matches!(outcome, PublishOutcome::Submitted { .. }));
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.fail_next(2);
        let publisher = publisher(Arc::clone(&ledger));
        let outcome = publisher.publish(commitment(b"a", 10)).await;
        assert!(outcome.is_recorded());
        assert_eq!(publisher.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_queue_then_flush() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.fail_next(3);
        let publisher = publisher(Arc::clone(&ledger));
        let outcome = publisher.publish(commitment(b"a", 10)).await;
        assert_eq!(outcome, PublishOutcome::Queued);
        assert_eq!(publisher.pending_len().await, 1);
        assert!(ledger.is_empty().await);

        assert_eq!(publisher.flush_pending().await, 1);
        assert_eq!(publisher.pending_len().await, 0);
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_stops_at_first_failure_without_backoff() {
        let ledger = Arc::new(InMemoryLedger::new());
        let publisher = publisher(Arc::clone(&ledger));
        ledger.fail_next(u32::MAX);
        for (tag, count) in [(b"a", 1), (b"b", 2), (b"c", 3)] {
            publisher.publish(commitment(tag, count)).await;
        }
        assert_eq!(publisher.pending_len().await, 3);

        let started = tokio::time::Instant::now();
        assert_eq!(publisher.flush_pending().await, 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(publisher.pending_len().await, 3);

        ledger.fail_next(0);
        assert_eq!(publisher.flush_pending().await, 3);
        let first = ledger.record(Digest::of(b"a")).await.unwrap();
        assert_eq!(first.evolution_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_duplicate_is_idempotent_success() {
        let ledger = Arc::new(InMemoryLedger::auto_confirming());
        let publisher = publisher(Arc::clone(&ledger));
        publisher.publish(commitment(b"a", 10)).await;
        let again = publisher.publish(commitment(b"a", 10)).await;
        assert_eq!(again, PublishOutcome::AlreadyConfirmed);
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_duplicate_is_pending() {
        let ledger = Arc::new(InMemoryLedger::new());
        let publisher = publisher(Arc::clone(&ledger));
        publisher.publish(commitment(b"a", 10)).await;
        let again = publisher.publish(commitment(b"a", 10)).await;
        assert_eq!(again, PublishOutcome::AlreadyPending);
        assert!(again.is_recorded());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_deduplicates_digests() {
        let ledger = Arc::new(InMemoryLedger::new());
        let publisher = publisher(Arc::clone(&ledger));
        ledger.fail_next(6);
        publisher.publish(commitment(b"a", 10)).await;
        publisher.publish(commitment(b"a", 10)).await;
        assert_eq!(publisher.pending_len().await, 1);
    }
}
