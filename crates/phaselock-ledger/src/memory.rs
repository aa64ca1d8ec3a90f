//! In-memory ledger with confirmation and failure injection.
//!
//! Records live in insertion order for the lifetime of the value. Tests use
//! [`InMemoryLedger::fail_next`] to simulate an unreachable ledger and
//! [`InMemoryLedger::confirm`] to play the role of the validators.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use phaselock_types::{Commitment, Digest, TxRef};

use crate::LedgerError;
use crate::client::{LedgerClient, LedgerEvent};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One submission held by the in-memory ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    /// Reference handed back to the submitter.
    pub tx_ref: TxRef,
    /// Evolution count the digest was taken at.
    pub evolution_count: u64,
    /// Whether the digest has been confirmed.
    pub confirmed: bool,
    /// When the submission arrived.
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Records {
    by_digest: BTreeMap<Digest, LedgerRecord>,
    order: Vec<Digest>,
}

/// A ledger held entirely in process memory.
#[derive(Debug)]
pub struct InMemoryLedger {
    records: Mutex<Records>,
    events: broadcast::Sender<LedgerEvent>,
    auto_confirm: bool,
    pending_failures: AtomicU32,
    next_tx: AtomicU64,
}

impl InMemoryLedger {
    /// Create a ledger that leaves submissions unconfirmed until
    /// [`confirm`](Self::confirm) is called.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: Mutex::new(Records::default()),
            events,
            auto_confirm: false,
            pending_failures: AtomicU32::new(0),
            next_tx: AtomicU64::new(0),
        }
    }

    /// Create a ledger that confirms every submission immediately.
    pub fn auto_confirming() -> Self {
        Self {
            auto_confirm: true,
            ..Self::new()
        }
    }

    /// Make the next `count` submissions fail with
    /// [`LedgerError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Confirm a previously submitted digest and announce it.
    ///
    /// Confirming an already confirmed digest is a no-op.
    pub async fn confirm(&self, digest: Digest) -> Result<(), LedgerError> {
        let newly_confirmed = {
            let mut records = self.records.lock().await;
            let record = records
                .by_digest
                .get_mut(&digest)
                .ok_or(LedgerError::UnknownDigest { digest })?;
            let was_confirmed = record.confirmed;
            record.confirmed = true;
            !was_confirmed
        };
        if newly_confirmed {
            self.announce(digest);
        }
        Ok(())
    }

    /// All submissions in arrival order.
    pub async fn commitments(&self) -> Vec<Commitment> {
        let records = self.records.lock().await;
        records
            .order
            .iter()
            .filter_map(|digest| {
                records.by_digest.get(digest).map(|record| Commitment {
                    digest: *digest,
                    evolution_count: record.evolution_count,
                    timestamp_ns: 0,
                    confirmed: record.confirmed,
                })
            })
            .collect()
    }

    /// Look up the record for `digest`.
    pub async fn record(&self, digest: Digest) -> Option<LedgerRecord> {
        self.records.lock().await.by_digest.get(&digest).cloned()
    }

    /// Number of accepted submissions.
    pub async fn len(&self) -> usize {
        self.records.lock().await.order.len()
    }

    /// Whether no submission has been accepted.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.order.is_empty()
    }

    fn take_injected_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    fn announce(&self, digest: Digest) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(LedgerEvent::ConsensusAchieved {
            digest,
            timestamp: Utc::now(),
        });
        info!(digest = %digest, "Commitment confirmed");
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerClient for InMemoryLedger {
    async fn submit_commitment(
        &self,
        digest: Digest,
        evolution_count: u64,
    ) -> Result<TxRef, LedgerError> {
        if self.take_injected_failure() {
            return Err(LedgerError::Unavailable {
                reason: String::from("injected failure"),
            });
        }

        let tx_ref = {
            let mut records = self.records.lock().await;
            if records.by_digest.contains_key(&digest) {
                return Err(LedgerError::DuplicateDigest { digest });
            }
            let sequence = self.next_tx.fetch_add(1, Ordering::SeqCst);
            let tx_ref = TxRef(format!("mem-{sequence:08}"));
            records.by_digest.insert(
                digest,
                LedgerRecord {
                    tx_ref: tx_ref.clone(),
                    evolution_count,
                    confirmed: self.auto_confirm,
                    submitted_at: Utc::now(),
                },
            );
            records.order.push(digest);
            tx_ref
        };

        debug!(digest = %digest, evolution_count, tx = %tx_ref, "Commitment recorded");
        if self.auto_confirm {
            self.announce(digest);
        }
        Ok(tx_ref)
    }

    async fn is_confirmed(&self, digest: Digest) -> Result<bool, LedgerError> {
        Ok(self
            .records
            .lock()
            .await
            .by_digest
            .get(&digest)
            .is_some_and(|record| record.confirmed))
    }

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }
}
