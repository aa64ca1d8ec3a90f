//! [`LedgerClient`] backed by the `commitments` table.
//!
//! Each digest is a primary key, so a repeated submission is detected by
//! the insert itself. Confirmation is an explicit update; a confirming
//! update is announced on the ledger event stream.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use phaselock_ledger::{LedgerClient, LedgerError, LedgerEvent};
use phaselock_types::{Commitment, Digest, NodeId, TxRef};

use crate::error::DbError;

/// Capacity of the ledger event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A row from the `commitments` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommitmentRow {
    /// Lowercase hex of the digest.
    pub digest: String,
    /// Evolution count the digest was taken at.
    pub evolution_count: i64,
    /// Node that submitted it.
    pub node_id: Uuid,
    /// Transaction reference handed back on submission.
    pub tx_ref: String,
    /// Whether the digest has been confirmed.
    pub confirmed: bool,
    /// When the submission arrived.
    pub submitted_at: DateTime<Utc>,
    /// When it was confirmed.
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl CommitmentRow {
    /// Decode into a [`Commitment`]. The row does not store a logical
    /// timestamp, so `timestamp_ns` is zero.
    pub fn into_commitment(self) -> Result<Commitment, DbError> {
        let digest = Digest::from_hex(&self.digest).map_err(|e| DbError::CorruptRow {
            table: "commitments",
            reason: format!("digest: {e}"),
        })?;
        let evolution_count =
            u64::try_from(self.evolution_count).map_err(|e| DbError::CorruptRow {
                table: "commitments",
                reason: format!("evolution_count: {e}"),
            })?;
        Ok(Commitment {
            digest,
            evolution_count,
            timestamp_ns: 0,
            confirmed: self.confirmed,
        })
    }
}

/// Commitment ledger stored in `PostgreSQL`.
pub struct PostgresLedger {
    pool: PgPool,
    node_id: NodeId,
    events: broadcast::Sender<LedgerEvent>,
}

impl PostgresLedger {
    /// Create a ledger writing rows tagged with `node_id`.
    pub fn new(pool: PgPool, node_id: NodeId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pool,
            node_id,
            events,
        }
    }

    /// The node this ledger submits for.
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Mark `digest` confirmed and announce it.
    ///
    /// Returns `false` if it was already confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownDigest`] if the digest was never
    /// submitted.
    pub async fn confirm(&self, digest: Digest) -> Result<bool, LedgerError> {
        let updated = sqlx::query(
            r"UPDATE commitments SET confirmed = TRUE, confirmed_at = NOW()
              WHERE digest = $1 AND NOT confirmed",
        )
        .bind(digest.to_hex())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?
        .rows_affected();

        if updated > 0 {
            // No receivers is fine: nobody is listening yet.
            let _ = self.events.send(LedgerEvent::ConsensusAchieved {
                digest,
                timestamp: Utc::now(),
            });
            info!(digest = %digest, "Commitment confirmed");
            return Ok(true);
        }
        if self.find(digest).await?.is_none() {
            return Err(LedgerError::UnknownDigest { digest });
        }
        Ok(false)
    }

    /// Look up the row for `digest`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Backend`] if the query fails.
    pub async fn find(&self, digest: Digest) -> Result<Option<CommitmentRow>, LedgerError> {
        let row = sqlx::query_as::<_, CommitmentRow>(
            r"SELECT digest, evolution_count, node_id, tx_ref, confirmed, submitted_at, confirmed_at
              FROM commitments
              WHERE digest = $1",
        )
        .bind(digest.to_hex())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(row)
    }

    /// Commitments from this node at or after `evolution_count`, oldest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row does not decode.
    pub async fn commitments_since(&self, evolution_count: u64) -> Result<Vec<Commitment>, DbError> {
        let from = i64::try_from(evolution_count).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, CommitmentRow>(
            r"SELECT digest, evolution_count, node_id, tx_ref, confirmed, submitted_at, confirmed_at
              FROM commitments
              WHERE node_id = $1 AND evolution_count >= $2
              ORDER BY evolution_count, submitted_at",
        )
        .bind(self.node_id.into_inner())
        .bind(from)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CommitmentRow::into_commitment).collect()
    }
}

impl LedgerClient for PostgresLedger {
    async fn submit_commitment(
        &self,
        digest: Digest,
        evolution_count: u64,
    ) -> Result<TxRef, LedgerError> {
        let tx_ref = TxRef(format!("pg-{}", Uuid::now_v7()));
        let count = i64::try_from(evolution_count).map_err(|_err| LedgerError::Rejected {
            reason: format!("evolution_count {evolution_count} exceeds BIGINT"),
        })?;

        let inserted = sqlx::query(
            r"INSERT INTO commitments (digest, evolution_count, node_id, tx_ref, confirmed, submitted_at)
              VALUES ($1, $2, $3, $4, FALSE, NOW())
              ON CONFLICT (digest) DO NOTHING",
        )
        .bind(digest.to_hex())
        .bind(count)
        .bind(self.node_id.into_inner())
        .bind(tx_ref.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?
        .rows_affected();

        if inserted == 0 {
            return Err(LedgerError::DuplicateDigest { digest });
        }
        debug!(digest = %digest, evolution_count, tx = %tx_ref, "Commitment stored");
        Ok(tx_ref)
    }

    async fn is_confirmed(&self, digest: Digest) -> Result<bool, LedgerError> {
        let confirmed: Option<bool> =
            sqlx::query_scalar(r"SELECT confirmed FROM commitments WHERE digest = $1")
                .bind(digest.to_hex())
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::from)?;
        Ok(confirmed.unwrap_or(false))
    }

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }
}
