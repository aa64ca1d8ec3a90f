//! Collaborator selection for the node.
//!
//! Each collaborator prefers its networked backend and falls back to a
//! local one when the service is unreachable or its URL is empty:
//!
//! | Collaborator | Networked | Fallback |
//! |--------------|-----------|----------|
//! | Ledger | [`PostgresLedger`] | auto-confirming [`InMemoryLedger`] |
//! | Blob store | [`DragonflyBlobStore`] | [`FsBlobStore`] under `blob_dir` |
//! | Telemetry | [`NatsTelemetry`] | [`LogTelemetry`] |

use tokio::sync::broadcast;
use tracing::{info, warn};

use phaselock_core::blob::{BlobError, BlobStore, FsBlobStore};
use phaselock_core::config::InfrastructureConfig;
use phaselock_core::telemetry::{LogTelemetry, TelemetrySink};
use phaselock_db::{DragonflyBlobStore, DragonflyPool, PostgresLedger, PostgresPool};
use phaselock_ledger::{InMemoryLedger, LedgerClient, LedgerError, LedgerEvent};
use phaselock_types::{ContentId, Digest, NodeId, TelemetryFrame, TxRef};

use crate::error::NodeError;
use crate::nats_telemetry::NatsTelemetry;

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// The ledger the node submits commitments to.
pub enum NodeLedger {
    /// Single-node ledger that confirms on submission.
    Memory(InMemoryLedger),
    /// Shared `PostgreSQL` ledger.
    Postgres(PostgresLedger),
}

/// Connect the `PostgreSQL` ledger, or fall back to memory.
pub async fn connect_ledger(infra: &InfrastructureConfig, node_id: NodeId) -> NodeLedger {
    if infra.postgres_url.is_empty() {
        info!("No PostgreSQL URL configured, using in-memory ledger");
        return NodeLedger::Memory(InMemoryLedger::auto_confirming());
    }
    match open_postgres(&infra.postgres_url).await {
        Ok(pool) => NodeLedger::Postgres(PostgresLedger::new(pool.pool().clone(), node_id)),
        Err(e) => {
            warn!(error = %e, "PostgreSQL unavailable, using in-memory ledger");
            NodeLedger::Memory(InMemoryLedger::auto_confirming())
        }
    }
}

async fn open_postgres(url: &str) -> Result<PostgresPool, NodeError> {
    let pool = PostgresPool::connect_url(url).await?;
    pool.run_migrations().await?;
    Ok(pool)
}

impl LedgerClient for NodeLedger {
    async fn submit_commitment(
        &self,
        digest: Digest,
        evolution_count: u64,
    ) -> Result<TxRef, LedgerError> {
        match self {
            Self::Memory(ledger) => ledger.submit_commitment(digest, evolution_count).await,
            Self::Postgres(ledger) => ledger.submit_commitment(digest, evolution_count).await,
        }
    }

    async fn is_confirmed(&self, digest: Digest) -> Result<bool, LedgerError> {
        match self {
            Self::Memory(ledger) => ledger.is_confirmed(digest).await,
            Self::Postgres(ledger) => ledger.is_confirmed(digest).await,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        match self {
            Self::Memory(ledger) => ledger.subscribe(),
            Self::Postgres(ledger) => ledger.subscribe(),
        }
    }
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

/// Where exported snapshots are stored.
pub enum NodeBlobs {
    /// Content-addressed files on local disk.
    Fs(FsBlobStore),
    /// `Dragonfly` keys.
    Dragonfly(DragonflyBlobStore),
}

/// Connect the `Dragonfly` store, or fall back to the filesystem.
pub async fn connect_blobs(infra: &InfrastructureConfig) -> NodeBlobs {
    let local = || NodeBlobs::Fs(FsBlobStore::new(&infra.blob_dir));
    if infra.dragonfly_url.is_empty() {
        info!(blob_dir = infra.blob_dir, "No Dragonfly URL configured, using filesystem blobs");
        return local();
    }
    match DragonflyPool::connect(&infra.dragonfly_url).await {
        Ok(pool) => NodeBlobs::Dragonfly(DragonflyBlobStore::new(pool)),
        Err(e) => {
            warn!(error = %e, blob_dir = infra.blob_dir, "Dragonfly unavailable, using filesystem blobs");
            local()
        }
    }
}

impl BlobStore for NodeBlobs {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentId, BlobError> {
        match self {
            Self::Fs(store) => store.put(bytes).await,
            Self::Dragonfly(store) => store.put(bytes).await,
        }
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, BlobError> {
        match self {
            Self::Fs(store) => store.get(id).await,
            Self::Dragonfly(store) => store.get(id).await,
        }
    }

    async fn record_latest(&self, id: &ContentId) -> Result<(), BlobError> {
        match self {
            Self::Fs(store) => store.record_latest(id).await,
            Self::Dragonfly(store) => store.record_latest(id).await,
        }
    }

    async fn latest(&self) -> Result<Option<ContentId>, BlobError> {
        match self {
            Self::Fs(store) => store.latest().await,
            Self::Dragonfly(store) => store.latest().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Where telemetry frames go.
pub enum NodeTelemetry {
    /// The `tracing` log.
    Log(LogTelemetry),
    /// A NATS subject.
    Nats(NatsTelemetry),
}

/// Connect NATS telemetry, or fall back to the log.
pub async fn connect_telemetry(infra: &InfrastructureConfig, node_id: NodeId) -> NodeTelemetry {
    if infra.nats_url.is_empty() {
        info!("No NATS URL configured, logging telemetry");
        return NodeTelemetry::Log(LogTelemetry);
    }
    match NatsTelemetry::connect(&infra.nats_url, node_id).await {
        Ok(sink) => NodeTelemetry::Nats(sink),
        Err(e) => {
            warn!(error = %e, "NATS unavailable, logging telemetry");
            NodeTelemetry::Log(LogTelemetry)
        }
    }
}

impl TelemetrySink for NodeTelemetry {
    async fn emit(&self, frame: TelemetryFrame) {
        match self {
            Self::Log(sink) => sink.emit(frame).await,
            Self::Nats(sink) => sink.emit(frame).await,
        }
    }
}
