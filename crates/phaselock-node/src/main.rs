//! Phaselock node binary.
//!
//! Wires the evolution loop to its collaborators and runs one lattice
//! until it locks, hits its step limit, or receives Ctrl-C.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `phaselock.yaml` (or `PHASELOCK_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Connect the ledger, blob store, and telemetry backends
//! 4. Build the lattice and optionally resume from the latest export
//! 5. Install the Ctrl-C handler and the confirmation listener, then start
//!    the delivery worker
//! 6. Run the evolution loop
//! 7. Drain the delivery worker and log the result

mod backends;
mod error;
mod nats_telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use phaselock_core::archive::SnapshotArchiver;
use phaselock_core::blob::BlobStore as _;
use phaselock_core::config::{LoggingConfig, PhaselockConfig};
use phaselock_core::dispatch::{DISPATCH_QUEUE_CAPACITY, Dispatcher};
use phaselock_core::operator::OperatorState;
use phaselock_core::publisher::CommitmentPublisher;
use phaselock_core::retry::RetryPolicy;
use phaselock_core::runner::{self, NoOpCallback, NodeState, RunSchedule, Services};
use phaselock_ledger::LedgerEvent;
use phaselock_types::NodeId;

use crate::backends::NodeBlobs;
use crate::error::NodeError;

/// Config file used when `PHASELOCK_CONFIG` is not set.
const DEFAULT_CONFIG_PATH: &str = "phaselock.yaml";

/// How long shutdown waits for queued commitments and exports.
const DELIVERY_GRACE: Duration = Duration::from_secs(10);

/// Application entry point.
///
/// # Errors
///
/// Returns an error if startup fails or the evolution loop aborts.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load configuration.
    let config_path = std::env::var("PHASELOCK_CONFIG")
        .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // 2. Initialize structured logging.
    init_logging(&config.logging)?;
    let node_id = NodeId::new();
    info!(
        node_id = %node_id,
        config = %config_path.display(),
        dimensions = ?config.lattice.dimensions,
        seed = config.lattice.seed,
        steps_per_second = config.lattice.steps_per_second,
        "phaselock-node starting"
    );

    // 3. Connect collaborators.
    let retry = RetryPolicy::from_config(&config.retry);
    let (ledger, blobs, telemetry) = futures::join!(
        backends::connect_ledger(&config.infrastructure, node_id),
        backends::connect_blobs(&config.infrastructure),
        backends::connect_telemetry(&config.infrastructure, node_id),
    );
    let publisher = CommitmentPublisher::new(ledger, retry);
    let archiver = SnapshotArchiver::new(blobs, retry);

    // 4. Build the lattice.
    let mut node = NodeState::<f64>::from_config(&config).map_err(NodeError::from)?;
    if config.run.resume {
        resume(&mut node, &archiver).await;
    }

    // 5. Operator controls, confirmation listener, delivery worker.
    let operator = Arc::new(OperatorState::new(&config.run));
    spawn_ctrl_c_handler(Arc::clone(&operator));
    spawn_confirmation_listener(publisher.subscribe());
    let mut services = Services {
        dispatcher: Dispatcher::spawn(publisher, archiver, DISPATCH_QUEUE_CAPACITY),
        telemetry,
    };

    // 6. Run.
    let schedule = RunSchedule::from_config(&config);
    let result = runner::run_evolution(
        &mut node,
        &mut services,
        &schedule,
        &operator,
        &mut NoOpCallback,
    )
    .await
    .map_err(NodeError::from)?;

    // 7. Wrap up.
    runner::log_run_end(&result);
    drain_deliveries(services.dispatcher).await;

    info!(
        end_reason = ?result.end_reason,
        evolution_count = result.final_state.evolution_count,
        "phaselock-node shutdown complete"
    );
    Ok(())
}

/// Load and validate configuration, falling back to defaults when the
/// file does not exist.
fn load_config(path: &Path) -> Result<PhaselockConfig, NodeError> {
    let config = if path.exists() {
        PhaselockConfig::from_file(path)?
    } else {
        let mut config = PhaselockConfig::default();
        config.infrastructure.apply_env_overrides();
        config
    };
    config.validate()?;
    Ok(config)
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
fn init_logging(logging: &LoggingConfig) -> Result<(), NodeError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| NodeError::Logging {
        message: e.to_string(),
    })
}

/// Restore the latest archived snapshot. Failures leave the fresh lattice
/// in place.
async fn resume(node: &mut NodeState, archiver: &SnapshotArchiver<NodeBlobs>) {
    let latest = match archiver.store().latest().await {
        Ok(Some(content_id)) => content_id,
        Ok(None) => {
            info!("No archived snapshot to resume from, starting fresh");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Could not look up latest export, starting fresh");
            return;
        }
    };
    match node.resume_from_archive(archiver, &latest).await {
        Ok(id) => info!(
            snapshot = %id,
            blob = %latest,
            evolution_count = node.engine.evolution_count(),
            "Resumed from archived snapshot"
        ),
        Err(e) => warn!(blob = %latest, error = %e, "Resume failed, starting fresh"),
    }
}

/// Let the delivery worker finish, bounded by [`DELIVERY_GRACE`].
async fn drain_deliveries(dispatcher: Dispatcher) {
    match tokio::time::timeout(DELIVERY_GRACE, dispatcher.shutdown()).await {
        Ok(Ok(report)) => {
            if let Some(latest) = &report.latest_export {
                info!(
                    blob = %latest.content_id,
                    evolution_count = latest.evolution_count,
                    "Resume pointer recorded"
                );
            }
            if report.undelivered() > 0 {
                warn!(
                    commitments = report.commitments_pending,
                    exports = report.exports_pending,
                    "Shutting down with undelivered commitments or exports"
                );
            }
        }
        Ok(Err(e)) => warn!(error = %e, "Delivery worker failed"),
        Err(_) => warn!(
            grace_secs = DELIVERY_GRACE.as_secs(),
            "Delivery worker still busy, abandoning queued work"
        ),
    }
}

/// Request a stop on the first Ctrl-C. The loop finishes its current step.
fn spawn_ctrl_c_handler(operator: Arc<OperatorState>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, stopping after the current step");
                operator.request_stop();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });
}

/// Log ledger confirmations as they arrive.
fn spawn_confirmation_listener(mut events: tokio::sync::broadcast::Receiver<LedgerEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LedgerEvent::ConsensusAchieved { digest, timestamp }) => {
                    info!(digest = %digest, confirmed_at = %timestamp, "Ledger consensus achieved");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Confirmation listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
