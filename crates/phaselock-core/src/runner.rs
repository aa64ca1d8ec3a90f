//! Evolution loop with operator controls.
//!
//! [`run_evolution`] drives the lattice one step at a time:
//!
//! - **Step**: advance the engine, then feed its variance to the detector
//! - **Checkpoint**: capture every `checkpoint.interval` steps, optionally
//!   queueing an export for the blob store
//! - **Commit**: encode and queue for the ledger every
//!   `commitment.interval` steps and on the step that locks
//! - **Telemetry**: emit a frame every `telemetry.interval` steps and on lock
//! - **Pace**: sleep toward the wall-clock schedule
//!
//! Operator requests (pause, stop, epoch reset) are honored between steps
//! only, so a step is never abandoned half-written. Ledger and blob-store
//! traffic goes through a [`Dispatcher`], so an outage costs the loop
//! nothing but dropped jobs once the queue fills.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use phaselock_types::{Commitment, ContentId, LatticeState, NumericValue, SnapshotId};

use crate::archive::{ArchiveError, Export, SnapshotArchiver};
use crate::blob::BlobStore;
use crate::checkpoint::{CheckpointError, CheckpointManager};
use crate::config::{ConfigError, PacingConfig, PhaselockConfig};
use crate::consensus::{ConsensusDetector, ConsensusTransition};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::encoder::{EncodeError, StateEncoder};
use crate::integrity::IntegrityChecker;
use crate::lattice::{LatticeEngine, LatticeError, StepOutcome, StepReport};
use crate::monitor::TimingMonitor;
use crate::operator::{OperatorState, RunEndReason};
use crate::pacing::StepPacer;
use crate::telemetry::{TelemetrySink, frame};

/// How long a locked, held loop waits before polling the operator again.
const LOCKED_IDLE: Duration = Duration::from_millis(10);

/// Errors that can end the evolution loop.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The configuration is invalid.
    #[error("configuration error: {source}")]
    Config {
        /// The underlying error.
        #[from]
        source: ConfigError,
    },

    /// The lattice could not be built.
    #[error("lattice error: {source}")]
    Lattice {
        /// The underlying error.
        #[from]
        source: LatticeError,
    },

    /// The macrostate could not be encoded.
    #[error("encoding error: {source}")]
    Encode {
        /// The underlying error.
        #[from]
        source: EncodeError,
    },

    /// A snapshot could not be restored.
    #[error("checkpoint error: {source}")]
    Checkpoint {
        /// The underlying error.
        #[from]
        source: CheckpointError,
    },

    /// An archived snapshot could not be loaded.
    #[error("archive error: {source}")]
    Archive {
        /// The underlying error.
        #[from]
        source: ArchiveError,
    },
}

// ---------------------------------------------------------------------------
// Node state and collaborators
// ---------------------------------------------------------------------------

/// Everything the loop owns about one lattice.
#[derive(Debug)]
pub struct NodeState<N: NumericValue = f64> {
    /// The lattice.
    pub engine: LatticeEngine<N>,
    /// Consensus hysteresis.
    pub detector: ConsensusDetector,
    /// In-memory snapshots.
    pub checkpoints: CheckpointManager<N>,
    /// Commitment encoder.
    pub encoder: StateEncoder,
    /// Consistency checks run at each checkpoint.
    pub integrity: IntegrityChecker,
}

impl<N: NumericValue> NodeState<N> {
    /// Build every component from configuration.
    pub fn from_config(config: &PhaselockConfig) -> Result<Self, RunnerError> {
        config.validate()?;
        Ok(Self {
            engine: LatticeEngine::new(&config.lattice)?,
            detector: ConsensusDetector::from_config(&config.consensus),
            checkpoints: CheckpointManager::from_config(&config.checkpoint),
            encoder: StateEncoder::from_config(&config.commitment),
            integrity: IntegrityChecker::new(),
        })
    }

    /// Restore the highest-weight snapshot held in memory, if any.
    pub fn resume_from_latest(&mut self) -> Result<Option<SnapshotId>, RunnerError> {
        let Some(id) = self.checkpoints.latest().map(|snapshot| snapshot.id()) else {
            return Ok(None);
        };
        self.restore(id)?;
        Ok(Some(id))
    }

    /// Restore the most advanced snapshot at or before `target_evolution`.
    pub fn resume_at(&mut self, target_evolution: u64) -> Result<Option<SnapshotId>, RunnerError> {
        let Some(id) = self
            .checkpoints
            .resume_point(target_evolution)
            .map(|snapshot| snapshot.id())
        else {
            return Ok(None);
        };
        self.restore(id)?;
        Ok(Some(id))
    }

    /// Fetch an archived snapshot and restore it.
    pub async fn resume_from_archive<B: BlobStore>(
        &mut self,
        archiver: &SnapshotArchiver<B>,
        content_id: &ContentId,
    ) -> Result<SnapshotId, RunnerError> {
        let id = archiver.load_into(content_id, &mut self.checkpoints).await?;
        self.restore(id)?;
        Ok(id)
    }

    fn restore(&mut self, id: SnapshotId) -> Result<(), RunnerError> {
        self.checkpoints
            .restore(id, &mut self.engine, &mut self.detector)?;
        self.integrity.reset();
        Ok(())
    }
}

/// External collaborators the loop talks to.
#[derive(Debug)]
pub struct Services<T> {
    /// Queue to the ledger and blob-store worker.
    pub dispatcher: Dispatcher,
    /// Telemetry destination.
    pub telemetry: T,
}

/// Loop cadences taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSchedule {
    /// Steps between snapshot captures.
    pub checkpoint_interval: u64,
    /// Whether captures are exported to the blob store.
    pub export_snapshots: bool,
    /// Steps between commitments (0 = only on lock).
    pub commit_interval: u64,
    /// Whether the locking step is committed.
    pub commit_on_lock: bool,
    /// Steps between telemetry frames (0 = only on lock).
    pub telemetry_interval: u64,
    /// Wall-clock pacing.
    pub pacing: PacingConfig,
}

impl RunSchedule {
    /// Read cadences from configuration.
    pub fn from_config(config: &PhaselockConfig) -> Self {
        Self {
            checkpoint_interval: config.checkpoint.interval,
            export_snapshots: config.checkpoint.export,
            commit_interval: config.commitment.interval,
            commit_on_lock: config.commitment.commit_on_lock,
            telemetry_interval: config.telemetry.interval,
            pacing: config.pacing.clone(),
        }
    }
}

/// Whether `count` lands on a positive `interval`.
fn due(count: u64, interval: u64) -> bool {
    count.checked_rem(interval) == Some(0)
}

// ---------------------------------------------------------------------------
// Callbacks and results
// ---------------------------------------------------------------------------

/// Called after every step that advanced the lattice.
pub trait StepCallback<N: NumericValue>: Send {
    /// Inspect the step's report and the engine after it.
    fn on_step(&mut self, report: &StepReport, engine: &LatticeEngine<N>);
}

/// A callback that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCallback;

impl<N: NumericValue> StepCallback<N> for NoOpCallback {
    fn on_step(&mut self, _report: &StepReport, _engine: &LatticeEngine<N>) {}
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    /// Why the loop stopped.
    pub end_reason: RunEndReason,
    /// Steps that advanced the lattice in this run.
    pub steps_run: u64,
    /// Report of the last advancing step.
    pub final_report: Option<StepReport>,
    /// Macrostate when the loop stopped.
    pub final_state: LatticeState,
    /// The last commitment queued for the ledger.
    pub last_commitment: Option<Commitment>,
    /// Commitments queued for the ledger.
    pub commitments: u64,
    /// Snapshots captured.
    pub checkpoints: u64,
    /// Exports queued for the blob store.
    pub exports: u64,
    /// Commitments and exports dropped on a full delivery queue.
    pub dropped_deliveries: u64,
    /// Steps that absorbed a numeric fault.
    pub degraded_steps: u64,
    /// Timing monitor violations.
    pub timing_violations: u64,
    /// Failed integrity checks.
    pub integrity_violations: u64,
}

#[derive(Debug, Default)]
struct Tally {
    steps_run: u64,
    final_report: Option<StepReport>,
    last_commitment: Option<Commitment>,
    commitments: u64,
    checkpoints: u64,
    exports: u64,
    degraded_steps: u64,
    integrity_violations: u64,
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Run the evolution loop until a stop condition is met.
///
/// Ends when the operator stops the run, when `run.max_steps` steps have
/// advanced, or when the lattice locks and the operator is not holding
/// the loop for an epoch reset.
pub async fn run_evolution<N, T>(
    node: &mut NodeState<N>,
    services: &mut Services<T>,
    schedule: &RunSchedule,
    operator: &Arc<OperatorState>,
    callback: &mut dyn StepCallback<N>,
) -> Result<RunResult, RunnerError>
where
    N: NumericValue,
    T: TelemetrySink,
{
    let mut pacer = StepPacer::new(
        &schedule.pacing,
        node.engine.steps_per_second(),
        node.engine.evolution_count(),
    );
    let mut monitor = TimingMonitor::new(pacer.step_interval());
    let mut tally = Tally::default();

    info!(
        slots = node.engine.len(),
        dimensions = ?node.engine.dimensions(),
        seed = node.engine.seed(),
        evolution_count = node.engine.evolution_count(),
        eps = node.detector.eps(),
        required_steps = node.detector.required_steps(),
        max_steps = operator.max_steps(),
        pacing = pacer.is_enabled(),
        "Evolution starting"
    );

    let end_reason = loop {
        // --- Pause ---
        if operator.is_paused() {
            info!("Evolution paused, waiting for resume");
            operator.wait_if_paused().await;
            info!("Evolution resumed");
        }

        // --- Stop ---
        if operator.is_stop_requested() {
            info!("Operator stop requested");
            break RunEndReason::OperatorStop;
        }

        // --- Lock ---
        if node.engine.is_locked() {
            if operator.take_epoch_reset() {
                node.detector.reset_epoch(&mut node.engine);
                pacer.rebase(node.engine.evolution_count());
            } else if operator.holds_on_lock() {
                tokio::time::sleep(LOCKED_IDLE).await;
                continue;
            } else {
                break RunEndReason::ConsensusLocked;
            }
        }

        // --- Step ---
        let started = Instant::now();
        let StepOutcome::Advanced(report) = node.engine.step() else {
            continue;
        };
        // Unpaced runs have no schedule to miss.
        if pacer.is_enabled() {
            monitor.record(started.elapsed());
        }
        tally.steps_run = tally.steps_run.saturating_add(1);
        if report.degraded {
            tally.degraded_steps = tally.degraded_steps.saturating_add(1);
        }
        let transition = node.detector.observe(&mut node.engine);
        let locked_now = transition == ConsensusTransition::Locked;
        let count = report.evolution_count;
        callback.on_step(&report, &node.engine);
        tally.final_report = Some(report);

        // --- Checkpoint ---
        if due(count, schedule.checkpoint_interval) {
            checkpoint(node, &mut services.dispatcher, schedule, &mut tally);
        }

        // --- Telemetry ---
        if locked_now || due(count, schedule.telemetry_interval) {
            services
                .telemetry
                .emit(frame(&node.engine, report.degraded))
                .await;
        }

        // --- Commit ---
        if (locked_now && schedule.commit_on_lock) || due(count, schedule.commit_interval) {
            let (commitment, outcome) = node
                .encoder
                .commit(&node.engine, &mut services.dispatcher)?;
            debug!(evolution_count = count, outcome = ?outcome, "Commitment handled");
            if outcome == DispatchOutcome::Enqueued {
                tally.commitments = tally.commitments.saturating_add(1);
            }
            tally.last_commitment = Some(commitment);
        }

        if locked_now && !operator.holds_on_lock() {
            break RunEndReason::ConsensusLocked;
        }

        // --- Step limit ---
        if operator.step_limit_reached(tally.steps_run) {
            info!(
                steps_run = tally.steps_run,
                max_steps = operator.max_steps(),
                "Step limit reached"
            );
            break RunEndReason::MaxStepsReached;
        }

        // --- Pace ---
        pacer.pace(count).await;
    };

    operator.set_end_reason(end_reason).await;
    Ok(RunResult {
        end_reason,
        steps_run: tally.steps_run,
        final_report: tally.final_report,
        final_state: *node.engine.state(),
        last_commitment: tally.last_commitment,
        commitments: tally.commitments,
        checkpoints: tally.checkpoints,
        exports: tally.exports,
        dropped_deliveries: services.dispatcher.dropped(),
        degraded_steps: tally.degraded_steps,
        timing_violations: monitor.violations(),
        integrity_violations: tally.integrity_violations,
    })
}

/// Capture, check, and optionally queue an export of one snapshot.
fn checkpoint<N: NumericValue>(
    node: &mut NodeState<N>,
    dispatcher: &mut Dispatcher,
    schedule: &RunSchedule,
    tally: &mut Tally,
) {
    let id = node.checkpoints.capture(&node.engine);
    tally.checkpoints = tally.checkpoints.saturating_add(1);

    if let Err(violation) = node.integrity.check(&node.engine) {
        error!(snapshot = %id, violation = ?violation, "Integrity check failed");
        tally.integrity_violations = tally.integrity_violations.saturating_add(1);
    }

    if !schedule.export_snapshots {
        return;
    }
    match node.checkpoints.export(id) {
        Ok(bytes) => {
            let export = Export {
                snapshot: id,
                evolution_count: node.engine.evolution_count(),
                bytes,
            };
            if dispatcher.export(export) == DispatchOutcome::Enqueued {
                tally.exports = tally.exports.saturating_add(1);
            }
        }
        Err(err) => warn!(snapshot = %id, error = %err, "Snapshot export failed"),
    }
}

/// Log the end of a run.
pub fn log_run_end(result: &RunResult) {
    info!(
        reason = ?result.end_reason,
        steps_run = result.steps_run,
        evolution_count = result.final_state.evolution_count,
        phase_variance = result.final_state.phase_variance,
        consensus_locked = result.final_state.consensus_locked(),
        commitments = result.commitments,
        checkpoints = result.checkpoints,
        "Evolution ended"
    );
    if result.degraded_steps > 0
        || result.timing_violations > 0
        || result.integrity_violations > 0
        || result.dropped_deliveries > 0
    {
        warn!(
            degraded_steps = result.degraded_steps,
            timing_violations = result.timing_violations,
            integrity_violations = result.integrity_violations,
            dropped_deliveries = result.dropped_deliveries,
            "Run absorbed faults"
        );
    }
    if result.final_report.is_none() {
        warn!("Evolution ended with no steps executed");
    }
}
