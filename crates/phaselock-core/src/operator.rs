//! Operator control shared between the evolution loop and the node.
//!
//! Signal handlers and any future control surface hold an `Arc` of
//! [`OperatorState`]; the loop polls it between steps. Requests never
//! interrupt a step in flight.
//!
//! # Architecture
//!
//! Flags are atomics so the loop reads them without locking on the hot
//! path. The end reason sits behind a [`tokio::sync::Mutex`] because it is
//! written once and read after the loop exits.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use crate::config::RunConfig;

/// Why the evolution loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEndReason {
    /// Reached the configured `max_steps` limit.
    MaxStepsReached,
    /// The lattice locked and no epoch reset was requested.
    ConsensusLocked,
    /// An operator issued a stop.
    OperatorStop,
}

/// Shared operator control state.
#[derive(Debug)]
pub struct OperatorState {
    /// Whether the loop is currently paused.
    paused: AtomicBool,

    /// Wakes the loop on resume.
    resume_notify: Notify,

    /// Whether a stop has been requested.
    stop_requested: AtomicBool,

    /// Whether a new consensus epoch has been requested.
    reset_requested: AtomicBool,

    /// Whether the loop should keep idling after a lock instead of ending.
    hold_on_lock: AtomicBool,

    /// Wall-clock time the run started.
    started_at: DateTime<Utc>,

    /// Step limit (0 = unlimited).
    max_steps: u64,

    /// Why the run ended, once it has.
    end_reason: Mutex<Option<RunEndReason>>,
}

impl OperatorState {
    /// Create operator state from run configuration.
    pub fn new(run: &RunConfig) -> Self {
        Self {
            paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            stop_requested: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            hold_on_lock: AtomicBool::new(false),
            started_at: Utc::now(),
            max_steps: run.max_steps,
            end_reason: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Pause / Resume
    // -----------------------------------------------------------------------

    /// Whether the loop is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Pause the loop after the current step.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resume the loop and wake it.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.resume_notify.notify_one();
    }

    /// Wait until the loop is no longer paused.
    ///
    /// Returns immediately if not paused. A stop request also wakes it.
    pub async fn wait_if_paused(&self) {
        while self.paused.load(Ordering::Acquire) && !self.is_stop_requested() {
            self.resume_notify.notified().await;
        }
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// Request a clean stop between steps.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.resume_notify.notify_one();
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Record why the run ended.
    pub async fn set_end_reason(&self, reason: RunEndReason) {
        *self.end_reason.lock().await = Some(reason);
    }

    /// Why the run ended, if it has.
    pub async fn end_reason(&self) -> Option<RunEndReason> {
        *self.end_reason.lock().await
    }

    // -----------------------------------------------------------------------
    // Epochs
    // -----------------------------------------------------------------------

    /// Ask the loop to unlock the lattice and start a new epoch.
    pub fn request_epoch_reset(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }

    /// Consume a pending epoch reset request.
    pub fn take_epoch_reset(&self) -> bool {
        self.reset_requested.swap(false, Ordering::AcqRel)
    }

    /// Keep the loop alive after a lock so an epoch reset can follow.
    pub fn set_hold_on_lock(&self, hold: bool) {
        self.hold_on_lock.store(hold, Ordering::Release);
    }

    /// Whether the loop idles after a lock instead of ending.
    pub fn holds_on_lock(&self) -> bool {
        self.hold_on_lock.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Boundaries
    // -----------------------------------------------------------------------

    /// Whether `steps` run so far meet the step limit.
    pub const fn step_limit_reached(&self, steps: u64) -> bool {
        self.max_steps > 0 && steps >= self.max_steps
    }

    /// Configured step limit.
    pub const fn max_steps(&self) -> u64 {
        self.max_steps
    }

    /// Wall-clock start of the run.
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Seconds since the run started.
    pub fn elapsed_seconds(&self) -> u64 {
        let elapsed = Utc::now()
            .signed_duration_since(self.started_at)
            .num_seconds();
        u64::try_from(elapsed.max(0)).unwrap_or(u64::MAX)
    }
}

/// Serializable run status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    /// Current evolution count.
    pub evolution_count: u64,
    /// Current phase variance.
    pub phase_variance: f64,
    /// Whether consensus is locked.
    pub consensus_locked: bool,
    /// Whether the loop is paused.
    pub paused: bool,
    /// Whether a stop has been requested.
    pub stop_requested: bool,
    /// Seconds since start.
    pub elapsed_seconds: u64,
    /// Why the run ended, if it has.
    pub end_reason: Option<RunEndReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlimited() -> OperatorState {
        OperatorState::new(&RunConfig::default())
    }

    #[test]
    fn initial_state_is_running() {
        let state = unlimited();
        assert!(!state.is_paused());
        assert!(!state.is_stop_requested());
        assert!(!state.take_epoch_reset());
    }

    #[test]
    fn pause_and_resume() {
        let state = unlimited();
        state.pause();
        assert!(state.is_paused());
        state.resume();
        assert!(!state.is_paused());
    }

    #[test]
    fn epoch_reset_is_consumed_once() {
        let state = unlimited();
        state.request_epoch_reset();
        assert!(state.take_epoch_reset());
        assert!(!state.take_epoch_reset());
    }

    #[test]
    fn zero_step_limit_means_unlimited() {
        assert!(!unlimited().step_limit_reached(u64::MAX));
    }

    #[test]
    fn step_limit_reached() {
        let state = OperatorState::new(&RunConfig {
            max_steps: 100,
            resume: false,
        });
        assert!(!state.step_limit_reached(99));
        assert!(state.step_limit_reached(100));
    }

    #[tokio::test]
    async fn stop_wakes_paused_loop() {
        let state = unlimited();
        state.pause();
        state.request_stop();
        state.wait_if_paused().await;
        assert!(state.is_stop_requested());
    }

    #[tokio::test]
    async fn end_reason_round_trip() {
        let state = unlimited();
        assert_eq!(state.end_reason().await, None);
        state.set_end_reason(RunEndReason::ConsensusLocked).await;
        assert_eq!(state.end_reason().await, Some(RunEndReason::ConsensusLocked));
    }
}
