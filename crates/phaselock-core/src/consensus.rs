//! Consensus detection with hysteresis.
//!
//! The detector watches the per-step phase variance. A step whose variance
//! is below `eps` extends the run of qualifying steps; any other step resets
//! it. Once the run reaches `required_steps` the lattice locks, and the
//! detector stays inert until [`ConsensusDetector::reset_epoch`] starts a
//! new epoch.

use serde::{Deserialize, Serialize};
use tracing::info;

use phaselock_types::{LockState, NumericValue};

use crate::config::ConsensusConfig;
use crate::lattice::LatticeEngine;

/// Versioned threshold pairs for deployments that disagree on values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusPreset {
    /// `eps = 1e-6`, `required_steps = 100`.
    Strict,
    /// `eps = 0.005`, `required_steps = 10`.
    Relaxed,
}

impl ConsensusPreset {
    /// Variance threshold for this preset.
    pub const fn eps(self) -> f64 {
        match self {
            Self::Strict => 1e-6,
            Self::Relaxed => 0.005,
        }
    }

    /// Consecutive qualifying steps for this preset.
    pub const fn required_steps(self) -> u64 {
        match self {
            Self::Strict => 100,
            Self::Relaxed => 10,
        }
    }
}

/// What one observation did to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusTransition {
    /// Variance qualified; the run grew but has not reached the threshold.
    Accumulating {
        /// Length of the current run.
        consensus_steps: u64,
    },
    /// Variance did not qualify; the run was reset to zero.
    Reset,
    /// This observation completed the run and locked the lattice.
    Locked,
    /// The detector was already locked; nothing changed.
    AlreadyLocked,
}

/// Hysteresis counter over phase variance.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusDetector {
    eps: f64,
    required_steps: u64,
    consensus_steps: u64,
    locked: bool,
}

impl ConsensusDetector {
    /// Create a detector with explicit thresholds.
    pub const fn new(eps: f64, required_steps: u64) -> Self {
        Self {
            eps,
            required_steps,
            consensus_steps: 0,
            locked: false,
        }
    }

    /// Create a detector from configuration, honoring any preset.
    pub fn from_config(config: &ConsensusConfig) -> Self {
        let (eps, required_steps) = config.thresholds();
        Self::new(eps, required_steps)
    }

    /// Create a detector from a named preset.
    pub const fn from_preset(preset: ConsensusPreset) -> Self {
        Self::new(preset.eps(), preset.required_steps())
    }

    /// Feed one step's variance.
    ///
    /// Non-finite variance never qualifies.
    pub fn record(&mut self, phase_variance: f64) -> ConsensusTransition {
        if self.locked {
            return ConsensusTransition::AlreadyLocked;
        }
        if !(phase_variance.is_finite() && phase_variance < self.eps) {
            self.consensus_steps = 0;
            return ConsensusTransition::Reset;
        }
        self.consensus_steps = self.consensus_steps.saturating_add(1);
        if self.consensus_steps >= self.required_steps {
            self.locked = true;
            ConsensusTransition::Locked
        } else {
            ConsensusTransition::Accumulating {
                consensus_steps: self.consensus_steps,
            }
        }
    }

    /// Feed the engine's current variance and lock the engine on
    /// transition.
    ///
    /// A locked engine is reported as [`ConsensusTransition::AlreadyLocked`]
    /// even if this detector was never told, so a frozen variance is not
    /// counted twice.
    pub fn observe<N: NumericValue>(&mut self, engine: &mut LatticeEngine<N>) -> ConsensusTransition {
        if engine.is_locked() {
            self.locked = true;
            return ConsensusTransition::AlreadyLocked;
        }
        let transition = self.record(engine.phase_variance());
        if transition == ConsensusTransition::Locked {
            engine.set_lock(LockState::Locked);
            info!(
                evolution_count = engine.evolution_count(),
                phase_variance = engine.phase_variance(),
                consensus_steps = self.consensus_steps,
                "Consensus locked"
            );
        }
        transition
    }

    /// Start a new epoch: unlock the engine and zero the counter.
    pub fn reset_epoch<N: NumericValue>(&mut self, engine: &mut LatticeEngine<N>) {
        engine.set_lock(LockState::Evolving);
        self.clear();
        info!(evolution_count = engine.evolution_count(), "New consensus epoch");
    }

    /// Unlock and zero the counter without touching an engine.
    pub const fn clear(&mut self) {
        self.consensus_steps = 0;
        self.locked = false;
    }

    /// Length of the current run of qualifying steps.
    pub const fn consensus_steps(&self) -> u64 {
        self.consensus_steps
    }

    /// Whether the detector has locked.
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    /// Variance threshold.
    pub const fn eps(&self) -> f64 {
        self.eps
    }

    /// Required run length.
    pub const fn required_steps(&self) -> u64 {
        self.required_steps
    }
}
