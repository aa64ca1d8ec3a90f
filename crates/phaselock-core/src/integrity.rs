//! Periodic consistency checks over the live lattice.
//!
//! A check fails when a phase is outside `(-pi, pi]`, when an amplitude
//! magnitude exceeds [`AMPLITUDE_SANITY_BOUND`], or when the evolution
//! count went backwards since the previous check. The checker also tracks
//! the last state hash it saw.

use tracing::{error, info, warn};

use phaselock_types::{Digest, NumericValue, wrap_phase};

use crate::lattice::LatticeEngine;

/// Largest plausible amplitude magnitude.
pub const AMPLITUDE_SANITY_BOUND: f64 = 1e10;

/// A failed integrity check.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityViolation {
    /// A phase is not in canonical form.
    PhaseNotCanonical {
        /// Offending slot.
        slot: usize,
    },
    /// An amplitude magnitude is implausibly large or not finite.
    AmplitudeOutOfBounds {
        /// Offending slot.
        slot: usize,
        /// Its magnitude.
        magnitude: f64,
    },
    /// The evolution count decreased.
    CountRegressed {
        /// Count at the previous check.
        previous: u64,
        /// Count now.
        current: u64,
    },
}

/// Tracks state-hash changes and validates lattice consistency.
#[derive(Debug, Clone, Default)]
pub struct IntegrityChecker {
    last_evolution_count: Option<u64>,
    last_hash: Option<Digest>,
    checks: u64,
}

impl IntegrityChecker {
    /// Create a checker with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the engine and record its count and hash.
    ///
    /// History is only updated when the check passes.
    pub fn check<N: NumericValue>(
        &mut self,
        engine: &LatticeEngine<N>,
    ) -> Result<(), IntegrityViolation> {
        for (slot, cell) in engine.slots().iter().enumerate() {
            if !cell.phase.is_finite() || wrap_phase(cell.phase) != cell.phase {
                warn!(slot, "Inconsistent phase wrapping");
                return Err(IntegrityViolation::PhaseNotCanonical { slot });
            }
            let magnitude = cell.amplitude.magnitude().to_f64();
            if !(magnitude.is_finite() && magnitude <= AMPLITUDE_SANITY_BOUND) {
                warn!(slot, magnitude, "Unreasonable amplitude");
                return Err(IntegrityViolation::AmplitudeOutOfBounds { slot, magnitude });
            }
        }

        let current = engine.evolution_count();
        if let Some(previous) = self.last_evolution_count {
            if current < previous {
                error!(previous, current, "Evolution count decreased");
                return Err(IntegrityViolation::CountRegressed { previous, current });
            }
        }
        self.last_evolution_count = Some(current);

        let hash = engine.state().state_hash;
        if let Some(previous) = self.last_hash {
            if previous != hash {
                info!(from = %previous, to = %hash, evolution_count = current, "State hash changed");
            }
        }
        self.last_hash = Some(hash);
        self.checks = self.checks.saturating_add(1);
        Ok(())
    }

    /// Forget history, e.g. after a deliberate restore to an earlier state.
    pub const fn reset(&mut self) {
        self.last_evolution_count = None;
        self.last_hash = None;
    }

    /// Last state hash seen by a passing check.
    pub const fn last_hash(&self) -> Option<Digest> {
        self.last_hash
    }

    /// Passing checks so far.
    pub const fn checks(&self) -> u64 {
        self.checks
    }
}
