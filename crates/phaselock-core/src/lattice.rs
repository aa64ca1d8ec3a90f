//! The lattice engine: owns the slots and advances them one step at a time.
//!
//! A step runs in a fixed order:
//!
//! 1. Return immediately if the lattice is locked.
//! 2. Integrate every slot with full-system RK4 from the committed buffer.
//! 3. Apply the entropy dampers: `exp(-lambda dt)` decay, magnitude
//!    saturation, and the deterministic noise kick.
//! 4. Replace any non-finite amplitude with its previous value.
//! 5. Re-derive phase and phase velocity, then swap the shadow buffer in.
//! 6. Advance the evolution count and logical clock, recompute the phase
//!    variance and the state hash.
//!
//! Numeric faults never abort a step. They are absorbed in place and
//! reported through the slot flags and [`StepReport::degraded`].

use phaselock_types::{
    Amplitude, Digest, LatticeState, LockState, NumericValue, Slot, SlotFlags, circular_stats,
    wrap_phase,
};
use tracing::{debug, warn};

use crate::config::{ConfigError, LatticeConfig};
use crate::integrator::{Dynamics, Integrated, Rk4Workspace, fill};
use crate::noise::{Lane, det_signed_lane, det_unit_lane};
use crate::topology::Topology;

/// Nanoseconds per second, for the logical clock.
const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Errors that can occur when building a lattice.
#[derive(Debug, thiserror::Error)]
pub enum LatticeError {
    /// The lattice section of the configuration is invalid.
    #[error("invalid lattice configuration: {source}")]
    Config {
        /// The underlying validation error.
        #[from]
        source: ConfigError,
    },

    /// The slot count does not fit in memory on this platform.
    #[error("lattice of {slots} slots cannot be addressed on this platform")]
    TooLarge {
        /// Requested slot count.
        slots: u64,
    },
}

/// What a call to [`LatticeEngine::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The lattice advanced by one step.
    Advanced(StepReport),
    /// The lattice is locked; nothing changed.
    Frozen {
        /// The evolution count the lattice is frozen at.
        evolution_count: u64,
    },
}

impl StepOutcome {
    /// The report, if the lattice advanced.
    pub const fn report(&self) -> Option<&StepReport> {
        match self {
            Self::Advanced(report) => Some(report),
            Self::Frozen { .. } => None,
        }
    }
}

/// Per-step fault counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepReport {
    /// Evolution count after the step.
    pub evolution_count: u64,
    /// Slots whose division was floored.
    pub floored: usize,
    /// Slots clamped to the saturation limit.
    pub saturated: usize,
    /// Slots whose non-finite result was replaced by the previous value.
    pub replaced: usize,
    /// Whether any of the counts above is non-zero.
    pub degraded: bool,
}

/// Dynamics constants in the engine's numeric type.
#[derive(Debug, Clone, Copy)]
struct Params<N> {
    dynamics: Dynamics<N>,
    dt: N,
    damping: Option<N>,
    saturation_limit: N,
    noise_sigma: Option<N>,
}

/// The coupled-oscillator lattice.
///
/// Generic over the numeric type; `f64` is the default hot path.
#[derive(Debug, Clone)]
pub struct LatticeEngine<N: NumericValue = f64> {
    seed: u64,
    steps_per_second: u32,
    parallel_threshold: usize,
    params: Params<N>,
    topology: Topology,
    frequencies: Vec<N>,
    slots: Vec<Slot<N>>,
    shadow: Vec<Slot<N>>,
    committed: Vec<Amplitude<N>>,
    integrated: Vec<Integrated<N>>,
    workspace: Rk4Workspace<N>,
    state: LatticeState,
}

impl<N: NumericValue> LatticeEngine<N> {
    /// Build a lattice from configuration.
    ///
    /// Slots start at unit magnitude with phases drawn uniformly from
    /// `[-spread, spread)`; natural frequencies are drawn around
    /// `base_frequency`. Both draws are keyed by the seed.
    #[allow(clippy::arithmetic_side_effects)]
    pub fn new(config: &LatticeConfig) -> Result<Self, LatticeError> {
        config.validate()?;
        let slots_requested = config.slot_count().unwrap_or(u64::MAX);
        let len = usize::try_from(slots_requested).map_err(|_err| LatticeError::TooLarge {
            slots: slots_requested,
        })?;

        let topology = Topology::new(&config.dimensions);
        let seed = config.seed;

        let frequencies = (0..len)
            .map(|i| {
                let u = det_unit_lane(seed, 0, i as u64, Lane::Frequency);
                N::from_f64(config.frequency_spread.mul_add(u - 0.5, config.base_frequency))
            })
            .collect();

        let slots: Vec<Slot<N>> = topology
            .iter()
            .enumerate()
            .map(|(i, neighbors)| {
                let theta = config.initial_phase_spread
                    * det_signed_lane(seed, 0, i as u64, Lane::InitialPhase);
                Slot::new(
                    Amplitude::from_polar(N::one(), N::from_f64(theta)),
                    *neighbors,
                )
            })
            .collect();

        let dt = N::from_f64(config.dt_seconds());
        let params = Params {
            dynamics: Dynamics::new(config.gamma, config.k_coupling),
            dt,
            damping: (config.lambda > 0.0)
                .then(|| N::from_f64((-config.lambda * config.dt_seconds()).exp())),
            saturation_limit: N::from_f64(config.saturation_limit),
            noise_sigma: (config.noise_sigma > 0.0).then(|| N::from_f64(config.noise_sigma)),
        };

        let mut engine = Self {
            seed,
            steps_per_second: config.steps_per_second,
            parallel_threshold: config.parallel_threshold,
            params,
            frequencies,
            shadow: slots.clone(),
            committed: vec![Amplitude::zero(); len],
            integrated: vec![
                Integrated {
                    amplitude: Amplitude::zero(),
                    floored: false,
                };
                len
            ],
            workspace: Rk4Workspace::new(len),
            slots,
            topology,
            state: LatticeState::genesis(),
        };
        engine.refresh_macrostate();

        debug!(
            slots = len,
            dimensions = ?config.dimensions,
            seed,
            "Lattice initialized"
        );
        Ok(engine)
    }

    /// Advance every slot by one step.
    ///
    /// A locked lattice is left untouched and reports
    /// [`StepOutcome::Frozen`].
    pub fn step(&mut self) -> StepOutcome {
        if self.state.consensus_locked() {
            return StepOutcome::Frozen {
                evolution_count: self.state.evolution_count,
            };
        }

        let parallel = self.slots.len() >= self.parallel_threshold;
        let step_index = self.state.evolution_count;

        // Committed buffer y_n.
        {
            let slots = &self.slots;
            fill(&mut self.committed, parallel, |i| {
                slots.get(i).map_or_else(Amplitude::zero, |s| s.amplitude)
            });
        }

        self.workspace.integrate(
            &self.committed,
            self.params.dt,
            &self.topology,
            &self.frequencies,
            &self.params.dynamics,
            parallel,
            &mut self.integrated,
        );

        {
            let previous = &self.slots;
            let integrated = &self.integrated;
            let params = &self.params;
            let seed = self.seed;
            fill(&mut self.shadow, parallel, |i| {
                finish_slot(i, previous, integrated, params, seed, step_index)
            });
        }
        core::mem::swap(&mut self.slots, &mut self.shadow);

        let mut report = StepReport::default();
        for slot in &self.slots {
            if slot.flags.contains(SlotFlags::FLOORED) {
                report.floored = report.floored.saturating_add(1);
            }
            if slot.flags.contains(SlotFlags::SATURATED) {
                report.saturated = report.saturated.saturating_add(1);
            }
            if slot.flags.contains(SlotFlags::DEGRADED) {
                report.replaced = report.replaced.saturating_add(1);
            }
        }
        report.degraded = report.floored > 0 || report.saturated > 0 || report.replaced > 0;

        self.state.evolution_count = self.state.evolution_count.saturating_add(1);
        self.state.timestamp_ns = self.timestamp_for(self.state.evolution_count);
        self.refresh_macrostate();
        report.evolution_count = self.state.evolution_count;

        if report.degraded {
            warn!(
                evolution_count = report.evolution_count,
                floored = report.floored,
                saturated = report.saturated,
                replaced = report.replaced,
                "Degraded step"
            );
        }
        StepOutcome::Advanced(report)
    }

    /// The live macrostate.
    pub const fn state(&self) -> &LatticeState {
        &self.state
    }

    /// The slot array in index order.
    pub fn slots(&self) -> &[Slot<N>] {
        &self.slots
    }

    /// Slot phases in index order.
    pub fn phases(&self) -> impl Iterator<Item = N> + Clone + '_ {
        self.slots.iter().map(|slot| slot.phase)
    }

    /// Completed steps.
    pub const fn evolution_count(&self) -> u64 {
        self.state.evolution_count
    }

    /// Circular phase variance after the last step.
    pub const fn phase_variance(&self) -> f64 {
        self.state.phase_variance
    }

    /// Whether consensus is locked.
    pub const fn is_locked(&self) -> bool {
        self.state.consensus_locked()
    }

    /// Dimension sizes.
    pub fn dimensions(&self) -> &[u32] {
        self.topology.dimensions()
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the lattice has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Seed for deterministic draws.
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Steps per simulated second.
    pub const fn steps_per_second(&self) -> u32 {
        self.steps_per_second
    }

    /// Step length in seconds.
    pub fn dt(&self) -> N {
        self.params.dt
    }

    /// The neighbor topology.
    pub const fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Logical timestamp of step `evolution_count`.
    pub fn timestamp_for(&self, evolution_count: u64) -> u64 {
        u128::from(evolution_count)
            .checked_mul(NANOS_PER_SECOND)
            .and_then(|ns| ns.checked_div(u128::from(self.steps_per_second)))
            .and_then(|ns| u64::try_from(ns).ok())
            .unwrap_or(u64::MAX)
    }

    /// Set the consensus lock. Only the consensus detector and checkpoint
    /// restore move the lock.
    pub(crate) const fn set_lock(&mut self, lock: LockState) {
        self.state.lock = lock;
    }

    /// Replace the live lattice wholesale.
    ///
    /// The caller has already checked that `slots` matches this topology.
    pub(crate) fn replace(&mut self, state: LatticeState, slots: &[Slot<N>]) {
        self.slots.clear();
        self.slots.extend_from_slice(slots);
        self.shadow.clone_from(&self.slots);
        self.state = state;
    }

    /// Recompute variance and hash from the current slots.
    fn refresh_macrostate(&mut self) {
        let stats = circular_stats(self.slots.iter().map(|slot| slot.phase.to_f64()));
        self.state.phase_variance = stats.variance;
        self.state.state_hash = state_hash(
            self.state.evolution_count,
            stats.variance,
            self.slots.iter().map(|slot| slot.phase),
        );
    }
}

/// BLAKE3 over the evolution count, variance bits, and canonical phases.
pub fn state_hash<N: NumericValue>(
    evolution_count: u64,
    phase_variance: f64,
    phases: impl Iterator<Item = N>,
) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&evolution_count.to_be_bytes());
    hasher.update(&phase_variance.to_bits().to_be_bytes());
    let mut buf = Vec::with_capacity(N::CANONICAL_WIDTH);
    for phase in phases {
        buf.clear();
        phase.write_canonical(&mut buf);
        hasher.update(&buf);
    }
    Digest::from(hasher.finalize())
}

/// Apply dampers, fault handling, and phase bookkeeping to one slot.
#[allow(clippy::arithmetic_side_effects)]
fn finish_slot<N: NumericValue>(
    index: usize,
    previous: &[Slot<N>],
    integrated: &[Integrated<N>],
    params: &Params<N>,
    seed: u64,
    step_index: u64,
) -> Slot<N> {
    let (Some(prev), Some(result)) = (previous.get(index), integrated.get(index)) else {
        return Slot::new(Amplitude::zero(), phaselock_types::NeighborSet::new());
    };

    let mut flags = SlotFlags::NONE;
    if result.floored {
        flags.insert(SlotFlags::FLOORED);
    }

    let mut amplitude = result.amplitude;
    if let Some(damping) = params.damping {
        amplitude = amplitude.scale(damping);
    }

    let magnitude = amplitude.magnitude();
    if magnitude > params.saturation_limit {
        amplitude = amplitude.scale(params.saturation_limit / magnitude);
        flags.insert(SlotFlags::SATURATED);
    }

    if let Some(sigma) = params.noise_sigma {
        let slot = index as u64;
        let kick_re = N::from_f64(det_signed_lane(seed, step_index, slot, Lane::NoiseRe));
        let kick_im = N::from_f64(det_signed_lane(seed, step_index, slot, Lane::NoiseIm));
        amplitude = amplitude + Amplitude::new(sigma * kick_re, sigma * kick_im);
    }

    if !amplitude.is_finite() {
        amplitude = prev.amplitude;
        flags.insert(SlotFlags::DEGRADED);
    }

    let phase = wrap_phase(amplitude.phase());
    let phase_velocity = wrap_phase(phase - prev.phase) / params.dt;

    Slot {
        amplitude,
        phase,
        phase_velocity,
        flags,
        neighbors: prev.neighbors,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    fn config() -> LatticeConfig {
        LatticeConfig::default()
    }

    fn advance(engine: &mut LatticeEngine, steps: u64) {
        for _ in 0..steps {
            engine.step();
        }
    }

    #[test]
    fn new_engine_has_canonical_phases_and_hash() {
        let engine = LatticeEngine::<f64>::new(&config()).unwrap();
        assert_eq!(engine.len(), 8);
        assert_eq!(engine.evolution_count(), 0);
        assert_ne!(engine.state().state_hash, Digest::ZERO);
        for phase in engine.phases() {
            assert!(phase > -core::f64::consts::PI && phase <= core::f64::consts::PI);
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let mut cfg = config();
        cfg.dimensions = vec![];
        assert!(matches!(
            LatticeEngine::<f64>::new(&cfg),
            Err(LatticeError::Config { .. })
        ));
    }

    #[test]
    fn step_advances_count_and_clock() {
        let mut engine = LatticeEngine::<f64>::new(&config()).unwrap();
        let outcome = engine.step();
        let report = outcome.report().unwrap();
        assert_eq!(report.evolution_count, 1);
        assert_eq!(engine.evolution_count(), 1);
        // 1 / 32768 s = 30517.578125 ns, floored.
        assert_eq!(engine.state().timestamp_ns, 30_517);
        assert_eq!(engine.timestamp_for(32_768), 1_000_000_000);
    }

    #[test]
    fn identical_engines_are_bit_identical() {
        let mut a = LatticeEngine::<f64>::new(&config()).unwrap();
        let mut b = LatticeEngine::<f64>::new(&config()).unwrap();
        for _ in 0..500 {
            a.step();
            b.step();
            assert_eq!(
                a.phase_variance().to_bits(),
                b.phase_variance().to_bits()
            );
        }
        assert_eq!(a.state().state_hash, b.state().state_hash);
    }

    #[test]
    fn different_seeds_diverge() {
        let a = LatticeEngine::<f64>::new(&config()).unwrap();
        let mut cfg = config();
        cfg.seed = 43;
        let b = LatticeEngine::<f64>::new(&cfg).unwrap();
        assert_ne!(a.state().state_hash, b.state().state_hash);
    }

    #[test]
    fn parallel_path_matches_sequential() {
        let mut cfg = config();
        cfg.dimensions = vec![8, 8];
        cfg.noise_sigma = 1e-6;
        let mut seq = LatticeEngine::<f64>::new(&cfg).unwrap();
        cfg.parallel_threshold = 1;
        let mut par = LatticeEngine::<f64>::new(&cfg).unwrap();
        advance(&mut seq, 50);
        advance(&mut par, 50);
        assert_eq!(seq.state().state_hash, par.state().state_hash);
    }

    #[test]
    fn locked_engine_does_not_move() {
        let mut engine = LatticeEngine::<f64>::new(&config()).unwrap();
        advance(&mut engine, 3);
        engine.set_lock(LockState::Locked);
        let before = *engine.state();
        let slots_before = engine.slots().to_vec();
        let outcome = engine.step();
        assert_eq!(outcome, StepOutcome::Frozen { evolution_count: 3 });
        assert_eq!(engine.state(), &before);
        assert_eq!(engine.slots(), slots_before.as_slice());
    }

    #[test]
    fn saturation_clamps_magnitude() {
        let mut cfg = config();
        cfg.saturation_limit = 0.5;
        let mut engine = LatticeEngine::<f64>::new(&cfg).unwrap();
        let report = *engine.step().report().unwrap();
        assert_eq!(report.saturated, 8);
        assert!(report.degraded);
        for slot in engine.slots() {
            assert!(slot.amplitude.magnitude() <= 0.5 + 1e-6);
            assert!(slot.flags.contains(SlotFlags::SATURATED));
        }
    }

    #[test]
    fn collapsed_slot_is_floored_not_fatal() {
        let mut engine = LatticeEngine::<f64>::new(&config()).unwrap();
        let mut slots = engine.slots().to_vec();
        slots.first_mut().unwrap().amplitude = Amplitude::zero();
        let state = *engine.state();
        engine.replace(state, &slots);
        let report = *engine.step().report().unwrap();
        assert!(report.floored >= 1);
        assert!(report.degraded);
        for slot in engine.slots() {
            assert!(slot.amplitude.is_finite());
        }
    }

    #[test]
    fn non_finite_amplitude_keeps_previous_value() {
        let mut engine = LatticeEngine::<f64>::new(&config()).unwrap();
        let mut slots = engine.slots().to_vec();
        slots.first_mut().unwrap().amplitude = Amplitude::new(f64::MAX, f64::MAX);
        let state = *engine.state();
        engine.replace(state, &slots);
        let report = *engine.step().report().unwrap();
        assert!(report.degraded);
        for slot in engine.slots() {
            assert!(slot.amplitude.is_finite());
            assert!(slot.phase.is_finite());
        }
    }

    #[test]
    fn phase_velocity_tracks_rotation() {
        let mut cfg = config();
        cfg.dimensions = vec![1];
        cfg.initial_phase_spread = 0.0;
        cfg.base_frequency = 3.0;
        cfg.noise_sigma = 0.0;
        cfg.lambda = 0.0;
        let mut engine = LatticeEngine::<f64>::new(&cfg).unwrap();
        advance(&mut engine, 10);
        let slot = engine.slots().first().unwrap();
        assert!((slot.phase_velocity + 3.0).abs() < 1e-6);
    }

    #[test]
    fn phases_stay_canonical_over_many_steps() {
        let mut cfg = config();
        cfg.base_frequency = 5000.0;
        let mut engine = LatticeEngine::<f64>::new(&cfg).unwrap();
        for _ in 0..200 {
            engine.step();
            for phase in engine.phases() {
                assert!(phase > -core::f64::consts::PI && phase <= core::f64::consts::PI);
            }
            assert!(engine.phase_variance() >= 0.0);
        }
    }

    #[test]
    fn decimal_engine_steps() {
        let mut cfg = config();
        cfg.dimensions = vec![4];
        let mut engine = LatticeEngine::<Decimal>::new(&cfg).unwrap();
        engine.step();
        engine.step();
        assert_eq!(engine.evolution_count(), 2);
        assert!(engine.phase_variance() >= 0.0);
        for slot in engine.slots() {
            assert!(slot.flags.is_empty());
        }
    }
}
