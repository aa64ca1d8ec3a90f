//! Core data structures for the lattice and its external records.
//!
//! Covers `Slot`, `NeighborSet`, `LatticeState`, `Commitment`, and
//! `TelemetryFrame`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amplitude::Amplitude;
use crate::digest::Digest;
use crate::numeric::NumericValue;

// ---------------------------------------------------------------------------
// Slot flags
// ---------------------------------------------------------------------------

/// Per-slot status bits set during the most recent step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotFlags(pub u8);

impl SlotFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// The step produced a non-finite value and the previous amplitude was
    /// kept.
    pub const DEGRADED: Self = Self(1);
    /// The amplitude magnitude was clamped to the saturation limit.
    pub const SATURATED: Self = Self(1 << 1);
    /// A complex division floored this slot's magnitude to epsilon.
    pub const FLOORED: Self = Self(1 << 2);

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set every bit of `other`.
    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Whether no bits are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitOr for SlotFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Neighbor set
// ---------------------------------------------------------------------------

/// Maximum neighbors per slot.
pub const MAX_NEIGHBORS: usize = 8;

/// Up to [`MAX_NEIGHBORS`] indices into the flat slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NeighborSet {
    indices: [u32; MAX_NEIGHBORS],
    len: u8,
}

impl NeighborSet {
    /// An empty neighbor set.
    pub const fn new() -> Self {
        Self {
            indices: [0; MAX_NEIGHBORS],
            len: 0,
        }
    }

    /// Build a set from raw indices.
    ///
    /// Returns `None` if `indices` holds more than [`MAX_NEIGHBORS`]
    /// entries or contains a duplicate.
    pub fn from_slice(indices: &[u32]) -> Option<Self> {
        if indices.len() > MAX_NEIGHBORS {
            return None;
        }
        let mut set = Self::new();
        for &index in indices {
            if set.as_slice().contains(&index) {
                return None;
            }
            set.push(index);
        }
        Some(set)
    }

    /// Add a neighbor index. Duplicates are ignored.
    ///
    /// Returns `false` if the set was already full.
    pub fn push(&mut self, index: u32) -> bool {
        if self.as_slice().contains(&index) {
            return true;
        }
        let position = usize::from(self.len);
        match self.indices.get_mut(position) {
            Some(cell) => {
                *cell = index;
                self.len = self.len.saturating_add(1);
                true
            }
            None => false,
        }
    }

    /// The populated neighbor indices.
    pub fn as_slice(&self) -> &[u32] {
        self.indices.get(..usize::from(self.len)).unwrap_or(&[])
    }

    /// Number of neighbors.
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the set holds no neighbors.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the set holds [`MAX_NEIGHBORS`] entries.
    pub const fn is_full(&self) -> bool {
        self.len as usize >= MAX_NEIGHBORS
    }
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

/// One oscillator cell of the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(bound = "N: NumericValue")]
pub struct Slot<N> {
    /// Complex amplitude.
    pub amplitude: Amplitude<N>,
    /// Argument of the amplitude, canonical in `(-pi, pi]`.
    pub phase: N,
    /// Wrapped phase change over the last step divided by the step length.
    pub phase_velocity: N,
    /// Status bits from the last step.
    pub flags: SlotFlags,
    /// Coupled neighbors.
    pub neighbors: NeighborSet,
}

impl<N: NumericValue> Slot<N> {
    /// A slot at rest with the given amplitude and neighbors.
    pub fn new(amplitude: Amplitude<N>, neighbors: NeighborSet) -> Self {
        Self {
            amplitude,
            phase: crate::phase::wrap_phase(amplitude.phase()),
            phase_velocity: N::zero(),
            flags: SlotFlags::NONE,
            neighbors,
        }
    }
}

// ---------------------------------------------------------------------------
// Lattice state
// ---------------------------------------------------------------------------

/// Whether the lattice is still evolving or frozen by consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Slots advance on every step.
    #[default]
    Evolving,
    /// Consensus was declared; steps are no-ops until a reset or restore.
    Locked,
}

/// Macroscopic state of one lattice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatticeState {
    /// Completed steps. Never decreases except through restore.
    pub evolution_count: u64,
    /// Circular phase variance after the last step.
    pub phase_variance: f64,
    /// BLAKE3 of the evolution count, variance, and slot phases.
    pub state_hash: Digest,
    /// Logical simulation time in nanoseconds.
    pub timestamp_ns: u64,
    /// Consensus lock.
    pub lock: LockState,
}

impl LatticeState {
    /// State of a freshly built lattice.
    pub const fn genesis() -> Self {
        Self {
            evolution_count: 0,
            phase_variance: 0.0,
            state_hash: Digest::ZERO,
            timestamp_ns: 0,
            lock: LockState::Evolving,
        }
    }

    /// Whether consensus has been declared.
    pub const fn consensus_locked(&self) -> bool {
        matches!(self.lock, LockState::Locked)
    }
}

impl Default for LatticeState {
    fn default() -> Self {
        Self::genesis()
    }
}

// ---------------------------------------------------------------------------
// External records
// ---------------------------------------------------------------------------

/// A state commitment handed to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment {
    /// BLAKE3 of the canonical state encoding.
    pub digest: Digest,
    /// Evolution count the digest was taken at.
    pub evolution_count: u64,
    /// Logical timestamp of that step.
    pub timestamp_ns: u64,
    /// Whether the ledger has confirmed the submission.
    pub confirmed: bool,
}

/// Per-step summary pushed to telemetry sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Completed steps.
    pub evolution_count: u64,
    /// Circular phase variance.
    pub phase_variance: f64,
    /// State hash after the step.
    pub state_hash: Digest,
    /// Whether consensus is locked.
    pub consensus_locked: bool,
    /// Logical simulation time.
    pub timestamp_ns: u64,
    /// Whether the step clamped or replaced any value.
    pub degraded: bool,
    /// Wall-clock time the frame was produced.
    pub wall_clock: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_set_dedupes_and_caps() {
        let mut set = NeighborSet::new();
        assert!(set.push(3));
        assert!(set.push(3));
        assert_eq!(set.len(), 1);
        for i in 10..17 {
            assert!(set.push(i));
        }
        assert!(set.is_full());
        assert!(!set.push(99));
        assert_eq!(set.len(), MAX_NEIGHBORS);
        assert_eq!(set.as_slice().first(), Some(&3));
    }

    #[test]
    fn neighbor_set_from_slice() {
        let set = NeighborSet::from_slice(&[4, 1, 7]).unwrap();
        assert_eq!(set.as_slice(), &[4, 1, 7]);
        assert!(NeighborSet::from_slice(&[1, 1]).is_none());
        assert!(NeighborSet::from_slice(&[0; 9]).is_none());
    }

    #[test]
    fn flags_combine() {
        let mut flags = SlotFlags::NONE;
        assert!(flags.is_empty());
        flags.insert(SlotFlags::FLOORED);
        assert!(flags.contains(SlotFlags::FLOORED));
        assert!(!flags.contains(SlotFlags::DEGRADED));
        let both = SlotFlags::FLOORED | SlotFlags::SATURATED;
        assert!(both.contains(SlotFlags::SATURATED));
    }

    #[test]
    fn genesis_is_evolving() {
        let state = LatticeState::genesis();
        assert!(!state.consensus_locked());
        assert_eq!(state.evolution_count, 0);
    }

    #[test]
    fn lock_state_serializes_snake_case() {
        let json = serde_json::to_string(&LockState::Locked).unwrap();
        assert_eq!(json, "\"locked\"");
    }

    #[test]
    fn slot_survives_bincode() {
        let mut neighbors = NeighborSet::new();
        neighbors.push(1);
        let slot = Slot::new(Amplitude::new(0.0_f64, 1.0), neighbors);
        let bytes = bincode::serialize(&slot).unwrap();
        let back: Slot<f64> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, slot);
    }
}
