//! Deterministic pseudo-random draws keyed by `(seed, step, slot)`.
//!
//! Every stochastic term in the lattice comes from here. A draw is a pure
//! function of its keys, so two nodes with the same seed see the same
//! values no matter how their steps are scheduled. Wall-clock entropy is
//! never used.

/// Independent streams drawn from the same `(seed, step, slot)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lane {
    /// The general-purpose stream returned by [`det_unit`].
    General = 0,
    /// Noise kick on the real part.
    NoiseRe = 1,
    /// Noise kick on the imaginary part.
    NoiseIm = 2,
    /// Initial phase of a slot.
    InitialPhase = 3,
    /// Natural frequency offset of a slot.
    Frequency = 4,
}

/// A uniform draw in `[0, 1)` for `(seed, step, slot)`.
pub fn det_unit(seed: u64, step: u64, slot: u64) -> f64 {
    det_unit_lane(seed, step, slot, Lane::General)
}

/// A uniform draw in `[0, 1)` from a specific lane.
///
/// The top 53 bits of a BLAKE3 hash over the big-endian keys become the
/// mantissa, so every representable output is equally likely.
#[allow(clippy::cast_precision_loss)]
pub fn det_unit_lane(seed: u64, step: u64, slot: u64, lane: Lane) -> f64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_be_bytes());
    hasher.update(&step.to_be_bytes());
    hasher.update(&slot.to_be_bytes());
    hasher.update(&[lane as u8]);
    let hash = hasher.finalize();

    let head = hash.as_bytes().first_chunk::<8>().copied().unwrap_or([0u8; 8]);
    let bits = u64::from_be_bytes(head) >> 11;
    bits as f64 * (1.0 / (1_u64 << 53) as f64)
}

/// A uniform draw in `[-1, 1)` from a specific lane.
pub fn det_signed_lane(seed: u64, step: u64, slot: u64, lane: Lane) -> f64 {
    det_unit_lane(seed, step, slot, lane).mul_add(2.0, -1.0)
}
