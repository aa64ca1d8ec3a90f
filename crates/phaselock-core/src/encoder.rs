//! Canonical macrostate encoding and commitment digests.
//!
//! The canonical vector is a fixed byte layout, big-endian throughout:
//!
//! | field | bytes |
//! |---|---|
//! | magic `PLCV` | 4 |
//! | layout version | 2 |
//! | dimension count | 1 |
//! | dimension sizes, zero padded to 8 | 32 |
//! | evolution count | 8 |
//! | logical timestamp (ns) | 8 |
//! | phase variance, `u64` at 2^-48 | 8 |
//! | phase sample count `P` | 4 |
//! | `P` bucket phases, `i64` at 2^-40 rad | 8P |
//! | auxiliary channel | 32 |
//!
//! Slots are split into `P` contiguous buckets by index and each bucket
//! contributes its circular mean phase. Quantization rounds half to even,
//! so the bytes depend only on the canonical phases, never on how the
//! state was reached. The auxiliary channel carries the BLAKE3 hash of an
//! optional program payload and is zero when none is set.

use phaselock_types::{
    Commitment, Digest, LatticeState, NumericValue, Slot, circular_stats,
};

use crate::checkpoint::Snapshot;
use crate::config::{CommitmentConfig, MAX_DIMENSIONS};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::lattice::LatticeEngine;

/// Leading bytes of a canonical vector.
pub const VECTOR_MAGIC: &[u8; 4] = b"PLCV";

/// Current canonical layout version.
pub const VECTOR_VERSION: u16 = 1;

/// Fixed-point scale of the variance field.
const VARIANCE_SCALE: f64 = 281_474_976_710_656.0; // 2^48

/// Fixed-point scale of each phase sample.
const PHASE_SCALE: f64 = 1_099_511_627_776.0; // 2^40

/// Errors from canonical encoding.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The lattice has more dimensions than the layout can carry.
    #[error("{count} dimensions exceed the layout maximum of {MAX_DIMENSIONS}")]
    TooManyDimensions {
        /// Dimensions in the lattice.
        count: usize,
    },

    /// A field that must be finite was not.
    #[error("non-finite {field} cannot be encoded")]
    NonFinite {
        /// Which field.
        field: &'static str,
    },
}

/// Projects lattice state into the canonical vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEncoder {
    phase_samples: u32,
    aux: [u8; 32],
}

impl StateEncoder {
    /// Create an encoder emitting `phase_samples` bucket phases.
    pub fn new(phase_samples: u32) -> Self {
        Self {
            phase_samples: phase_samples.max(1),
            aux: [0; 32],
        }
    }

    /// Create an encoder from configuration.
    pub fn from_config(config: &CommitmentConfig) -> Self {
        Self::new(config.phase_samples)
    }

    /// Carry the hash of `payload` in the auxiliary channel.
    pub fn set_aux(&mut self, payload: &[u8]) {
        self.aux = *blake3::hash(payload).as_bytes();
    }

    /// Empty the auxiliary channel.
    pub const fn clear_aux(&mut self) {
        self.aux = [0; 32];
    }

    /// Current auxiliary channel contents.
    pub const fn aux(&self) -> &[u8; 32] {
        &self.aux
    }

    /// Number of bucket phases per vector.
    pub const fn phase_samples(&self) -> u32 {
        self.phase_samples
    }

    /// Canonical vector for the engine's current state.
    pub fn encode<N: NumericValue>(&self, engine: &LatticeEngine<N>) -> Result<Vec<u8>, EncodeError> {
        self.encode_parts(engine.state(), engine.dimensions(), engine.slots())
    }

    /// Canonical vector for a stored snapshot.
    pub fn encode_snapshot<N: NumericValue>(
        &self,
        snapshot: &Snapshot<N>,
    ) -> Result<Vec<u8>, EncodeError> {
        self.encode_parts(snapshot.state(), snapshot.dimensions(), snapshot.slots())
    }

    /// Canonical vector from raw parts.
    pub fn encode_parts<N: NumericValue>(
        &self,
        state: &LatticeState,
        dimensions: &[u32],
        slots: &[Slot<N>],
    ) -> Result<Vec<u8>, EncodeError> {
        let dimension_count = u8::try_from(dimensions.len())
            .ok()
            .filter(|&count| usize::from(count) <= MAX_DIMENSIONS)
            .ok_or(EncodeError::TooManyDimensions {
                count: dimensions.len(),
            })?;
        let variance = quantize_variance(state.phase_variance)?;

        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(VECTOR_MAGIC);
        out.extend_from_slice(&VECTOR_VERSION.to_be_bytes());
        out.push(dimension_count);
        for position in 0..MAX_DIMENSIONS {
            let size = dimensions.get(position).copied().unwrap_or(0);
            out.extend_from_slice(&size.to_be_bytes());
        }
        out.extend_from_slice(&state.evolution_count.to_be_bytes());
        out.extend_from_slice(&state.timestamp_ns.to_be_bytes());
        out.extend_from_slice(&variance.to_be_bytes());
        out.extend_from_slice(&self.phase_samples.to_be_bytes());
        for sample in bucket_phases(slots, self.phase_samples) {
            out.extend_from_slice(&sample.to_be_bytes());
        }
        out.extend_from_slice(&self.aux);
        Ok(out)
    }

    /// Length in bytes of every vector this encoder emits.
    #[allow(clippy::arithmetic_side_effects)]
    pub fn encoded_len(&self) -> usize {
        let samples = usize::try_from(self.phase_samples).unwrap_or(0);
        4 + 2 + 1 + 4 * MAX_DIMENSIONS + 8 + 8 + 8 + 4 + 8 * samples + 32
    }

    /// BLAKE3 digest of the canonical vector.
    pub fn digest<N: NumericValue>(&self, engine: &LatticeEngine<N>) -> Result<Digest, EncodeError> {
        Ok(Digest::of(&self.encode(engine)?))
    }

    /// Commitment describing the engine's current state.
    pub fn commitment<N: NumericValue>(
        &self,
        engine: &LatticeEngine<N>,
    ) -> Result<Commitment, EncodeError> {
        let state = engine.state();
        Ok(Commitment {
            digest: self.digest(engine)?,
            evolution_count: state.evolution_count,
            timestamp_ns: state.timestamp_ns,
            confirmed: false,
        })
    }

    /// Encode the engine's state and queue the commitment for the ledger.
    pub fn commit<N: NumericValue>(
        &self,
        engine: &LatticeEngine<N>,
        dispatcher: &mut Dispatcher,
    ) -> Result<(Commitment, DispatchOutcome), EncodeError> {
        let commitment = self.commitment(engine)?;
        let outcome = dispatcher.commit(commitment.clone());
        Ok((commitment, outcome))
    }
}

impl Default for StateEncoder {
    fn default() -> Self {
        Self::from_config(&CommitmentConfig::default())
    }
}

#[allow(
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn quantize_variance(variance: f64) -> Result<u64, EncodeError> {
    if !variance.is_finite() || variance < 0.0 {
        return Err(EncodeError::NonFinite {
            field: "phase_variance",
        });
    }
    // `as` saturates; variance is bounded by pi^2 in practice.
    Ok((variance * VARIANCE_SCALE).round_ties_even() as u64)
}

/// Circular mean phase of each contiguous slot bucket, quantized.
///
/// Bucket `b` covers slots `[b * n / P, (b + 1) * n / P)`; an empty bucket
/// contributes zero.
#[allow(clippy::arithmetic_side_effects, clippy::cast_possible_truncation)]
fn bucket_phases<N: NumericValue>(slots: &[Slot<N>], samples: u32) -> Vec<i64> {
    let n = slots.len();
    let p = usize::try_from(samples).unwrap_or(1).max(1);
    (0..p)
        .map(|b| {
            let start = bucket_bound(b, n, p);
            let end = bucket_bound(b + 1, n, p);
            let bucket = slots.get(start..end).unwrap_or_default();
            if bucket.is_empty() {
                return 0;
            }
            let mean = circular_stats(bucket.iter().map(|slot| slot.phase.to_f64())).mean;
            if mean.is_finite() {
                (mean * PHASE_SCALE).round_ties_even() as i64
            } else {
                0
            }
        })
        .collect()
}

fn bucket_bound(bucket: usize, n: usize, p: usize) -> usize {
    u128::try_from(bucket)
        .ok()
        .zip(u128::try_from(n).ok())
        .and_then(|(b, n)| b.checked_mul(n))
        .and_then(|product| product.checked_div(u128::try_from(p).ok()?))
        .and_then(|bound| usize::try_from(bound).ok())
        .unwrap_or(n)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use phaselock_ledger::InMemoryLedger;

    use super::*;
    use crate::archive::SnapshotArchiver;
    use crate::blob::InMemoryBlobStore;
    use crate::checkpoint::CheckpointManager;
    use crate::config::LatticeConfig;
    use crate::consensus::ConsensusDetector;
    use crate::publisher::CommitmentPublisher;
    use crate::retry::RetryPolicy;

    fn engine() -> LatticeEngine {
        LatticeEngine::new(&LatticeConfig::default()).unwrap()
    }

    #[test]
    fn layout_has_fixed_length_and_header() {
        let encoder = StateEncoder::new(8);
        let bytes = encoder.encode(&engine()).unwrap();
        assert_eq!(bytes.len(), encoder.encoded_len());
        assert_eq!(bytes.len(), 4 + 2 + 1 + 32 + 8 + 8 + 8 + 4 + 64 + 32);
        assert_eq!(&bytes[..4], b"PLCV");
        assert_eq!(&bytes[4..6], &[0, 1]);
        assert_eq!(bytes[6], 1);
        assert_eq!(&bytes[7..11], &8_u32.to_be_bytes());
        assert_eq!(&bytes[11..39], &[0; 28]);
    }

    #[test]
    fn identical_states_give_identical_digests() {
        let mut a = engine();
        let mut b = engine();
        for _ in 0..50 {
            a.step();
            b.step();
        }
        let encoder = StateEncoder::new(4);
        assert_eq!(encoder.digest(&a).unwrap(), encoder.digest(&b).unwrap());
        b.step();
        assert_ne!(encoder.digest(&a).unwrap(), encoder.digest(&b).unwrap());
    }

    #[test]
    fn restored_state_encodes_like_the_original() {
        let mut engine = engine();
        for _ in 0..5 {
            engine.step();
        }
        let mut manager = CheckpointManager::new(4, 0.9);
        let id = manager.capture(&engine);
        let encoder = StateEncoder::new(8);
        let before = encoder.encode(&engine).unwrap();
        assert_eq!(encoder.encode_snapshot(manager.get(id).unwrap()).unwrap(), before);

        for _ in 0..5 {
            engine.step();
        }
        let mut detector = ConsensusDetector::new(1e-6, 100);
        manager.restore(id, &mut engine, &mut detector).unwrap();
        assert_eq!(encoder.encode(&engine).unwrap(), before);
    }

    #[test]
    fn aux_channel_changes_digest() {
        let engine = engine();
        let mut encoder = StateEncoder::new(8);
        let plain = encoder.digest(&engine).unwrap();
        encoder.set_aux(b"program tape");
        let tagged = encoder.digest(&engine).unwrap();
        assert_ne!(plain, tagged);
        assert_eq!(encoder.aux(), blake3::hash(b"program tape").as_bytes());
        encoder.clear_aux();
        assert_eq!(encoder.digest(&engine).unwrap(), plain);
    }

    #[test]
    fn more_samples_than_slots_pads_with_zero() {
        let encoder = StateEncoder::new(16);
        let bytes = encoder.encode(&engine()).unwrap();
        assert_eq!(bytes.len(), encoder.encoded_len());
    }

    #[test]
    fn buckets_partition_slots() {
        assert_eq!(bucket_bound(0, 10, 3), 0);
        assert_eq!(bucket_bound(1, 10, 3), 3);
        assert_eq!(bucket_bound(2, 10, 3), 6);
        assert_eq!(bucket_bound(3, 10, 3), 10);
    }

    #[test]
    fn quantization_rounds_half_even() {
        let half_step = 0.5 / VARIANCE_SCALE;
        assert_eq!(quantize_variance(half_step).unwrap(), 0);
        assert_eq!(quantize_variance(3.0 * half_step).unwrap(), 2);
        assert!(quantize_variance(f64::NAN).is_err());
    }

    #[tokio::test]
    async fn commit_hands_digest_to_ledger() {
        let ledger = Arc::new(InMemoryLedger::new());
        let retry = RetryPolicy::new(1, Duration::ZERO, Duration::ZERO);
        let mut dispatcher = Dispatcher::spawn(
            CommitmentPublisher::new(Arc::clone(&ledger), retry),
            SnapshotArchiver::new(Arc::new(InMemoryBlobStore::new()), retry),
            4,
        );
        let engine = engine();
        let encoder = StateEncoder::new(8);
        let (commitment, outcome) = encoder.commit(&engine, &mut dispatcher).unwrap();
        assert_eq!(outcome, DispatchOutcome::Enqueued);
        dispatcher.shutdown().await.unwrap();
        assert_eq!(commitment.digest, encoder.digest(&engine).unwrap());
        let record = ledger.record(commitment.digest).await.unwrap();
        assert_eq!(record.evolution_count, 0);
    }
}
