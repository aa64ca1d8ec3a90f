//! Weighted-decay snapshot store.
//!
//! Every capture decays the weight of each held snapshot by `decay` and
//! inserts the new one at weight 1.0. When the store is full, the snapshot
//! with the smallest weight goes first, oldest creation index breaking
//! ties. Because every held snapshot decays on every insertion, a snapshot
//! created at index `i` has weight `decay^(k - i - 1)` after `k` insertions.
//!
//! # Export envelope
//!
//! ```text
//! "PLSN" | version u16 | numeric width u16 | header len u32
//! | bincode header { id, weight, state, dimensions, slot_count }
//! | slot records
//! | BLAKE3 checksum (32 bytes) over everything before it
//! ```
//!
//! A slot record is `re | im | phase | phase_velocity` in canonical numeric
//! bytes, then `flags u8 | neighbor count u8 | 8 x u32 neighbor indices`.
//! Integers are big-endian.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use phaselock_types::{
    Amplitude, LatticeState, LockState, MAX_NEIGHBORS, NeighborSet, NumericValue, Slot, SlotFlags,
    SnapshotId, wrap_phase,
};

use crate::config::CheckpointConfig;
use crate::consensus::ConsensusDetector;
use crate::lattice::{LatticeEngine, state_hash};

/// Leading bytes of an exported snapshot.
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"PLSN";

/// Current export layout version.
pub const SNAPSHOT_VERSION: u16 = 1;

const CHECKSUM_LEN: usize = 32;
/// Magic, version, numeric width, and header length.
const PREAMBLE_LEN: usize = 12;
const MIN_EXPORT_LEN: usize = PREAMBLE_LEN + CHECKSUM_LEN;

/// Errors from snapshot restore, export, and import.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// No snapshot with this id is held.
    #[error("snapshot {id} not found")]
    NotFound {
        /// The requested id.
        id: SnapshotId,
    },

    /// The input ended before a field could be read.
    #[error("snapshot bytes truncated: needed {needed} more bytes, {available} available")]
    Truncated {
        /// Bytes the next field needs.
        needed: usize,
        /// Bytes left in the input.
        available: usize,
    },

    /// The input does not start with the snapshot magic.
    #[error("not a snapshot envelope")]
    BadMagic,

    /// The envelope was written by an unknown layout version.
    #[error("unsupported snapshot version {version}")]
    UnsupportedVersion {
        /// Version found in the envelope.
        version: u16,
    },

    /// The envelope was written with a different numeric type.
    #[error("snapshot numeric width {found} does not match {expected}")]
    WidthMismatch {
        /// Width of this store's numeric type.
        expected: usize,
        /// Width recorded in the envelope.
        found: u16,
    },

    /// The trailing checksum does not match the contents.
    #[error("snapshot checksum mismatch")]
    ChecksumMismatch,

    /// The bincode header could not be encoded or decoded.
    #[error("snapshot header codec error: {source}")]
    Header {
        /// The underlying codec error.
        #[from]
        source: bincode::Error,
    },

    /// The contents are structurally invalid.
    #[error("malformed snapshot: {reason}")]
    Malformed {
        /// What is wrong.
        reason: String,
    },

    /// The snapshot was taken from a lattice of a different shape.
    #[error("snapshot shape {found:?} does not match lattice {expected:?}")]
    ShapeMismatch {
        /// The live lattice's dimensions.
        expected: Vec<u32>,
        /// The snapshot's dimensions.
        found: Vec<u32>,
    },

    /// The stored state hash does not match the stored phases.
    #[error("snapshot {id} state hash does not match its contents")]
    HashMismatch {
        /// The offending snapshot.
        id: SnapshotId,
    },
}

fn malformed(reason: impl Into<String>) -> CheckpointError {
    CheckpointError::Malformed {
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// An immutable deep copy of the lattice plus its retention weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<N> {
    id: SnapshotId,
    weight: f64,
    state: LatticeState,
    dimensions: Vec<u32>,
    slots: Vec<Slot<N>>,
}

impl<N: NumericValue> Snapshot<N> {
    /// Creation index.
    pub const fn id(&self) -> SnapshotId {
        self.id
    }

    /// Current retention weight.
    pub const fn weight(&self) -> f64 {
        self.weight
    }

    /// The captured macrostate.
    pub const fn state(&self) -> &LatticeState {
        &self.state
    }

    /// Dimensions of the captured lattice.
    pub fn dimensions(&self) -> &[u32] {
        &self.dimensions
    }

    /// The captured slots.
    pub fn slots(&self) -> &[Slot<N>] {
        &self.slots
    }

    /// Serialize into the export envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        let header = bincode::serialize(&SnapshotHeader {
            id: self.id,
            weight: self.weight,
            state: self.state,
            dimensions: self.dimensions.clone(),
            slot_count: self.slots.len() as u64,
        })?;
        let header_len =
            u32::try_from(header.len()).map_err(|_err| malformed("header exceeds u32 length"))?;
        let width =
            u16::try_from(N::CANONICAL_WIDTH).map_err(|_err| malformed("numeric width exceeds u16"))?;

        let mut out = Vec::new();
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_be_bytes());
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&header_len.to_be_bytes());
        out.extend_from_slice(&header);

        for slot in &self.slots {
            slot.amplitude.re.write_canonical(&mut out);
            slot.amplitude.im.write_canonical(&mut out);
            slot.phase.write_canonical(&mut out);
            slot.phase_velocity.write_canonical(&mut out);
            out.push(slot.flags.0);
            let neighbors = slot.neighbors.as_slice();
            out.push(u8::try_from(neighbors.len()).unwrap_or(u8::MAX));
            for position in 0..MAX_NEIGHBORS {
                let index = neighbors.get(position).copied().unwrap_or(0);
                out.extend_from_slice(&index.to_be_bytes());
            }
        }

        let checksum = blake3::hash(&out);
        out.extend_from_slice(checksum.as_bytes());
        Ok(out)
    }

    /// Decode an export envelope and check its contents.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        if bytes.len() < MIN_EXPORT_LEN {
            return Err(CheckpointError::Truncated {
                needed: MIN_EXPORT_LEN,
                available: bytes.len(),
            });
        }
        let (body, checksum) = bytes.split_at(bytes.len().saturating_sub(CHECKSUM_LEN));
        if blake3::hash(body).as_bytes() != checksum {
            return Err(CheckpointError::ChecksumMismatch);
        }

        let mut reader = Reader::new(body);
        if reader.take(SNAPSHOT_MAGIC.len())? != SNAPSHOT_MAGIC {
            return Err(CheckpointError::BadMagic);
        }
        let version = reader.u16()?;
        if version != SNAPSHOT_VERSION {
            return Err(CheckpointError::UnsupportedVersion { version });
        }
        let width = reader.u16()?;
        if usize::from(width) != N::CANONICAL_WIDTH {
            return Err(CheckpointError::WidthMismatch {
                expected: N::CANONICAL_WIDTH,
                found: width,
            });
        }
        let header_len = usize::try_from(reader.u32()?)
            .map_err(|_err| malformed("header length does not fit in memory"))?;
        let header: SnapshotHeader = bincode::deserialize(reader.take(header_len)?)?;

        let slot_count = usize::try_from(header.slot_count)
            .map_err(|_err| malformed("slot count does not fit in memory"))?;
        let record_len = record_len::<N>();
        let expected = slot_count
            .checked_mul(record_len)
            .ok_or_else(|| malformed("slot count overflows"))?;
        if reader.remaining() != expected {
            return Err(malformed(format!(
                "expected {expected} bytes of slot records, found {}",
                reader.remaining()
            )));
        }

        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            slots.push(read_slot::<N>(&mut reader)?);
        }

        let snapshot = Self {
            id: header.id,
            weight: header.weight,
            state: header.state,
            dimensions: header.dimensions,
            slots,
        };
        snapshot.check_contents()?;
        Ok(snapshot)
    }

    /// Structural checks that do not depend on a live engine.
    fn check_contents(&self) -> Result<(), CheckpointError> {
        if !(self.weight.is_finite() && self.weight > 0.0) {
            return Err(malformed(format!("weight {} is not positive", self.weight)));
        }
        let expected_len = self
            .dimensions
            .iter()
            .try_fold(1_u64, |acc, &size| acc.checked_mul(u64::from(size)))
            .ok_or_else(|| malformed("dimension product overflows"))?;
        if self.dimensions.is_empty() || expected_len != self.slots.len() as u64 {
            return Err(malformed(format!(
                "{} slots do not fill dimensions {:?}",
                self.slots.len(),
                self.dimensions
            )));
        }

        let len = self.slots.len();
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.amplitude.is_finite() || !slot.phase_velocity.is_finite() {
                return Err(malformed(format!("slot {index} holds a non-finite value")));
            }
            if !slot.phase.is_finite() || wrap_phase(slot.phase) != slot.phase {
                return Err(malformed(format!("slot {index} phase is not canonical")));
            }
            if slot
                .neighbors
                .as_slice()
                .iter()
                .any(|&j| usize::try_from(j).map_or(true, |j| j >= len))
            {
                return Err(malformed(format!("slot {index} has an out-of-range neighbor")));
            }
        }

        let recomputed = state_hash(
            self.state.evolution_count,
            self.state.phase_variance,
            self.slots.iter().map(|slot| slot.phase),
        );
        if recomputed != self.state.state_hash {
            return Err(CheckpointError::HashMismatch { id: self.id });
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
    id: SnapshotId,
    weight: f64,
    state: LatticeState,
    dimensions: Vec<u32>,
    slot_count: u64,
}

#[allow(clippy::arithmetic_side_effects)]
const fn record_len<N: NumericValue>() -> usize {
    4 * N::CANONICAL_WIDTH + 2 + 4 * MAX_NEIGHBORS
}

fn read_slot<N: NumericValue>(reader: &mut Reader<'_>) -> Result<Slot<N>, CheckpointError> {
    let re = reader.numeric::<N>()?;
    let im = reader.numeric::<N>()?;
    let phase = reader.numeric::<N>()?;
    let phase_velocity = reader.numeric::<N>()?;
    let flags = SlotFlags(reader.u8()?);
    let count = usize::from(reader.u8()?);

    let mut indices = [0_u32; MAX_NEIGHBORS];
    for cell in &mut indices {
        *cell = reader.u32()?;
    }
    let neighbors = indices
        .get(..count)
        .and_then(NeighborSet::from_slice)
        .ok_or_else(|| malformed(format!("invalid neighbor list of length {count}")))?;

    Ok(Slot {
        amplitude: Amplitude::new(re, im),
        phase,
        phase_velocity,
        flags,
        neighbors,
    })
}

/// Cursor over an envelope body.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    const fn remaining(&self) -> usize {
        self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CheckpointError> {
        let (head, tail) = self
            .bytes
            .split_at_checked(len)
            .ok_or(CheckpointError::Truncated {
                needed: len,
                available: self.bytes.len(),
            })?;
        self.bytes = tail;
        Ok(head)
    }

    fn array<const L: usize>(&mut self) -> Result<[u8; L], CheckpointError> {
        let head = self.take(L)?;
        head.try_into()
            .map_err(|_err| malformed("field length mismatch"))
    }

    fn u8(&mut self) -> Result<u8, CheckpointError> {
        Ok(u8::from_be_bytes(self.array::<1>()?))
    }

    fn u16(&mut self) -> Result<u16, CheckpointError> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    fn u32(&mut self) -> Result<u32, CheckpointError> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    fn numeric<N: NumericValue>(&mut self) -> Result<N, CheckpointError> {
        let raw = self.take(N::CANONICAL_WIDTH)?;
        N::read_canonical(raw).ok_or_else(|| malformed("invalid numeric encoding"))
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Bounded store of weighted snapshots.
#[derive(Debug, Clone)]
pub struct CheckpointManager<N: NumericValue = f64> {
    snapshots: Vec<Snapshot<N>>,
    max_snapshots: usize,
    decay: f64,
    next_id: SnapshotId,
}

impl<N: NumericValue> CheckpointManager<N> {
    /// Create an empty store.
    ///
    /// `decay` is expected in `(0, 1)` and `max_snapshots` at least 1;
    /// configuration validation enforces both.
    pub fn new(max_snapshots: usize, decay: f64) -> Self {
        Self {
            snapshots: Vec::with_capacity(max_snapshots),
            max_snapshots: max_snapshots.max(1),
            decay,
            next_id: SnapshotId(0),
        }
    }

    /// Create a store from configuration.
    pub fn from_config(config: &CheckpointConfig) -> Self {
        Self::new(config.max_snapshots, config.decay)
    }

    /// Capture the engine's current lattice.
    ///
    /// The shared borrow guarantees no step is in flight while copying.
    pub fn capture(&mut self, engine: &LatticeEngine<N>) -> SnapshotId {
        self.insert(
            *engine.state(),
            engine.dimensions().to_vec(),
            engine.slots().to_vec(),
        )
    }

    /// Replace the engine's lattice with snapshot `id` and start a new
    /// consensus epoch.
    ///
    /// On error the engine and detector are left unchanged.
    pub fn restore(
        &self,
        id: SnapshotId,
        engine: &mut LatticeEngine<N>,
        detector: &mut ConsensusDetector,
    ) -> Result<(), CheckpointError> {
        let snapshot = self.get(id).ok_or(CheckpointError::NotFound { id })?;

        if snapshot.dimensions() != engine.dimensions() {
            return Err(CheckpointError::ShapeMismatch {
                expected: engine.dimensions().to_vec(),
                found: snapshot.dimensions.clone(),
            });
        }
        snapshot.check_contents()?;
        let topology = engine.topology();
        if let Some(index) = snapshot
            .slots
            .iter()
            .enumerate()
            .position(|(i, slot)| topology.neighbors(i) != Some(&slot.neighbors))
        {
            return Err(malformed(format!(
                "slot {index} neighbors do not match the lattice topology"
            )));
        }

        let mut state = snapshot.state;
        state.lock = LockState::Evolving;
        engine.replace(state, &snapshot.slots);
        detector.clear();

        info!(
            snapshot = %id,
            evolution_count = state.evolution_count,
            "Snapshot restored"
        );
        Ok(())
    }

    /// Serialize snapshot `id` for durable storage.
    pub fn export(&self, id: SnapshotId) -> Result<Vec<u8>, CheckpointError> {
        let snapshot = self.get(id).ok_or(CheckpointError::NotFound { id })?;
        let bytes = snapshot.to_bytes()?;
        debug!(snapshot = %id, bytes = bytes.len(), "Snapshot exported");
        Ok(bytes)
    }

    /// Decode an exported snapshot and insert it as a new capture.
    ///
    /// The imported copy gets a fresh id and weight 1.0; its lattice
    /// contents are exactly those that were exported.
    pub fn import(&mut self, bytes: &[u8]) -> Result<SnapshotId, CheckpointError> {
        let snapshot = Snapshot::<N>::from_bytes(bytes)?;
        let source = snapshot.id;
        let id = self.insert(snapshot.state, snapshot.dimensions, snapshot.slots);
        debug!(snapshot = %id, source = %source, "Snapshot imported");
        Ok(id)
    }

    /// Look up a snapshot by id.
    pub fn get(&self, id: SnapshotId) -> Option<&Snapshot<N>> {
        self.snapshots.iter().find(|snapshot| snapshot.id == id)
    }

    /// The snapshot with the highest weight; the newest on ties.
    pub fn latest(&self) -> Option<&Snapshot<N>> {
        self.snapshots.iter().max_by(|a, b| {
            a.weight
                .total_cmp(&b.weight)
                .then_with(|| a.id.cmp(&b.id))
        })
    }

    /// The most advanced snapshot taken at or before `target_evolution`.
    pub fn resume_point(&self, target_evolution: u64) -> Option<&Snapshot<N>> {
        self.snapshots
            .iter()
            .filter(|snapshot| snapshot.state.evolution_count <= target_evolution)
            .max_by_key(|snapshot| (snapshot.state.evolution_count, snapshot.id))
    }

    /// Held snapshots, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot<N>> {
        self.snapshots.iter()
    }

    /// Number of held snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether no snapshot is held.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Maximum number of held snapshots.
    pub const fn capacity(&self) -> usize {
        self.max_snapshots
    }

    /// Per-insertion decay factor.
    pub const fn decay(&self) -> f64 {
        self.decay
    }

    /// Evict if full, decay, then insert at weight 1.0.
    fn insert(
        &mut self,
        state: LatticeState,
        dimensions: Vec<u32>,
        slots: Vec<Slot<N>>,
    ) -> SnapshotId {
        if self.snapshots.len() >= self.max_snapshots {
            self.evict_lightest();
        }
        for snapshot in &mut self.snapshots {
            snapshot.weight *= self.decay;
        }

        let id = self.next_id;
        self.next_id = id.next();
        self.snapshots.push(Snapshot {
            id,
            weight: 1.0,
            state,
            dimensions,
            slots,
        });

        info!(
            snapshot = %id,
            evolution_count = state.evolution_count,
            held = self.snapshots.len(),
            "Snapshot saved"
        );
        id
    }

    fn evict_lightest(&mut self) {
        let lightest = self
            .snapshots
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.weight
                    .total_cmp(&b.weight)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(position, _)| position);
        if let Some(position) = lightest {
            let evicted = self.snapshots.remove(position);
            info!(
                snapshot = %evicted.id,
                weight = evicted.weight,
                evolution_count = evicted.state.evolution_count,
                "Snapshot pruned"
            );
        }
    }
}
