//! Shared type definitions for the Phaselock lattice.
//!
//! This crate is the single source of truth for the numeric contract and
//! the value types that flow between the engine, the checkpoint store, the
//! state encoder, and the external collaborators.
//!
//! # Modules
//!
//! - [`numeric`] -- The [`NumericValue`] capability trait with `f64` and
//!   [`rust_decimal::Decimal`] implementations
//! - [`amplitude`] -- Complex [`Amplitude`] built on any [`NumericValue`]
//! - [`phase`] -- Phase canonicalization into `(-pi, pi]` and circular
//!   statistics
//! - [`digest`] -- 32-byte BLAKE3 [`Digest`] with hex encoding
//! - [`ids`] -- Identifier newtypes (snapshots, content, transactions, nodes)
//! - [`structs`] -- Slots, lattice state, commitments, telemetry frames

pub mod amplitude;
pub mod digest;
pub mod ids;
pub mod numeric;
pub mod phase;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use amplitude::Amplitude;
pub use digest::Digest;
pub use ids::{ContentId, NodeId, SnapshotId, TxRef};
pub use numeric::NumericValue;
pub use phase::{PhaseStats, circular_stats, wrap_phase};
pub use structs::{
    Commitment, LatticeState, LockState, MAX_NEIGHBORS, NeighborSet, Slot, SlotFlags,
    TelemetryFrame,
};
