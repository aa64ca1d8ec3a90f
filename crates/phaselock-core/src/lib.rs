//! Lattice engine, consensus detection, and the evolution loop for Phaselock.
//!
//! This crate owns the step cycle that drives a coupled-oscillator lattice
//! toward phase consensus: integrate, measure variance, lock, checkpoint,
//! and commit the macrostate to the ledger.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `phaselock.yaml` into
//!   strongly-typed structs.
//! - [`noise`] -- Seed-keyed deterministic draws for initial state and
//!   per-step noise.
//! - [`topology`] -- Toroidal neighbor table over a flat slot array.
//! - [`integrator`] -- Amplitude derivative and the RK4 workspace.
//! - [`lattice`] -- [`LatticeEngine`], one synchronous step at a time.
//! - [`consensus`] -- [`ConsensusDetector`] with lock hysteresis.
//! - [`checkpoint`] -- [`CheckpointManager`] with weighted-decay retention
//!   and the snapshot wire format.
//! - [`encoder`] -- [`StateEncoder`] producing the commitment digest.
//! - [`retry`] -- Exponential backoff with jitter for external calls.
//! - [`publisher`] -- Ledger submission with a bounded pending queue.
//! - [`blob`] -- [`BlobStore`] trait plus in-memory and filesystem stores.
//! - [`archive`] -- Snapshot export to a blob store.
//! - [`dispatch`] -- Background worker delivering commitments and exports.
//! - [`telemetry`] -- Write-only [`TelemetrySink`] frames.
//! - [`integrity`] -- Periodic consistency checks.
//! - [`monitor`] -- Step timing jitter and margin tracking.
//! - [`pacing`] -- Wall-clock pacing of the step schedule.
//! - [`operator`] -- Pause, stop, and epoch-reset controls.
//! - [`runner`] -- The evolution loop tying everything together.
//!
//! [`LatticeEngine`]: lattice::LatticeEngine
//! [`ConsensusDetector`]: consensus::ConsensusDetector
//! [`CheckpointManager`]: checkpoint::CheckpointManager
//! [`StateEncoder`]: encoder::StateEncoder
//! [`BlobStore`]: blob::BlobStore
//! [`TelemetrySink`]: telemetry::TelemetrySink

pub mod archive;
pub mod blob;
pub mod checkpoint;
pub mod config;
pub mod consensus;
pub mod dispatch;
pub mod encoder;
pub mod integrator;
pub mod integrity;
pub mod lattice;
pub mod monitor;
pub mod noise;
pub mod operator;
pub mod pacing;
pub mod publisher;
pub mod retry;
pub mod runner;
pub mod telemetry;
pub mod topology;
