//! Write-only telemetry frames.
//!
//! Frames describe the lattice after a step or checkpoint. Sinks may log,
//! broadcast, or publish them, but nothing they receive ever flows back
//! into engine state, and a failing sink never stalls evolution.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::info;

use phaselock_types::{NumericValue, TelemetryFrame};

use crate::lattice::LatticeEngine;

/// Build a frame describing the engine's current state.
pub fn frame<N: NumericValue>(engine: &LatticeEngine<N>, degraded: bool) -> TelemetryFrame {
    let state = engine.state();
    TelemetryFrame {
        evolution_count: state.evolution_count,
        phase_variance: state.phase_variance,
        state_hash: state.state_hash,
        consensus_locked: state.consensus_locked(),
        timestamp_ns: state.timestamp_ns,
        degraded,
        wall_clock: Utc::now(),
    }
}

/// Destination for telemetry frames.
pub trait TelemetrySink: Send + Sync {
    /// Deliver one frame. Delivery failures are the sink's to log.
    fn emit(&self, frame: TelemetryFrame) -> impl Future<Output = ()> + Send;
}

impl<T: TelemetrySink> TelemetrySink for Arc<T> {
    fn emit(&self, frame: TelemetryFrame) -> impl Future<Output = ()> + Send {
        T::emit(self, frame)
    }
}

/// Discards every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    async fn emit(&self, _frame: TelemetryFrame) {}
}

/// Writes frames to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    async fn emit(&self, frame: TelemetryFrame) {
        info!(
            evolution_count = frame.evolution_count,
            phase_variance = frame.phase_variance,
            state_hash = %frame.state_hash,
            consensus_locked = frame.consensus_locked,
            timestamp_ns = frame.timestamp_ns,
            degraded = frame.degraded,
            "Telemetry"
        );
    }
}

/// Fans frames out to in-process subscribers.
///
/// Slow subscribers lag and lose frames rather than blocking the loop.
#[derive(Debug, Clone)]
pub struct BroadcastTelemetry {
    sender: broadcast::Sender<TelemetryFrame>,
}

impl BroadcastTelemetry {
    /// Create a channel holding up to `capacity` undelivered frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to frames emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryFrame> {
        self.sender.subscribe()
    }
}

impl TelemetrySink for BroadcastTelemetry {
    async fn emit(&self, frame: TelemetryFrame) {
        // No subscribers is not an error.
        let _ = self.sender.send(frame);
    }
}
