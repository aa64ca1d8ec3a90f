//! Telemetry frames published over NATS.
//!
//! Frames go to `phaselock.telemetry.{node_id}` as JSON. Publishing is
//! fire-and-forget: a failed publish is logged and the frame is dropped.

use phaselock_core::telemetry::TelemetrySink;
use phaselock_types::{NodeId, TelemetryFrame};
use tracing::{info, warn};

use crate::error::NodeError;

/// Subject a node's frames are published on.
pub fn telemetry_subject(node_id: NodeId) -> String {
    format!("phaselock.telemetry.{node_id}")
}

/// [`TelemetrySink`] publishing to NATS.
pub struct NatsTelemetry {
    client: async_nats::Client,
    subject: String,
}

impl NatsTelemetry {
    /// Connect to a NATS server and publish under `node_id`'s subject.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Nats`] if the connection cannot be established.
    pub async fn connect(url: &str, node_id: NodeId) -> Result<Self, NodeError> {
        info!(url = url, "Connecting to NATS");
        let client = async_nats::connect(url)
            .await
            .map_err(|e| NodeError::Nats {
                message: format!("failed to connect to {url}: {e}"),
            })?;
        let subject = telemetry_subject(node_id);
        info!(subject = subject, "NATS telemetry connected");
        Ok(Self { client, subject })
    }
}

impl TelemetrySink for NatsTelemetry {
    async fn emit(&self, frame: TelemetryFrame) {
        let payload = match serde_json::to_vec(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize telemetry frame");
                return;
            }
        };
        if let Err(e) = self
            .client
            .publish(self.subject.clone(), payload.into())
            .await
        {
            warn!(
                subject = self.subject,
                evolution_count = frame.evolution_count,
                error = %e,
                "Failed to publish telemetry frame"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_carries_node_id() {
        let node_id = NodeId::new();
        let subject = telemetry_subject(node_id);
        assert!(subject.starts_with("phaselock.telemetry."));
        assert!(subject.ends_with(&node_id.to_string()));
    }
}
