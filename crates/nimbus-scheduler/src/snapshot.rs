//! Advisory live-utilization feed.
//!
//! Placement never consults this: admission works off declared
//! capacity minus committed reservations, which is deterministic and
//! replayable. The snapshot exists for the informational cluster
//! resources endpoint, where observed utilization from an external
//! telemetry source is useful context for operators.

use async_trait::async_trait;
use nimbus_state::NodeId;
use serde::{Deserialize, Serialize};

/// Observed utilization on one node, as a fraction of declared
/// capacity actually in use right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUsage {
    pub node_id: NodeId,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[async_trait]
pub trait ResourceSnapshot: Send + Sync {
    /// Best-effort sample of current utilization. An empty vec means
    /// no telemetry is available; callers must treat that as normal.
    async fn sample(&self) -> Vec<NodeUsage>;
}

/// Snapshot source for deployments without telemetry wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTelemetry;

#[async_trait]
impl ResourceSnapshot for NoTelemetry {
    async fn sample(&self) -> Vec<NodeUsage> {
        Vec::new()
    }
}
