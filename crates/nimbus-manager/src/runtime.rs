//! Container runtime seam.
//!
//! The manager drives instance lifecycles through this trait so the
//! actual container engine (and the tests' scripted fakes) stay
//! pluggable. Implementations are expected to be idempotent where the
//! engine allows it; the manager additionally bounds every call with a
//! timeout.

use async_trait::async_trait;
use nimbus_state::{InstanceRecord, NodeRecord};
use thiserror::Error;
use tracing::debug;

/// Opaque engine-side failure.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RuntimeError(pub String);

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch (or relaunch) the instance's container on its node.
    async fn start(&self, instance: &InstanceRecord, node: &NodeRecord)
        -> Result<(), RuntimeError>;

    /// Stop the instance's container, keeping its state on the node.
    async fn stop(&self, instance: &InstanceRecord) -> Result<(), RuntimeError>;

    /// Remove the instance's container and any node-local state.
    async fn remove(&self, instance: &InstanceRecord) -> Result<(), RuntimeError>;
}

/// Runtime adapter that records intent without touching any engine.
/// Used for local development and smoke deployments where the control
/// plane runs without a container backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRuntime;

#[async_trait]
impl ContainerRuntime for NoopRuntime {
    async fn start(&self, instance: &InstanceRecord, node: &NodeRecord) -> Result<(), RuntimeError> {
        debug!(instance_id = %instance.id, node_id = %node.id, "noop runtime: start");
        Ok(())
    }

    async fn stop(&self, instance: &InstanceRecord) -> Result<(), RuntimeError> {
        debug!(instance_id = %instance.id, "noop runtime: stop");
        Ok(())
    }

    async fn remove(&self, instance: &InstanceRecord) -> Result<(), RuntimeError> {
        debug!(instance_id = %instance.id, "noop runtime: remove");
        Ok(())
    }
}
