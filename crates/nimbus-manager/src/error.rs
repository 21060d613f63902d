use nimbus_ports::PortError;
use nimbus_quota::QuotaError;
use nimbus_scheduler::SchedulerError;
use nimbus_state::{InstanceId, InstanceStatus, StateError};
use thiserror::Error;

pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    /// Unknown instance id, or an instance owned by another user (the
    /// two are indistinguishable to the caller on purpose).
    #[error("instance {0} not found")]
    NotFound(InstanceId),

    /// The requested lifecycle action is not legal from the instance's
    /// current status.
    #[error("cannot {action} instance {id} while {from:?}")]
    InvalidTransition {
        id: InstanceId,
        from: InstanceStatus,
        action: &'static str,
    },

    /// The create request itself is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Port(#[from] PortError),

    /// The container runtime failed or timed out. During create the
    /// instance is rolled back to `error` holding nothing; stop and
    /// start leave the instance in its previous status, retryable.
    #[error("runtime failure for instance {id}: {reason}")]
    RuntimeFailure { id: InstanceId, reason: String },

    #[error(transparent)]
    State(#[from] StateError),
}
