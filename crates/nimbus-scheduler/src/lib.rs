//! nimbus-scheduler — capacity-aware node selection.
//!
//! # Architecture
//!
//! The scheduler is stateless: committed capacity is derived on every
//! decision from the persisted instance table (pending, running and
//! stopped instances all hold their reservation). A node is eligible
//! for placement when it is a worker, online, not flagged unhealthy,
//! and has enough free CPU and memory for the request. Among eligible
//! nodes the most idle one wins — the node with the most total free
//! capacity remaining after the placement, ties broken by lowest node
//! id so decisions are deterministic.

pub mod error;
pub mod scheduler;
pub mod snapshot;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{
    CapacityOption, CapacityScheduler, FleetCapacity, NodeCapacity, DEFAULT_CPU_STEPS,
    DEFAULT_MEMORY_STEPS,
};
pub use snapshot::{NoTelemetry, NodeUsage, ResourceSnapshot};
