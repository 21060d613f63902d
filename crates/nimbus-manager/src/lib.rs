//! nimbus-manager — container instance lifecycle.
//!
//! # Architecture
//!
//! The manager composes the quota service, capacity scheduler and port
//! allocator into a single admission path. Admission (quota reserve →
//! node selection → port allocation → pending record persisted) runs
//! under one async mutex so two concurrent creates can never observe
//! the same free capacity; the actual container start runs outside the
//! lock so a slow node does not serialize unrelated requests.
//!
//! Every failure after a reservation rolls the reservation back. An
//! instance in `error` state holds no port and no quota.

pub mod error;
pub mod manager;
pub mod runtime;

pub use error::{ManagerError, ManagerResult};
pub use manager::{
    CreateRequest, InstanceManager, ManagerConfig, RecoveryReport, UserSummary,
};
pub use runtime::{ContainerRuntime, NoopRuntime, RuntimeError};
