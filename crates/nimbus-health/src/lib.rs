//! nimbus-health — concurrent fleet liveness probing.
//!
//! One probe per registered node, fanned out concurrently and each
//! bounded by a per-probe timeout, so a single dead node never stalls
//! the batch. Probe results are applied to the node registry serially;
//! the aggregate cluster view is recomputed only after every probe has
//! completed (success, failure, or timeout).
//!
//! Individual probe failures are swallowed into the node's own liveness
//! state — the only monitor-wide error is an empty fleet.

pub mod monitor;
pub mod probe;

pub use monitor::{
    ClusterHealth, ClusterSummary, ClusterView, HealthError, HealthMonitor, HealthPolicy,
    HealthResult, MonitorConfig, RoleSummary,
};
pub use probe::{Pinger, ProbeError, TcpPinger};
