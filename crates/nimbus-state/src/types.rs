//! Domain types for the Nimbus state store.
//!
//! These types represent the persisted state of fleet nodes, container
//! instances, and per-user quota limits. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a fleet node.
pub type NodeId = String;

/// Unique identifier for a container instance.
pub type InstanceId = String;

/// Opaque user identifier (auth is an external concern).
pub type UserId = String;

// ── Node ──────────────────────────────────────────────────────────

/// Role a node plays in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    Worker,
    Storage,
}

/// Health classification of a single node, as determined by probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

/// A fleet member capable of hosting instances.
///
/// Identity and declared capacity are immutable after registration;
/// the liveness fields are written only by the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub hostname: String,
    /// Reachable address (VPN IP or DNS name).
    pub address: String,
    pub role: NodeRole,
    /// Declared CPU capacity in cores.
    pub cpu_cores: u32,
    /// Declared memory capacity in GB.
    pub memory_gb: u32,
    pub tags: Vec<String>,

    // Liveness — mutated only via the registry's update path.
    pub is_online: bool,
    pub health: NodeHealth,
    /// Unix timestamp (seconds) of the last completed probe.
    pub last_checked: Option<u64>,
    /// Latency of the last successful probe in milliseconds.
    pub response_time_ms: Option<f64>,
    /// Error message from the last failed probe.
    pub last_error: Option<String>,
}

impl NodeRecord {
    /// Build a node with unknown liveness (fresh registration).
    pub fn new(
        id: impl Into<NodeId>,
        hostname: impl Into<String>,
        address: impl Into<String>,
        role: NodeRole,
        cpu_cores: u32,
        memory_gb: u32,
    ) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            address: address.into(),
            role,
            cpu_cores,
            memory_gb,
            tags: Vec::new(),
            is_online: false,
            health: NodeHealth::Unknown,
            last_checked: None,
            response_time_ms: None,
            last_error: None,
        }
    }
}

/// Outcome of a single liveness probe. Ephemeral — consumed immediately
/// to update the probed node's record, never persisted on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckResult {
    pub node_id: NodeId,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle status of a container instance.
///
/// `pending → running → stopped → running (restart)`;
/// `running|stopped → terminated`; any non-terminal → `error`.
/// Terminated and Error are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopped,
    Terminated,
    Error,
}

impl InstanceStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Terminated | InstanceStatus::Error)
    }

    /// Active instances count toward capacity, quota, and port usage.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            InstanceStatus::Pending | InstanceStatus::Running | InstanceStatus::Stopped
        )
    }
}

/// A user-requested container workload tracked through its lifecycle.
///
/// Terminated instances are retained as historical records but excluded
/// from capacity and quota accounting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub user_id: UserId,
    pub name: String,
    /// Container image reference (e.g. `ubuntu:22.04`).
    pub image: String,
    /// Requested CPU cores.
    pub cpu: u32,
    /// Requested memory in GB.
    pub memory: u32,
    /// Node this instance is placed on.
    pub node_id: NodeId,
    /// Port reserved on that node; kept across stop/start.
    pub port: u16,
    pub status: InstanceStatus,
    /// Unix timestamp (seconds) of creation.
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub stopped_at: Option<u64>,
    /// Failure reason when status is `Error`.
    pub error_message: Option<String>,
}

impl InstanceRecord {
    /// Seconds since the instance started, while it is running.
    pub fn uptime_seconds(&self, now: u64) -> Option<u64> {
        match (self.status, self.started_at) {
            (InstanceStatus::Running, Some(started)) => Some(now.saturating_sub(started)),
            _ => None,
        }
    }
}

// ── Quota ─────────────────────────────────────────────────────────

/// Per-user resource ceiling. The `max_*` limits are authoritative;
/// usage counters are derived from the instance set at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaRecord {
    pub user_id: UserId,
    pub max_instances: u32,
    pub max_cpu: u32,
    pub max_memory: u32,
}

impl QuotaRecord {
    pub fn new(user_id: impl Into<UserId>, max_instances: u32, max_cpu: u32, max_memory: u32) -> Self {
        Self {
            user_id: user_id.into(),
            max_instances,
            max_cpu,
            max_memory,
        }
    }
}

// ── Billing ───────────────────────────────────────────────────────

/// Accrued usage for one user within one billing month.
///
/// Only hours are stored; costs are recomputed from these and the
/// pricing table on read. Accrual starts over when the month rolls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BillingRecord {
    pub user_id: UserId,
    /// Billing month in `YYYY-MM` form.
    pub billing_month: String,
    pub cpu_hours: f64,
    pub memory_gb_hours: f64,
    pub instance_hours: f64,
    /// Unix timestamp (seconds) of the last accrual.
    pub last_updated: u64,
}

impl BillingRecord {
    /// Fresh zeroed accrual for the given month.
    pub fn open(user_id: impl Into<UserId>, billing_month: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            billing_month: billing_month.into(),
            cpu_hours: 0.0,
            memory_gb_hours: 0.0,
            instance_hours: 0.0,
            last_updated: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(InstanceStatus::Terminated.is_terminal());
        assert!(InstanceStatus::Error.is_terminal());
        assert!(!InstanceStatus::Stopped.is_terminal());
        assert!(!InstanceStatus::Pending.is_terminal());
    }

    #[test]
    fn active_states_exclude_terminal() {
        for status in [
            InstanceStatus::Pending,
            InstanceStatus::Running,
            InstanceStatus::Stopped,
        ] {
            assert!(status.is_active());
            assert!(!status.is_terminal());
        }
        assert!(!InstanceStatus::Terminated.is_active());
        assert!(!InstanceStatus::Error.is_active());
    }

    #[test]
    fn uptime_only_while_running() {
        let mut inst = InstanceRecord {
            id: "i-1".to_string(),
            user_id: "u-1".to_string(),
            name: "web".to_string(),
            image: "ubuntu:22.04".to_string(),
            cpu: 1,
            memory: 2,
            node_id: "node-01".to_string(),
            port: 8000,
            status: InstanceStatus::Running,
            created_at: 1000,
            started_at: Some(1005),
            stopped_at: None,
            error_message: None,
        };
        assert_eq!(inst.uptime_seconds(1065), Some(60));

        inst.status = InstanceStatus::Stopped;
        assert_eq!(inst.uptime_seconds(1065), None);
    }

    #[test]
    fn node_starts_with_unknown_liveness() {
        let node = NodeRecord::new("node-01", "worker-01", "100.64.0.1", NodeRole::Worker, 8, 32);
        assert!(!node.is_online);
        assert_eq!(node.health, NodeHealth::Unknown);
        assert!(node.last_checked.is_none());
    }
}
