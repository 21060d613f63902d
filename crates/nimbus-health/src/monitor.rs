//! Fleet health monitor.
//!
//! # Architecture
//!
//! The monitor owns a [`Pinger`] and a handle to the node registry. On
//! each sweep it spawns one probe task per registered node into a
//! `JoinSet`, each bounded by the per-probe timeout, then applies the
//! results to the registry one at a time as tasks complete. A sweep
//! therefore finishes within roughly one probe timeout no matter how
//! many nodes are hung.
//!
//! The aggregate cluster verdict is a pure function of the node records
//! after the sweep: availability (online / total) is compared against
//! the policy thresholds.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nimbus_registry::{NodeRegistry, RegistryError};
use nimbus_state::{HealthCheckResult, NodeRecord, NodeRole};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::probe::Pinger;

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    /// A sweep over an empty fleet has nothing to report.
    #[error("no nodes registered")]
    NoNodes,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Overall cluster verdict, derived from fleet availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

/// Availability thresholds that map the online fraction to a verdict.
/// Below `degraded_below` the cluster is degraded; below
/// `unhealthy_below` it is unhealthy; zero online nodes is offline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthPolicy {
    pub degraded_below: f64,
    pub unhealthy_below: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            degraded_below: 1.0,
            unhealthy_below: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Pause between background sweeps.
    pub interval: Duration,
    /// Upper bound for a single node probe.
    pub probe_timeout: Duration,
    pub policy: HealthPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            policy: HealthPolicy::default(),
        }
    }
}

/// Fleet-wide counters for one sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub offline_nodes: usize,
    pub availability_percent: f64,
}

/// Per-role slice of the fleet counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSummary {
    pub role: NodeRole,
    pub total: usize,
    pub online: usize,
}

/// Aggregate view returned by a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    pub health: ClusterHealth,
    pub summary: ClusterSummary,
    pub roles: Vec<RoleSummary>,
    pub checked_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeRecord>>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    registry: NodeRegistry,
    pinger: Arc<dyn Pinger>,
    config: MonitorConfig,
}

impl HealthMonitor {
    pub fn new(registry: NodeRegistry, pinger: Arc<dyn Pinger>, config: MonitorConfig) -> Self {
        Self {
            registry,
            pinger,
            config,
        }
    }

    /// Probe a single node. Never fails: probe errors fold into the
    /// result's `reachable` / `error` fields.
    async fn probe_node(pinger: Arc<dyn Pinger>, node: NodeRecord, timeout: Duration) -> HealthCheckResult {
        match pinger.ping(&node.address, timeout).await {
            Ok(latency) => HealthCheckResult {
                node_id: node.id,
                reachable: true,
                latency_ms: Some(latency.as_secs_f64() * 1000.0),
                error: None,
            },
            Err(e) => HealthCheckResult {
                node_id: node.id,
                reachable: false,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Sweep the whole fleet once: fan out one probe per node, apply
    /// each result to the registry as it lands, and return the results.
    pub async fn check_all(&self) -> HealthResult<Vec<HealthCheckResult>> {
        let nodes = self.registry.list()?;
        if nodes.is_empty() {
            return Err(HealthError::NoNodes);
        }

        let checked_at = unix_now();
        let mut probes = JoinSet::new();
        for node in nodes {
            let pinger = Arc::clone(&self.pinger);
            let timeout = self.config.probe_timeout;
            probes.spawn(Self::probe_node(pinger, node, timeout));
        }

        let mut results = Vec::with_capacity(probes.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => {
                    if !result.reachable {
                        warn!(
                            node_id = %result.node_id,
                            error = result.error.as_deref().unwrap_or("unknown"),
                            "node probe failed"
                        );
                    }
                    self.registry.update_liveness(&result.node_id, &result, checked_at)?;
                    results.push(result);
                }
                Err(e) => error!(error = %e, "probe task failed"),
            }
        }

        debug!(
            probed = results.len(),
            online = results.iter().filter(|r| r.reachable).count(),
            "fleet sweep complete"
        );
        Ok(results)
    }

    /// Sweep the fleet, then compute the aggregate verdict from the
    /// refreshed node records.
    pub async fn cluster_view(&self, include_nodes: bool) -> HealthResult<ClusterView> {
        self.check_all().await?;
        let nodes = self.registry.list()?;
        Ok(aggregate(&nodes, &self.config.policy, include_nodes))
    }

    /// Background sweep loop. Runs until the shutdown channel flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            probe_timeout_ms = self.config.probe_timeout.as_millis() as u64,
            "health monitor started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.check_all().await {
                        Ok(results) => {
                            let offline = results.iter().filter(|r| !r.reachable).count();
                            if offline > 0 {
                                warn!(offline, total = results.len(), "sweep found offline nodes");
                            }
                        }
                        Err(HealthError::NoNodes) => debug!("no nodes registered, skipping sweep"),
                        Err(e) => error!(error = %e, "fleet sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Map refreshed node records to the aggregate cluster view.
pub fn aggregate(nodes: &[NodeRecord], policy: &HealthPolicy, include_nodes: bool) -> ClusterView {
    let total = nodes.len();
    let online = nodes.iter().filter(|n| n.is_online).count();
    let availability = if total == 0 {
        0.0
    } else {
        online as f64 / total as f64
    };

    let health = if online == 0 {
        ClusterHealth::Offline
    } else if availability < policy.unhealthy_below {
        ClusterHealth::Unhealthy
    } else if availability < policy.degraded_below {
        ClusterHealth::Degraded
    } else {
        ClusterHealth::Healthy
    };

    let mut roles: Vec<RoleSummary> = Vec::new();
    for role in [NodeRole::Master, NodeRole::Worker, NodeRole::Storage] {
        let in_role: Vec<_> = nodes.iter().filter(|n| n.role == role).collect();
        if in_role.is_empty() {
            continue;
        }
        roles.push(RoleSummary {
            role,
            total: in_role.len(),
            online: in_role.iter().filter(|n| n.is_online).count(),
        });
    }

    ClusterView {
        health,
        summary: ClusterSummary {
            total_nodes: total,
            online_nodes: online,
            offline_nodes: total - online,
            availability_percent: availability * 100.0,
        },
        roles,
        checked_at: unix_now(),
        nodes: include_nodes.then(|| nodes.to_vec()),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
