//! Most-idle placement over the worker fleet.

use nimbus_state::{NodeHealth, NodeId, NodeRecord, NodeRole, StateStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{SchedulerError, SchedulerResult};

/// Request sizes offered by the capacity probe. Instances are sized in
/// whole cores and whole GB.
pub const DEFAULT_CPU_STEPS: [u32; 4] = [1, 2, 4, 8];
pub const DEFAULT_MEMORY_STEPS: [u32; 6] = [1, 2, 4, 8, 16, 32];

/// Free/used breakdown for a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub node_id: NodeId,
    pub total_cpu: u32,
    pub total_memory: u32,
    pub used_cpu: u32,
    pub used_memory: u32,
    pub free_cpu: u32,
    pub free_memory: u32,
}

impl NodeCapacity {
    fn fits(&self, cpu: u32, memory: u32) -> bool {
        self.free_cpu >= cpu && self.free_memory >= memory
    }

    /// Idleness score after a hypothetical placement. Higher is idler.
    fn idle_after(&self, cpu: u32, memory: u32) -> u64 {
        u64::from(self.free_cpu - cpu) + u64::from(self.free_memory - memory)
    }
}

/// Fleet-wide capacity totals plus per-node breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetCapacity {
    pub total_cpu: u32,
    pub total_memory: u32,
    pub used_cpu: u32,
    pub used_memory: u32,
    pub nodes: Vec<NodeCapacity>,
}

/// A request shape the fleet could currently place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityOption {
    pub cpu: u32,
    pub memory: u32,
}

#[derive(Clone)]
pub struct CapacityScheduler {
    store: StateStore,
}

impl CapacityScheduler {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Pick the most idle eligible node for a `cpu` cores / `memory`
    /// GiB request. Fails with the per-dimension maxima still on offer
    /// when nothing fits.
    pub fn select_node(&self, cpu: u32, memory: u32) -> SchedulerResult<NodeRecord> {
        let nodes = self.eligible_nodes()?;
        let capacities = self.capacities_for(&nodes)?;

        let mut best: Option<(&NodeCapacity, u64)> = None;
        for cap in capacities.iter().filter(|c| c.fits(cpu, memory)) {
            let score = cap.idle_after(cpu, memory);
            let better = match best {
                None => true,
                Some((current, current_score)) => {
                    score > current_score
                        || (score == current_score && cap.node_id < current.node_id)
                }
            };
            if better {
                best = Some((cap, score));
            }
        }

        match best {
            Some((cap, score)) => {
                info!(
                    node_id = %cap.node_id,
                    cpu, memory, idle_score = score,
                    "placement selected"
                );
                let node = nodes
                    .into_iter()
                    .find(|n| n.id == cap.node_id)
                    .ok_or_else(|| nimbus_state::StateError::NotFound(cap.node_id.clone()))?;
                Ok(node)
            }
            None => {
                let (max_cpu, max_memory) = max_free(&capacities);
                debug!(cpu, memory, max_cpu, max_memory, "no node fits request");
                Err(SchedulerError::InsufficientCapacity {
                    requested_cpu: cpu,
                    requested_memory: memory,
                    max_cpu_available: max_cpu,
                    max_memory_available: max_memory,
                })
            }
        }
    }

    /// Largest request each dimension could satisfy right now. The two
    /// maxima may come from different nodes, so a request combining
    /// both is not guaranteed to fit.
    pub fn max_capacity(&self) -> SchedulerResult<(u32, u32)> {
        let nodes = self.eligible_nodes()?;
        let capacities = self.capacities_for(&nodes)?;
        Ok(max_free(&capacities))
    }

    /// Request shapes from the given size steps that some single node
    /// could place right now.
    pub fn capacity_options(
        &self,
        cpu_steps: &[u32],
        memory_steps: &[u32],
    ) -> SchedulerResult<Vec<CapacityOption>> {
        let nodes = self.eligible_nodes()?;
        let capacities = self.capacities_for(&nodes)?;

        let mut options = Vec::new();
        for &cpu in cpu_steps {
            for &memory in memory_steps {
                if capacities.iter().any(|c| c.fits(cpu, memory)) {
                    options.push(CapacityOption { cpu, memory });
                }
            }
        }
        Ok(options)
    }

    /// Fleet-wide capacity snapshot over eligible nodes.
    pub fn fleet_capacity(&self) -> SchedulerResult<FleetCapacity> {
        let nodes = self.eligible_nodes()?;
        let capacities = self.capacities_for(&nodes)?;
        Ok(FleetCapacity {
            total_cpu: capacities.iter().map(|c| c.total_cpu).sum(),
            total_memory: capacities.iter().map(|c| c.total_memory).sum(),
            used_cpu: capacities.iter().map(|c| c.used_cpu).sum(),
            used_memory: capacities.iter().map(|c| c.used_memory).sum(),
            nodes: capacities,
        })
    }

    /// Workers that are online and not flagged unhealthy.
    fn eligible_nodes(&self) -> SchedulerResult<Vec<NodeRecord>> {
        let nodes = self
            .store
            .list_nodes()?
            .into_iter()
            .filter(|n| {
                n.role == NodeRole::Worker && n.is_online && n.health != NodeHealth::Unhealthy
            })
            .collect();
        Ok(nodes)
    }

    /// Committed capacity per node, derived from all non-terminal
    /// instances. Stopped instances keep their reservation so a later
    /// start cannot fail for capacity.
    fn capacities_for(&self, nodes: &[NodeRecord]) -> SchedulerResult<Vec<NodeCapacity>> {
        let active = self.store.list_active_instances()?;
        let mut capacities = Vec::with_capacity(nodes.len());
        for node in nodes {
            let (used_cpu, used_memory) = active
                .iter()
                .filter(|i| i.node_id == node.id)
                .fold((0u32, 0u32), |(c, m), i| (c + i.cpu, m + i.memory));
            capacities.push(NodeCapacity {
                node_id: node.id.clone(),
                total_cpu: node.cpu_cores,
                total_memory: node.memory_gb,
                used_cpu,
                used_memory,
                free_cpu: node.cpu_cores.saturating_sub(used_cpu),
                free_memory: node.memory_gb.saturating_sub(used_memory),
            });
        }
        Ok(capacities)
    }
}

fn max_free(capacities: &[NodeCapacity]) -> (u32, u32) {
    let max_cpu = capacities.iter().map(|c| c.free_cpu).max().unwrap_or(0);
    let max_memory = capacities.iter().map(|c| c.free_memory).max().unwrap_or(0);
    (max_cpu, max_memory)
}
