//! nimbus-ports — per-node collision-free port reservations.
//!
//! Each node hands out ports from a bounded, configurable range.
//! Allocation always picks the lowest free port so placements are
//! deterministic and testable. The allocation table is an in-memory
//! aggregate rebuilt from the persisted instance set at startup via
//! [`PortAllocator::restore`].

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use nimbus_state::NodeId;

/// Errors from port allocation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    /// Every port in the configured range is taken on this node.
    /// Genuine node-local exhaustion — the caller should try another
    /// node on the next scheduling pass, not retry here.
    #[error("port range exhausted on node {node_id} ({range_start}-{range_end})")]
    ExhaustedRange {
        node_id: NodeId,
        range_start: u16,
        range_end: u16,
    },

    /// A restore found the same (node, port) pair twice.
    #[error("port {port} already allocated on node {node_id}")]
    AlreadyAllocated { node_id: NodeId, port: u16 },

    /// A restored reservation falls outside the configured range.
    #[error("port {port} on node {node_id} outside range {range_start}-{range_end}")]
    OutOfRange {
        node_id: NodeId,
        port: u16,
        range_start: u16,
        range_end: u16,
    },
}

pub type PortResult<T> = Result<T, PortError>;

/// Inclusive port range available for instance allocation.
#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 8000,
            end: 8999,
        }
    }
}

/// Hands out unique ports per node and reclaims them on termination.
///
/// A stopped instance retains its port so it can restart in place;
/// only termination releases it.
pub struct PortAllocator {
    range: PortRange,
    /// node_id → set of ports currently reserved on that node.
    allocated: Mutex<HashMap<NodeId, BTreeSet<u16>>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            allocated: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the lowest free port in range on the given node.
    pub async fn allocate(&self, node_id: &str) -> PortResult<u16> {
        let mut allocated = self.allocated.lock().await;
        let taken = allocated.entry(node_id.to_string()).or_default();

        let port = (self.range.start..=self.range.end)
            .find(|p| !taken.contains(p))
            .ok_or_else(|| PortError::ExhaustedRange {
                node_id: node_id.to_string(),
                range_start: self.range.start,
                range_end: self.range.end,
            })?;

        taken.insert(port);
        debug!(%node_id, port, "port allocated");
        Ok(port)
    }

    /// Release a port on a node. Idempotent: releasing a port that is
    /// not held is a no-op, so duplicate termination events are safe.
    pub async fn release(&self, node_id: &str, port: u16) {
        let mut allocated = self.allocated.lock().await;
        if let Some(taken) = allocated.get_mut(node_id) {
            if taken.remove(&port) {
                debug!(%node_id, port, "port released");
            }
        }
    }

    /// Re-register a reservation recovered from persisted state.
    /// Rejects duplicates and out-of-range ports so a corrupted store
    /// surfaces loudly instead of silently double-booking.
    pub async fn restore(&self, node_id: &str, port: u16) -> PortResult<()> {
        if port < self.range.start || port > self.range.end {
            return Err(PortError::OutOfRange {
                node_id: node_id.to_string(),
                port,
                range_start: self.range.start,
                range_end: self.range.end,
            });
        }
        let mut allocated = self.allocated.lock().await;
        let taken = allocated.entry(node_id.to_string()).or_default();
        if !taken.insert(port) {
            return Err(PortError::AlreadyAllocated {
                node_id: node_id.to_string(),
                port,
            });
        }
        Ok(())
    }

    /// Number of ports currently reserved on a node.
    pub async fn allocated_count(&self, node_id: &str) -> usize {
        let allocated = self.allocated.lock().await;
        allocated.get(node_id).map_or(0, BTreeSet::len)
    }

    /// Drop every reservation for a node (node removed from the fleet).
    pub async fn forget_node(&self, node_id: &str) -> usize {
        let mut allocated = self.allocated.lock().await;
        allocated.remove(node_id).map_or(0, |taken| taken.len())
    }
}
