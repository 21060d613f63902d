//! NodeRegistry — the single owner of fleet node records.

use tracing::{debug, info, warn};

use nimbus_state::{HealthCheckResult, NodeHealth, NodeRecord, StateStore};

use crate::error::{RegistryError, RegistryResult};
use crate::seed::FleetSeed;

/// Registry over the persisted node set.
///
/// All mutations go through this type: seeding at startup, explicit
/// administrative add/remove, and liveness updates from the health
/// monitor. No node ever exists twice under the same id.
#[derive(Clone)]
pub struct NodeRegistry {
    store: StateStore,
}

impl NodeRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Apply a fleet seed: register nodes that are new, refresh the
    /// static identity of nodes that already exist. Liveness fields of
    /// existing nodes are preserved, so re-seeding at every start is
    /// safe.
    pub fn seed(&self, seed: FleetSeed) -> RegistryResult<usize> {
        let mut added = 0;
        for entry in seed.nodes {
            match self.store.get_node(&entry.id)? {
                Some(existing) => {
                    let mut record = entry.into_record();
                    record.is_online = existing.is_online;
                    record.health = existing.health;
                    record.last_checked = existing.last_checked;
                    record.response_time_ms = existing.response_time_ms;
                    record.last_error = existing.last_error;
                    self.store.put_node(&record)?;
                    debug!(node_id = %record.id, "node refreshed from seed");
                }
                None => {
                    let record = entry.into_record();
                    self.store.put_node(&record)?;
                    info!(node_id = %record.id, role = ?record.role, "node registered from seed");
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// List every registered node.
    pub fn list(&self) -> RegistryResult<Vec<NodeRecord>> {
        Ok(self.store.list_nodes()?)
    }

    /// Get a node by id.
    pub fn get(&self, node_id: &str) -> RegistryResult<NodeRecord> {
        self.store
            .get_node(node_id)?
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))
    }

    /// Register a new node. Rejects duplicate ids.
    pub fn add(&self, node: NodeRecord) -> RegistryResult<()> {
        if self.store.get_node(&node.id)?.is_some() {
            return Err(RegistryError::DuplicateNode(node.id));
        }
        info!(node_id = %node.id, role = ?node.role, "node registered");
        self.store.put_node(&node)?;
        Ok(())
    }

    /// Remove a node from the fleet.
    pub fn remove(&self, node_id: &str) -> RegistryResult<()> {
        if !self.store.delete_node(node_id)? {
            return Err(RegistryError::NodeNotFound(node_id.to_string()));
        }
        info!(%node_id, "node removed");
        Ok(())
    }

    /// Apply a probe result to a single node's liveness fields.
    ///
    /// A reachable node becomes online/healthy; an unreachable one goes
    /// offline with health unknown. No other node is affected.
    pub fn update_liveness(
        &self,
        node_id: &str,
        result: &HealthCheckResult,
        checked_at: u64,
    ) -> RegistryResult<()> {
        let mut node = self.get(node_id)?;

        node.is_online = result.reachable;
        node.health = if result.reachable {
            NodeHealth::Healthy
        } else {
            NodeHealth::Unknown
        };
        node.last_checked = Some(checked_at);
        node.response_time_ms = result.latency_ms;
        node.last_error = result.error.clone();

        if !result.reachable {
            warn!(%node_id, error = ?node.last_error, "node unreachable");
        }
        self.store.put_node(&node)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_state::NodeRole;

    fn test_registry() -> NodeRegistry {
        NodeRegistry::new(StateStore::open_in_memory().unwrap())
    }

    fn test_node(id: &str) -> NodeRecord {
        NodeRecord::new(id, format!("host-{id}"), "100.64.0.1", NodeRole::Worker, 8, 32)
    }

    const SEED: &str = r#"
[[nodes]]
id = "node-01"
hostname = "worker-01"
address = "100.64.0.1"
cpu_cores = 8
memory_gb = 32

[[nodes]]
id = "node-02"
hostname = "worker-02"
address = "100.64.0.2"
cpu_cores = 4
memory_gb = 16
"#;

    #[test]
    fn seed_registers_new_nodes() {
        let registry = test_registry();
        let added = registry.seed(FleetSeed::from_str(SEED).unwrap()).unwrap();
        assert_eq!(added, 2);
        assert_eq!(registry.list().unwrap().len(), 2);
    }

    #[test]
    fn seed_is_idempotent_and_preserves_liveness() {
        let registry = test_registry();
        registry.seed(FleetSeed::from_str(SEED).unwrap()).unwrap();

        // Mark node-01 online via a probe result.
        let result = HealthCheckResult {
            node_id: "node-01".to_string(),
            reachable: true,
            latency_ms: Some(3.2),
            error: None,
        };
        registry.update_liveness("node-01", &result, 5000).unwrap();

        // Re-seed: no new nodes, liveness intact.
        let added = registry.seed(FleetSeed::from_str(SEED).unwrap()).unwrap();
        assert_eq!(added, 0);

        let node = registry.get("node-01").unwrap();
        assert!(node.is_online);
        assert_eq!(node.health, NodeHealth::Healthy);
        assert_eq!(node.last_checked, Some(5000));
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let registry = test_registry();
        registry.add(test_node("node-01")).unwrap();

        let err = registry.add(test_node("node-01")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateNode(_)));
    }

    #[test]
    fn get_unknown_node_is_not_found() {
        let registry = test_registry();
        assert!(matches!(
            registry.get("nope"),
            Err(RegistryError::NodeNotFound(_))
        ));
    }

    #[test]
    fn remove_then_get_fails() {
        let registry = test_registry();
        registry.add(test_node("node-01")).unwrap();
        registry.remove("node-01").unwrap();

        assert!(matches!(
            registry.remove("node-01"),
            Err(RegistryError::NodeNotFound(_))
        ));
        assert!(registry.get("node-01").is_err());
    }

    #[test]
    fn update_liveness_touches_only_target_node() {
        let registry = test_registry();
        registry.add(test_node("node-01")).unwrap();
        registry.add(test_node("node-02")).unwrap();

        let result = HealthCheckResult {
            node_id: "node-01".to_string(),
            reachable: false,
            latency_ms: None,
            error: Some("connection timed out".to_string()),
        };
        registry.update_liveness("node-01", &result, 9000).unwrap();

        let probed = registry.get("node-01").unwrap();
        assert!(!probed.is_online);
        assert_eq!(probed.health, NodeHealth::Unknown);
        assert_eq!(probed.last_error.as_deref(), Some("connection timed out"));

        let untouched = registry.get("node-02").unwrap();
        assert!(untouched.last_checked.is_none());
        assert_eq!(untouched.health, NodeHealth::Unknown);
        assert!(!untouched.is_online);
    }

    #[test]
    fn reachable_probe_marks_healthy() {
        let registry = test_registry();
        registry.add(test_node("node-01")).unwrap();

        let result = HealthCheckResult {
            node_id: "node-01".to_string(),
            reachable: true,
            latency_ms: Some(12.5),
            error: None,
        };
        registry.update_liveness("node-01", &result, 100).unwrap();

        let node = registry.get("node-01").unwrap();
        assert!(node.is_online);
        assert_eq!(node.health, NodeHealth::Healthy);
        assert_eq!(node.response_time_ms, Some(12.5));
        assert!(node.last_error.is_none());
    }
}
