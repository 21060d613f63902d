//! StateStore — redb-backed persistence for the Nimbus orchestrator.
//!
//! Provides typed CRUD operations over nodes, instances, and quotas.
//! All values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter
//! for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(QUOTAS).map_err(map_err!(Table))?;
        txn.open_table(BILLING).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node record.
    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(node.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a node by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(node_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: NodeRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all nodes.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: NodeRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
            results.push(node);
        }
        Ok(results)
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(node_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_id, existed, "node deleted");
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
    pub fn put_instance(&self, instance: &InstanceRecord) -> StateResult<()> {
        let value = serde_json::to_vec(instance).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(instance.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an instance by ID.
    pub fn get_instance(&self, instance_id: &str) -> StateResult<Option<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(instance_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let instance: InstanceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    /// List all instances, terminated history included.
    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let instance: InstanceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
            results.push(instance);
        }
        Ok(results)
    }

    /// List instances that count toward capacity and quota
    /// (pending, running, or stopped).
    pub fn list_active_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.status.is_active())
            .collect())
    }

    /// List all instances owned by a user.
    pub fn list_instances_for_user(&self, user_id: &str) -> StateResult<Vec<InstanceRecord>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.user_id == user_id)
            .collect())
    }

    /// Delete an instance by ID. Returns true if it existed.
    ///
    /// Normal lifecycle keeps terminated records as history; deletion is
    /// for administrative cleanup only.
    pub fn delete_instance(&self, instance_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table.remove(instance_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Quotas ─────────────────────────────────────────────────────

    /// Insert or update a user's quota limits.
    pub fn put_quota(&self, quota: &QuotaRecord) -> StateResult<()> {
        let value = serde_json::to_vec(quota).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(QUOTAS).map_err(map_err!(Table))?;
            table
                .insert(quota.user_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a user's quota limits.
    pub fn get_quota(&self, user_id: &str) -> StateResult<Option<QuotaRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(QUOTAS).map_err(map_err!(Table))?;
        match table.get(user_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let quota: QuotaRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(quota))
            }
            None => Ok(None),
        }
    }

    // ── Billing ────────────────────────────────────────────────────

    /// Insert or update a user's monthly usage accrual.
    pub fn put_billing(&self, record: &BillingRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BILLING).map_err(map_err!(Table))?;
            table
                .insert(record.user_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a user's monthly usage accrual.
    pub fn get_billing(&self, user_id: &str) -> StateResult<Option<BillingRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BILLING).map_err(map_err!(Table))?;
        match table.get(user_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: BillingRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all stored quota records.
    pub fn list_quotas(&self) -> StateResult<Vec<QuotaRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(QUOTAS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let quota: QuotaRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
            results.push(quota);
        }
        Ok(results)
    }
}
