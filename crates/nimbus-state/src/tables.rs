//! redb table definitions for the Nimbus state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Keys are the natural ids of the records they hold.

use redb::TableDefinition;

/// Fleet nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Container instances keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// User quota limits keyed by `{user_id}`.
pub const QUOTAS: TableDefinition<&str, &[u8]> = TableDefinition::new("quotas");

/// Monthly usage accrual keyed by `{user_id}`.
pub const BILLING: TableDefinition<&str, &[u8]> = TableDefinition::new("billing");
