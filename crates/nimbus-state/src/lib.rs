//! nimbus-state — embedded state store for the Nimbus orchestrator.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for fleet nodes, container instances, user quotas,
//! and billing accrual.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by their natural id (`node_id`, `instance_id`, `user_id`).
//!
//! Port allocations and quota usage counters are *not* stored in their own
//! tables: both are derived aggregates over the non-terminal instance set
//! and are rebuilt from it at process start, so the instance table stays
//! the single source of truth.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
