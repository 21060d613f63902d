//! nimbus-registry — fleet membership and liveness bookkeeping.
//!
//! The registry is the single owner of `NodeRecord`s. Nodes enter the
//! fleet from a static TOML seed file at process start (or via explicit
//! administrative add/remove); only the health monitor writes their
//! liveness fields, through [`NodeRegistry::update_liveness`].

pub mod error;
pub mod registry;
pub mod seed;

pub use error::{RegistryError, RegistryResult};
pub use registry::NodeRegistry;
pub use seed::FleetSeed;
