//! fleet.toml seed file parser.
//!
//! The fleet is declared statically: one `[[nodes]]` entry per member
//! with its identity and declared capacity. Liveness is never part of
//! the seed — it is discovered by the health monitor at runtime.

use std::path::Path;

use serde::{Deserialize, Serialize};

use nimbus_state::{NodeRecord, NodeRole};

use crate::error::{RegistryError, RegistryResult};

/// Parsed contents of a fleet seed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSeed {
    #[serde(default)]
    pub nodes: Vec<NodeSeed>,
}

/// A single `[[nodes]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSeed {
    pub id: String,
    pub hostname: String,
    pub address: String,
    #[serde(default = "default_role")]
    pub role: NodeRole,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_role() -> NodeRole {
    NodeRole::Worker
}

impl FleetSeed {
    /// Load and parse a seed file.
    pub fn from_file(path: &Path) -> RegistryResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RegistryError::Seed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| RegistryError::Seed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Parse a seed from a TOML string.
    pub fn from_str(content: &str) -> RegistryResult<Self> {
        toml::from_str(content).map_err(|e| RegistryError::Seed {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })
    }
}

impl NodeSeed {
    /// Convert into a fresh node record with unknown liveness.
    pub fn into_record(self) -> NodeRecord {
        let mut record = NodeRecord::new(
            self.id,
            self.hostname,
            self.address,
            self.role,
            self.cpu_cores,
            self.memory_gb,
        );
        record.tags = self.tags;
        record
    }
}
