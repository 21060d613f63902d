//! Registry error types.

use thiserror::Error;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node already registered: {0}")]
    DuplicateNode(String),

    #[error("failed to read fleet seed {path}: {reason}")]
    Seed { path: String, reason: String },

    #[error("state store error: {0}")]
    State(#[from] nimbus_state::StateError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
