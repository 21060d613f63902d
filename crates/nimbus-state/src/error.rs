//! Error taxonomy for the Nimbus state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Failures the store surfaces to the orchestration layers.
///
/// redb distinguishes transaction, table, and cursor failures; those
/// distinctions are kept so a corrupt database reads differently from
/// a transient write problem. JSON encoding and decoding of stored
/// records are one concern here and collapse into [`StateError::Codec`].
#[derive(Debug, Error)]
pub enum StateError {
    /// The database file could not be created or opened.
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    /// A stored record failed to encode or decode as JSON.
    #[error("record codec error: {0}")]
    Codec(String),

    /// A lookup that required the record to exist came up empty.
    #[error("not found: {0}")]
    NotFound(String),
}
