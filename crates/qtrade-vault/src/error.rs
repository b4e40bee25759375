use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Memory not found: {0}")]
    NotFound(Uuid),

    #[error("Memory already applied: {0}")]
    AlreadyApplied(Uuid),

    #[error("Consolidation already in progress")]
    ConsolidationConflict,

    #[error("Stored value could not be decoded: {0}")]
    Decode(String),

    #[error("Vault not available: {0}")]
    Unavailable(String),
}
