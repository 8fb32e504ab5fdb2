use crate::store::StoreError;

/// Engine-level error type.
///
/// Business-rule refusals (active legal hold, terminal DSAR state, unknown
/// id) are *not* errors: operations return `Ok(false)` / `Ok(None)` and write
/// an audit entry. Only storage faults, serialization problems, and I/O
/// failures surface here.
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GovernanceError>;
