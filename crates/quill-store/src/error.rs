use thiserror::Error;

/// Persistence-layer failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid record: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
