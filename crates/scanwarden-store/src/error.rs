use thiserror::Error;

/// Failure modes surfaced by a [`crate::Store`] implementation.
///
/// One variant per operation family plus a couple of structural variants,
/// each wrapping the lower-level cause rather than stringifying it away.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store: {0}")]
    Open(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("delete failed: {0}")]
    Delete(String),

    #[error("list failed: {0}")]
    List(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[cfg(feature = "postgres-backend")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
