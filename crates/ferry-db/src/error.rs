use ferry_core::AppError;
use thiserror::Error;

/// Errors raised by the trace and copy-status stores
#[derive(Debug, Error)]
pub enum StoreError {
    /// Conditional write lost against a concurrent writer (or the document already exists)
    #[error("Revision conflict for {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    /// Connection-level failures that are worth retrying later.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            ),
            StoreError::Unavailable(_) => true,
            StoreError::Conflict(_) | StoreError::Serialization(_) => false,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => AppError::Database(e),
            StoreError::Unavailable(msg) => AppError::Unavailable(msg),
            StoreError::Conflict(msg) => AppError::Internal(format!("Revision conflict: {}", msg)),
            StoreError::Serialization(e) => {
                AppError::Internal(format!("Stored document is corrupt: {}", e))
            }
        }
    }
}
