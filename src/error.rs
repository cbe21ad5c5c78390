// Errors - storage and service failures
//
// Payloads are kept as strings so every outcome is Clone: a single result is
// handed to the request's callback and then to its ticket.

/// Failure reported by a [`Storage`](crate::storage::Storage) implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Sqlite(err.to_string())
    }
}

/// Terminal failure of a request submitted to the persistence service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Delete or update targeted an id storage doesn't have.
    #[error("summary {0} not found")]
    NotFound(i64),

    #[error("summary has no id; only persisted summaries can be updated")]
    MissingId,

    #[error("summary {0} was inserted but could not be read back")]
    MissingAfterInsert(i64),

    #[error("storage task panicked: {0}")]
    TaskPanicked(String),

    #[error("persistence service is shut down")]
    ShutDown,

    #[error("worker stopped before completing the request")]
    WorkerGone,

    #[error("failed to start worker thread: {0}")]
    WorkerSpawn(String),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
