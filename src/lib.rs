// GPA History - core library
// GPA calculation plus an asynchronous, single-worker persistence service
// that mirrors saved results into an observable in-memory history.

pub mod config;
pub mod db;
pub mod error;
pub mod gpa;
pub mod grade_scale;
pub mod history;
pub mod lifecycle;
pub mod records;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use config::HistoryConfig;
pub use db::{setup_database, SqliteStorage};
pub use error::{ServiceError, ServiceResult, StorageError, StorageResult};
pub use gpa::GpaSummary;
pub use history::{HistoryChange, HistoryEvent, ObservableHistory};
pub use lifecycle::LifecycleState;
pub use records::{EntryRecord, SummaryRecord, TIMESTAMP_FORMAT};
pub use service::{Callbacks, PersistenceService, SavedSummary, Ticket};
pub use storage::Storage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
