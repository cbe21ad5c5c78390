// Config - runtime settings for the persistence service
//
// Resolved once by the embedding application and passed in; the library never
// reads environment variables itself.

use std::path::{Path, PathBuf};

pub const DEFAULT_DATABASE_FILE: &str = "gpa_history.db";
pub const DEFAULT_WORKER_NAME: &str = "gpa-db-worker";

#[derive(Clone, Debug, PartialEq)]
pub struct HistoryConfig {
    database_path: PathBuf,
    worker_name: String,
}

impl HistoryConfig {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            worker_name: DEFAULT_WORKER_NAME.to_string(),
        }
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Thread name of the background worker (shows up in logs and debuggers).
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATABASE_FILE)
    }
}
