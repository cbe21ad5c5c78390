// Storage - durable store interface used by the persistence worker
//
// The worker owns its Storage exclusively and calls it one operation at a
// time, so implementations need no internal locking.

use crate::error::StorageResult;
use crate::records::{EntryRecord, SummaryRecord};

/// CRUD over summaries and their child entries.
pub trait Storage: Send {
    /// Insert a new summary stamped with the current time; returns the assigned id.
    fn insert_summary(&mut self, gpa: f64, credits: f64) -> StorageResult<i64>;

    /// Canonical stored form of one summary (without children).
    fn fetch_summary(&mut self, id: i64) -> StorageResult<Option<SummaryRecord>> {
        Ok(self
            .fetch_all_summaries()?
            .into_iter()
            .find(|summary| summary.has_id(id)))
    }

    /// All summaries, newest first, children not loaded.
    fn fetch_all_summaries(&mut self) -> StorageResult<Vec<SummaryRecord>>;

    /// `Ok(false)` when no row had that id.
    fn delete_summary(&mut self, id: i64) -> StorageResult<bool>;

    /// Overwrite gpa, credits and timestamp of an existing summary.
    /// `Ok(false)` when no row had that id (or the record has none).
    fn update_summary(&mut self, summary: &SummaryRecord) -> StorageResult<bool>;

    /// Batched, all-or-nothing insert of child entries.
    fn insert_entries(&mut self, summary_id: i64, entries: &[EntryRecord]) -> StorageResult<()>;

    /// Entries of one summary in their original insertion order.
    fn fetch_entries(&mut self, summary_id: i64) -> StorageResult<Vec<EntryRecord>>;

    /// Explicit child cleanup for stores without cascading deletes.
    fn delete_entries(&mut self, summary_id: i64) -> StorageResult<usize>;

    fn count_summaries(&mut self) -> StorageResult<i64>;
}
