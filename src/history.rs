// Observable History - in-memory mirror of persisted summaries
//
// Newest first. Only the persistence service mutates it (from the consumer
// context, while applying a finished job); everyone else reads it or
// subscribes to change events.

use crate::records::{EntryRecord, SummaryRecord};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// What a single mutation did to the history.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryChange {
    /// A newly saved summary was put at position 0.
    Prepended { id: Option<i64> },
    /// Every record with `id` was dropped (`count` is how many).
    Removed { id: i64, count: usize },
    /// The first record with `id` was swapped for an updated one.
    Replaced { id: i64 },
    /// Contents were cleared and repopulated from storage.
    Reloaded { len: usize },
    /// Children of the record with `id` were (re)loaded.
    ChildrenLoaded { id: i64, count: usize },
}

/// Change notification carrying the revision it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEvent {
    pub revision: u64,
    pub change: HistoryChange,
}

#[derive(Debug)]
pub struct ObservableHistory {
    records: Vec<SummaryRecord>,
    /// Bumped on every mutation; lets pollers skip redraws.
    revision: u64,
    events: broadcast::Sender<HistoryEvent>,
}

impl ObservableHistory {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            records: Vec::new(),
            revision: 0,
            events,
        }
    }

    // ========================================================================
    // READ ACCESS
    // ========================================================================

    pub fn records(&self) -> &[SummaryRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SummaryRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SummaryRecord> {
        self.records.get(index)
    }

    /// First record carrying `id`.
    pub fn find(&self, id: i64) -> Option<&SummaryRecord> {
        self.records.iter().find(|r| r.has_id(id))
    }

    pub fn contains(&self, id: i64) -> bool {
        self.find(id).is_some()
    }

    /// Owned copy for handing to another thread.
    pub fn snapshot(&self) -> Vec<SummaryRecord> {
        self.records.clone()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Receive an event for every mutation made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // MUTATION (persistence service only)
    // ========================================================================

    pub(crate) fn prepend(&mut self, record: SummaryRecord) {
        let id = record.id;
        self.records.insert(0, record);
        self.publish(HistoryChange::Prepended { id });
    }

    /// Drop every record with `id`; returns how many were removed.
    pub(crate) fn remove_id(&mut self, id: i64) -> usize {
        let before = self.records.len();
        self.records.retain(|r| !r.has_id(id));
        let count = before - self.records.len();

        if count > 0 {
            self.publish(HistoryChange::Removed { id, count });
        }
        count
    }

    /// Replace the first record sharing `record`'s id. False when none matched.
    pub(crate) fn replace(&mut self, record: SummaryRecord) -> bool {
        let Some(id) = record.id else {
            return false;
        };

        match self.records.iter_mut().find(|r| r.has_id(id)) {
            Some(slot) => {
                *slot = record;
                self.publish(HistoryChange::Replaced { id });
                true
            }
            None => false,
        }
    }

    /// Clear, then repopulate. Never merges.
    pub(crate) fn replace_all(&mut self, records: Vec<SummaryRecord>) {
        self.records.clear();
        self.records.extend(records);
        let len = self.records.len();
        self.publish(HistoryChange::Reloaded { len });
    }

    /// Set children on the first record with `id`. False when none matched.
    pub(crate) fn set_children(&mut self, id: i64, children: Vec<EntryRecord>) -> bool {
        match self.records.iter_mut().find(|r| r.has_id(id)) {
            Some(record) => {
                let count = children.len();
                record.children = children;
                self.publish(HistoryChange::ChildrenLoaded { id, count });
                true
            }
            None => false,
        }
    }

    fn publish(&mut self, change: HistoryChange) {
        self.revision += 1;
        // No subscribers is fine
        let _ = self.events.send(HistoryEvent {
            revision: self.revision,
            change,
        });
    }
}

impl Default for ObservableHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> IntoIterator for &'a ObservableHistory {
    type Item = &'a SummaryRecord;
    type IntoIter = std::slice::Iter<'a, SummaryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
