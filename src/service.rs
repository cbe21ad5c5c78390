// Persistence Service - asynchronous requests over a single storage worker
//
// Requests are queued for the background worker that owns the Storage. Each
// finished job sends back a completion; the consumer (whoever owns the
// service, typically a UI loop) applies completions with `dispatch_pending`
// or awaits them with `complete`. Applying a completion updates the
// ObservableHistory, then fires exactly one of the request's callbacks, then
// resolves its Ticket. None of that ever runs on the worker.
//
//   let mut service = PersistenceService::open(&HistoryConfig::default())?;
//   let saved = service.complete(service.save(3.75, 15.0)).await?;
//   assert_eq!(service.history().get(0), Some(&saved));

use crate::config::HistoryConfig;
use crate::db::SqliteStorage;
use crate::error::{ServiceError, ServiceResult, StorageError};
use crate::history::{HistoryEvent, ObservableHistory};
use crate::lifecycle::{Job, LifecycleState, Worker};
use crate::records::{EntryRecord, SummaryRecord};
use crate::storage::Storage;
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Work that must run on the consumer context.
type Completion = Box<dyn FnOnce(&mut ObservableHistory) + Send + 'static>;

// ============================================================================
// CALLBACKS & TICKETS
// ============================================================================

/// Optional continuations for one request: at most one success and one
/// failure handler, and exactly one of them runs.
pub struct Callbacks<T> {
    on_success: Option<Box<dyn FnOnce(&T) + Send + 'static>>,
    on_failure: Option<Box<dyn FnOnce(&ServiceError) + Send + 'static>>,
}

impl<T> Callbacks<T> {
    pub fn none() -> Self {
        Self {
            on_success: None,
            on_failure: None,
        }
    }

    pub fn on_success(mut self, f: impl FnOnce(&T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_failure(mut self, f: impl FnOnce(&ServiceError) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }

    fn fire(self, result: &ServiceResult<T>) {
        match result {
            Ok(value) => {
                if let Some(f) = self.on_success {
                    f(value);
                }
            }
            Err(err) => {
                if let Some(f) = self.on_failure {
                    f(err);
                }
            }
        }
    }
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Self::none()
    }
}

/// Handle to the single outcome of a submitted request.
///
/// Resolved on the consumer context when the request's completion is
/// dispatched. Dropping a ticket does not cancel the request.
#[must_use = "a ticket is the only way to observe the request's outcome"]
pub struct Ticket<T> {
    request: u64,
    outcome: oneshot::Receiver<ServiceResult<T>>,
    taken: bool,
}

impl<T> Ticket<T> {
    /// Sequence number of the request, in submission order.
    pub fn request_id(&self) -> u64 {
        self.request
    }

    /// Take the outcome if it has been dispatched. Yields `Some` at most once.
    pub fn try_outcome(&mut self) -> Option<ServiceResult<T>> {
        if self.taken {
            return None;
        }

        let outcome = match self.outcome.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            // Job dropped without reporting; only happens if the worker died
            Err(oneshot::error::TryRecvError::Closed) => Err(ServiceError::WorkerGone),
        };

        self.taken = true;
        Some(outcome)
    }
}

/// Result of [`PersistenceService::save_with_children`].
///
/// The summary is saved even when its children are not: `children_error`
/// carries the child insert failure and `record.children` is then empty.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedSummary {
    pub record: SummaryRecord,
    pub children_error: Option<StorageError>,
}

impl SavedSummary {
    /// True when the summary and all of its entries were stored.
    pub fn is_complete(&self) -> bool {
        self.children_error.is_none()
    }
}

/// Consumer-side half of a request: history update, callbacks, ticket.
struct Finish<T> {
    apply: Box<dyn FnOnce(&mut ObservableHistory, &T) + Send + 'static>,
    callbacks: Callbacks<T>,
    reply: oneshot::Sender<ServiceResult<T>>,
}

/// Everything needed to finish a request on the consumer side.
///
/// Dropped without being settled (the job was discarded, or the worker thread
/// died while holding it), it queues a `WorkerGone` completion instead, so
/// every request still resolves exactly once on the consumer.
struct Pending<T: Send + 'static> {
    op: &'static str,
    request: u64,
    finish: Option<Finish<T>>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl<T: Send + 'static> Pending<T> {
    fn settle(mut self, result: ServiceResult<T>, history: &mut ObservableHistory) {
        if let Some(finish) = self.finish.take() {
            finish.run(self.op, self.request, result, history);
        }
    }
}

impl<T: Send + 'static> Drop for Pending<T> {
    fn drop(&mut self) {
        let Some(finish) = self.finish.take() else {
            return;
        };
        if self.completions.is_closed() {
            // Service itself was dropped; nobody is waiting on this request
            return;
        }

        let (op, request) = (self.op, self.request);
        error!(op, request, "request dropped before completion; persistence worker is gone");

        // Can still race with the service being dropped
        let _ = self.completions.send(Box::new(move |history: &mut ObservableHistory| {
            finish.run(op, request, Err(ServiceError::WorkerGone), history)
        }));
    }
}

impl<T> Finish<T> {
    fn run(
        self,
        op: &'static str,
        request: u64,
        result: ServiceResult<T>,
        history: &mut ObservableHistory,
    ) {
        match &result {
            Ok(value) => {
                (self.apply)(history, value);
                debug!(op, request, "request completed");
            }
            Err(err) => warn!(op, request, error = %err, "request failed"),
        }

        self.callbacks.fire(&result);

        // Caller may have dropped the ticket
        let _ = self.reply.send(result);
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// Owns the worker, the job queue and the observable history.
///
/// Submitting takes `&self` and never blocks. Dispatching takes `&mut self`:
/// the history is only ever mutated by whoever owns the service. The service
/// is `Send` but not `Sync`; hand `&PersistenceService` to readers on the
/// consumer context.
pub struct PersistenceService {
    worker: Worker,
    history: ObservableHistory,
    completions: mpsc::UnboundedReceiver<Completion>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    next_request: Cell<u64>,
    in_flight: Cell<usize>,
}

impl PersistenceService {
    /// Start a service (and its worker thread) over the given storage.
    pub fn start<S>(storage: S, config: &HistoryConfig) -> ServiceResult<Self>
    where
        S: Storage + 'static,
    {
        let worker = Worker::spawn(storage, config.worker_name())?;
        let (completion_tx, completions) = mpsc::unbounded_channel();

        Ok(Self {
            worker,
            history: ObservableHistory::new(),
            completions,
            completion_tx,
            next_request: Cell::new(0),
            in_flight: Cell::new(0),
        })
    }

    /// Open the SQLite database named by `config` and start over it.
    pub fn open(config: &HistoryConfig) -> ServiceResult<Self> {
        let storage = SqliteStorage::open(config.database_path())?;
        info!(path = %config.database_path().display(), "opened gpa history database");
        Self::start(storage, config)
    }

    // ------------------------------------------------------------------------
    // Read access
    // ------------------------------------------------------------------------

    pub fn history(&self) -> &ObservableHistory {
        &self.history
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.history.subscribe()
    }

    /// Requests submitted whose completion hasn't been dispatched yet.
    pub fn pending(&self) -> usize {
        self.in_flight.get()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.worker.state()
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Insert a summary, read it back, and put it at the top of the history.
    pub fn save(&self, gpa: f64, credits: f64) -> Ticket<SummaryRecord> {
        self.save_with(gpa, credits, Callbacks::none())
    }

    pub fn save_with(
        &self,
        gpa: f64,
        credits: f64,
        callbacks: Callbacks<SummaryRecord>,
    ) -> Ticket<SummaryRecord> {
        self.submit(
            "save",
            move |storage| {
                let id = storage.insert_summary(gpa, credits)?;
                storage
                    .fetch_summary(id)?
                    .ok_or(ServiceError::MissingAfterInsert(id))
            },
            |history, record: &SummaryRecord| history.prepend(record.clone()),
            callbacks,
        )
    }

    /// Save a summary and its entries. A failed child insert does not undo the
    /// summary; see [`SavedSummary`].
    pub fn save_with_children(
        &self,
        gpa: f64,
        credits: f64,
        entries: Vec<EntryRecord>,
    ) -> Ticket<SavedSummary> {
        self.save_with_children_with(gpa, credits, entries, Callbacks::none())
    }

    pub fn save_with_children_with(
        &self,
        gpa: f64,
        credits: f64,
        entries: Vec<EntryRecord>,
        callbacks: Callbacks<SavedSummary>,
    ) -> Ticket<SavedSummary> {
        self.submit(
            "save_with_children",
            move |storage| {
                // Children are only attempted once the parent exists
                let id = storage.insert_summary(gpa, credits)?;

                let children_error = match storage.insert_entries(id, &entries) {
                    Ok(()) => None,
                    Err(err) => {
                        warn!(summary_id = id, error = %err, "summary saved without its courses");
                        Some(err)
                    }
                };

                let record = storage
                    .fetch_summary(id)?
                    .ok_or(ServiceError::MissingAfterInsert(id))?;

                let children = if children_error.is_none() {
                    entries
                } else {
                    Vec::new()
                };

                Ok(SavedSummary {
                    record: record.with_children(children),
                    children_error,
                })
            },
            |history, saved: &SavedSummary| history.prepend(saved.record.clone()),
            callbacks,
        )
    }

    /// Replace the whole history with what storage has, newest first.
    pub fn load_all(&self) -> Ticket<Vec<SummaryRecord>> {
        self.load_all_with(Callbacks::none())
    }

    pub fn load_all_with(
        &self,
        callbacks: Callbacks<Vec<SummaryRecord>>,
    ) -> Ticket<Vec<SummaryRecord>> {
        self.submit(
            "load_all",
            |storage| Ok(storage.fetch_all_summaries()?),
            |history, records: &Vec<SummaryRecord>| {
                history.replace_all(records.clone());
                info!(count = records.len(), "history reloaded");
            },
            callbacks,
        )
    }

    /// Fetch a summary's entries and attach them to its history record, if
    /// it is there. The entries are delivered either way.
    pub fn load_children_for(&self, summary_id: i64) -> Ticket<Vec<EntryRecord>> {
        self.load_children_for_with(summary_id, Callbacks::none())
    }

    pub fn load_children_for_with(
        &self,
        summary_id: i64,
        callbacks: Callbacks<Vec<EntryRecord>>,
    ) -> Ticket<Vec<EntryRecord>> {
        self.submit(
            "load_children_for",
            move |storage| Ok(storage.fetch_entries(summary_id)?),
            move |history, entries: &Vec<EntryRecord>| {
                if !history.set_children(summary_id, entries.clone()) {
                    debug!(summary_id, "loaded courses for a summary not in history");
                }
            },
            callbacks,
        )
    }

    /// Delete a summary (its entries go with it). Unknown ids fail with
    /// [`ServiceError::NotFound`]. Succeeds with the deleted id.
    pub fn delete(&self, summary_id: i64) -> Ticket<i64> {
        self.delete_with(summary_id, Callbacks::none())
    }

    pub fn delete_with(&self, summary_id: i64, callbacks: Callbacks<i64>) -> Ticket<i64> {
        self.submit(
            "delete",
            move |storage| {
                if storage.delete_summary(summary_id)? {
                    Ok(summary_id)
                } else {
                    Err(ServiceError::NotFound(summary_id))
                }
            },
            |history, id: &i64| {
                let removed = history.remove_id(*id);
                if removed != 1 {
                    debug!(summary_id = *id, removed, "unexpected number of history records removed");
                }
            },
            callbacks,
        )
    }

    /// Persist a caller-modified summary and swap it into the history.
    pub fn update(&self, summary: SummaryRecord) -> Ticket<SummaryRecord> {
        self.update_with(summary, Callbacks::none())
    }

    pub fn update_with(
        &self,
        summary: SummaryRecord,
        callbacks: Callbacks<SummaryRecord>,
    ) -> Ticket<SummaryRecord> {
        self.submit(
            "update",
            move |storage| {
                let id = summary.id.ok_or(ServiceError::MissingId)?;
                if storage.update_summary(&summary)? {
                    Ok(summary)
                } else {
                    Err(ServiceError::NotFound(id))
                }
            },
            |history, record: &SummaryRecord| {
                if !history.replace(record.clone()) {
                    debug!(summary_id = ?record.id, "updated summary is not in history");
                }
            },
            callbacks,
        )
    }

    /// Number of summaries in storage. Does not touch the history.
    pub fn count(&self) -> Ticket<i64> {
        self.submit(
            "count",
            |storage| Ok(storage.count_summaries()?),
            |_history, _count: &i64| {},
            Callbacks::none(),
        )
    }

    // ------------------------------------------------------------------------
    // Dispatch (consumer context)
    // ------------------------------------------------------------------------

    /// Apply every completion that has already arrived. Never blocks.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions.try_recv() {
            self.apply(completion);
            applied += 1;
        }
        applied
    }

    /// Wait for the next completion and apply it. Returns `false` right away
    /// when nothing is in flight.
    pub async fn next_completion(&mut self) -> bool {
        if self.in_flight.get() == 0 {
            return false;
        }

        match self.completions.recv().await {
            Some(completion) => {
                self.apply(completion);
                true
            }
            None => false,
        }
    }

    /// Dispatch completions until `ticket` resolves, then return its outcome.
    /// Completions of earlier requests are applied along the way.
    pub async fn complete<T>(&mut self, mut ticket: Ticket<T>) -> ServiceResult<T> {
        loop {
            if let Some(outcome) = ticket.try_outcome() {
                return outcome;
            }
            if ticket.taken {
                // Outcome already handed out through `try_outcome`
                return Err(ServiceError::WorkerGone);
            }

            tokio::select! {
                biased;
                Some(completion) = self.completions.recv(), if self.in_flight.get() > 0 => {
                    self.apply(completion);
                }
                outcome = &mut ticket.outcome => {
                    // Only `apply` sends on this channel, so getting here means
                    // the request was lost without a completion
                    ticket.taken = true;
                    return outcome.unwrap_or(Err(ServiceError::WorkerGone));
                }
            }
        }
    }

    /// Blocking [`complete`](Self::complete) for consumers without an async
    /// runtime. Must not be called from inside one.
    pub fn complete_blocking<T>(&mut self, mut ticket: Ticket<T>) -> ServiceResult<T> {
        loop {
            if let Some(outcome) = ticket.try_outcome() {
                return outcome;
            }
            if self.in_flight.get() == 0 {
                return Err(ServiceError::WorkerGone);
            }
            match self.completions.blocking_recv() {
                Some(completion) => self.apply(completion),
                None => return Err(ServiceError::WorkerGone),
            }
        }
    }

    fn apply(&mut self, completion: Completion) {
        self.in_flight.set(self.in_flight.get().saturating_sub(1));
        completion(&mut self.history);
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Stop accepting requests; queued ones still run and can be dispatched.
    /// Non-blocking. Returns `true` only for the call that initiated shutdown.
    pub fn shutdown(&mut self) -> bool {
        self.worker.shutdown()
    }

    /// Shut down and block until the worker has drained its queue.
    pub fn join_worker(&mut self) {
        self.worker.join();
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    fn submit<T, W, A>(
        &self,
        op: &'static str,
        work: W,
        apply: A,
        callbacks: Callbacks<T>,
    ) -> Ticket<T>
    where
        T: Send + 'static,
        W: FnOnce(&mut dyn Storage) -> ServiceResult<T> + Send + 'static,
        A: FnOnce(&mut ObservableHistory, &T) + Send + 'static,
    {
        let request = self.next_request.get() + 1;
        self.next_request.set(request);
        self.in_flight.set(self.in_flight.get() + 1);

        let (reply, outcome) = oneshot::channel();
        let pending = Pending {
            op,
            request,
            finish: Some(Finish {
                apply: Box::new(apply),
                callbacks,
                reply,
            }),
            completions: self.completion_tx.clone(),
        };
        let ticket = Ticket {
            request,
            outcome,
            taken: false,
        };

        if !self.worker.is_accepting() {
            warn!(op, request, "request rejected: persistence service is shut down");
            self.enqueue(Box::new(move |history: &mut ObservableHistory| {
                pending.settle(Err(ServiceError::ShutDown), history)
            }));
            return ticket;
        }

        let completions = self.completion_tx.clone();
        let job: Job = Box::new(move |storage: &mut dyn Storage| {
            debug!(op, request, "running storage job");

            // Storage faults (errors or panics) must not take the worker down
            let result = match panic::catch_unwind(AssertUnwindSafe(move || work(storage))) {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(op, request, panic = %message, "storage job panicked");
                    Err(ServiceError::TaskPanicked(message))
                }
            };

            // Consumer may already be gone; nothing left to report to
            let _ = completions.send(Box::new(move |history: &mut ObservableHistory| {
                pending.settle(result, history)
            }));
        });

        if let Err(job) = self.worker.submit(job) {
            // Worker thread exited underneath us; dropping the job reports WorkerGone
            error!(op, request, "persistence worker is gone");
            drop(job);
        }

        ticket
    }

    fn enqueue(&self, completion: Completion) {
        // Receiver lives in `self`, so this cannot fail
        let _ = self.completion_tx.send(completion);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryChange;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // ------------------------------------------------------------------------
    // Test storage with switchable faults
    // ------------------------------------------------------------------------

    #[derive(Clone, Default)]
    struct Faults {
        fail_insert: Arc<AtomicBool>,
        fail_entries: Arc<AtomicBool>,
        panic_on_fetch_all: Arc<AtomicBool>,
        kill_worker_on_fetch_all: Arc<AtomicBool>,
        lose_inserted_summary: Arc<AtomicBool>,
        fail_delete: Arc<AtomicBool>,
        fail_update: Arc<AtomicBool>,
        fail_fetch_entries: Arc<AtomicBool>,
        entry_batches: Arc<AtomicUsize>,
    }

    /// Panic payload whose destructor panics again, taking the worker thread
    /// down after the storage call has already been caught.
    struct Bomb;

    impl Drop for Bomb {
        fn drop(&mut self) {
            panic!("panic payload exploded while being dropped");
        }
    }

    fn switch_on(flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
    }

    fn is_on(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }

    struct FaultyStorage {
        inner: SqliteStorage,
        faults: Faults,
    }

    impl FaultyStorage {
        fn new(faults: Faults) -> Self {
            Self {
                inner: SqliteStorage::open_in_memory().unwrap(),
                faults,
            }
        }
    }

    impl Storage for FaultyStorage {
        fn insert_summary(&mut self, gpa: f64, credits: f64) -> crate::error::StorageResult<i64> {
            if self.faults.fail_insert.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("insert disabled".into()));
            }
            self.inner.insert_summary(gpa, credits)
        }

        fn fetch_summary(&mut self, id: i64) -> crate::error::StorageResult<Option<SummaryRecord>> {
            if is_on(&self.faults.lose_inserted_summary) {
                return Ok(None);
            }
            self.inner.fetch_summary(id)
        }

        fn fetch_all_summaries(&mut self) -> crate::error::StorageResult<Vec<SummaryRecord>> {
            if is_on(&self.faults.kill_worker_on_fetch_all) {
                std::panic::panic_any(Bomb);
            }
            if is_on(&self.faults.panic_on_fetch_all) {
                panic!("simulated storage crash");
            }
            self.inner.fetch_all_summaries()
        }

        fn delete_summary(&mut self, id: i64) -> crate::error::StorageResult<bool> {
            if is_on(&self.faults.fail_delete) {
                return Err(StorageError::Sqlite("database is locked".into()));
            }
            self.inner.delete_summary(id)
        }

        fn update_summary(&mut self, summary: &SummaryRecord) -> crate::error::StorageResult<bool> {
            if is_on(&self.faults.fail_update) {
                return Err(StorageError::Sqlite("disk I/O error".into()));
            }
            self.inner.update_summary(summary)
        }

        fn insert_entries(
            &mut self,
            summary_id: i64,
            entries: &[EntryRecord],
        ) -> crate::error::StorageResult<()> {
            self.faults.entry_batches.fetch_add(1, Ordering::SeqCst);
            if self.faults.fail_entries.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("entries disabled".into()));
            }
            self.inner.insert_entries(summary_id, entries)
        }

        fn fetch_entries(&mut self, summary_id: i64) -> crate::error::StorageResult<Vec<EntryRecord>> {
            if is_on(&self.faults.fail_fetch_entries) {
                return Err(StorageError::Unavailable("courses table unreadable".into()));
            }
            self.inner.fetch_entries(summary_id)
        }

        fn delete_entries(&mut self, summary_id: i64) -> crate::error::StorageResult<usize> {
            self.inner.delete_entries(summary_id)
        }

        fn count_summaries(&mut self) -> crate::error::StorageResult<i64> {
            self.inner.count_summaries()
        }
    }

    fn memory_service() -> PersistenceService {
        PersistenceService::start(
            SqliteStorage::open_in_memory().unwrap(),
            &HistoryConfig::default().with_worker_name("test-gpa-worker"),
        )
        .unwrap()
    }

    fn faulty_service() -> (PersistenceService, Faults) {
        let faults = Faults::default();
        let service = PersistenceService::start(
            FaultyStorage::new(faults.clone()),
            &HistoryConfig::default(),
        )
        .unwrap();
        (service, faults)
    }

    fn semester() -> Vec<EntryRecord> {
        vec![
            EntryRecord::new("Structured Programming", "CSE1201", 3.0, "A+")
                .with_instructors(Some("Dr. Alam"), Some("Ms. Roy")),
            EntryRecord::new("Physics II", "PHY1203", 3.0, "B"),
            EntryRecord::new("Physics II Lab", "PHY1204", 1.5, "A-")
                .with_instructors(Some("Dr. Alam"), None),
        ]
    }

    fn ids(service: &PersistenceService) -> Vec<i64> {
        service.history().iter().filter_map(|r| r.id).collect()
    }

    /// Records which callback fired, and on which thread.
    #[derive(Clone, Default)]
    struct CallbackLog {
        calls: Arc<Mutex<Vec<(&'static str, std::thread::ThreadId)>>>,
    }

    impl CallbackLog {
        fn callbacks<T: 'static>(&self) -> Callbacks<T> {
            let ok = self.calls.clone();
            let failed = self.calls.clone();
            Callbacks::none()
                .on_success(move |_: &T| ok.lock().unwrap().push(("success", std::thread::current().id())))
                .on_failure(move |_: &ServiceError| {
                    failed.lock().unwrap().push(("failure", std::thread::current().id()))
                })
        }

        fn outcomes(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().iter().map(|(o, _)| *o).collect()
        }

        fn threads(&self) -> HashSet<std::thread::ThreadId> {
            self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }
    }

    // ------------------------------------------------------------------------
    // save / delete
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_save_then_delete() {
        let mut service = memory_service();
        let seen = CallbackLog::default();

        let ticket = service.save_with(3.75, 15.0, seen.callbacks());
        let saved = service.complete(ticket).await.unwrap();

        assert!(saved.id.unwrap() > 0);
        assert_eq!(saved.gpa, 3.75);
        assert_eq!(saved.total_credits, 15.0);
        assert_eq!(service.history().get(0), Some(&saved));
        assert_eq!(seen.outcomes(), vec!["success"]);

        let id = saved.id.unwrap();
        let deleted = service.complete(service.delete(id)).await.unwrap();
        assert_eq!(deleted, id);
        assert!(!service.history().contains(id));
        assert!(service.history().is_empty());
    }

    #[tokio::test]
    async fn test_sequential_saves_are_newest_first() {
        let mut service = memory_service();

        let tickets: Vec<_> = (0..5)
            .map(|i| service.save(2.0 + i as f64 * 0.25, 12.0))
            .collect();

        let mut saved_ids = Vec::new();
        for ticket in tickets {
            saved_ids.push(service.complete(ticket).await.unwrap().id.unwrap());
        }

        assert!(saved_ids.windows(2).all(|w| w[0] < w[1]));

        let mut expected = saved_ids.clone();
        expected.reverse();
        assert_eq!(ids(&service), expected);
    }

    #[tokio::test]
    async fn test_delete_unknown_id_fails_without_touching_history() {
        let mut service = memory_service();
        let seen = CallbackLog::default();

        service.complete(service.save(3.0, 9.0)).await.unwrap();
        let before = service.history().snapshot();

        let err = service
            .complete(service.delete_with(4040, seen.callbacks()))
            .await
            .unwrap_err();

        assert_eq!(err, ServiceError::NotFound(4040));
        assert!(err.is_not_found());
        assert_eq!(service.history().snapshot(), before);
        assert_eq!(seen.outcomes(), vec!["failure"]);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_history_untouched() {
        let (mut service, faults) = faulty_service();
        let seen = CallbackLog::default();
        faults.fail_insert.store(true, Ordering::SeqCst);

        let err = service
            .complete(service.save_with(3.0, 9.0, seen.callbacks()))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Storage(StorageError::Unavailable(_))));
        assert!(service.history().is_empty());
        assert_eq!(seen.outcomes(), vec!["failure"]);
    }

    #[tokio::test]
    async fn test_save_fails_when_read_back_comes_up_empty() {
        let (mut service, faults) = faulty_service();
        let seen = CallbackLog::default();
        switch_on(&faults.lose_inserted_summary);

        let err = service
            .complete(service.save_with(3.0, 9.0, seen.callbacks()))
            .await
            .unwrap_err();

        // Fresh database: the lost row got id 1
        assert_eq!(err, ServiceError::MissingAfterInsert(1));
        assert!(service.history().is_empty());
        assert_eq!(seen.outcomes(), vec!["failure"]);
    }

    #[tokio::test]
    async fn test_delete_storage_error_leaves_history_untouched() {
        let (mut service, faults) = faulty_service();
        let seen = CallbackLog::default();
        let saved = service.complete(service.save(3.0, 9.0)).await.unwrap();
        let before = service.history().snapshot();
        switch_on(&faults.fail_delete);

        let err = service
            .complete(service.delete_with(saved.id.unwrap(), seen.callbacks()))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Storage(StorageError::Sqlite(_))));
        assert!(!err.is_not_found());
        assert_eq!(service.history().snapshot(), before);
        assert_eq!(seen.outcomes(), vec!["failure"]);
    }

    #[tokio::test]
    async fn test_update_storage_error_leaves_history_untouched() {
        let (mut service, faults) = faulty_service();
        let seen = CallbackLog::default();
        let saved = service.complete(service.save(3.0, 9.0)).await.unwrap();
        let before = service.history().snapshot();
        switch_on(&faults.fail_update);

        let mut edited = saved.clone();
        edited.gpa = 3.9;
        let err = service
            .complete(service.update_with(edited, seen.callbacks()))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Storage(StorageError::Sqlite(_))));
        assert_eq!(service.history().snapshot(), before);
        assert_eq!(seen.outcomes(), vec!["failure"]);
    }

    #[tokio::test]
    async fn test_load_children_storage_error_leaves_history_untouched() {
        let (mut service, faults) = faulty_service();
        let seen = CallbackLog::default();
        let saved = service
            .complete(service.save_with_children(3.5, 7.5, semester()))
            .await
            .unwrap();
        let before = service.history().snapshot();
        switch_on(&faults.fail_fetch_entries);

        let err = service
            .complete(service.load_children_for_with(saved.record.id.unwrap(), seen.callbacks()))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Storage(StorageError::Unavailable(_))));
        assert_eq!(service.history().snapshot(), before);
        assert_eq!(seen.outcomes(), vec!["failure"]);
    }

    // ------------------------------------------------------------------------
    // children
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_save_with_children_round_trip() {
        let mut service = memory_service();
        let entries = semester();

        let saved = service
            .complete(service.save_with_children(3.61, 7.5, entries.clone()))
            .await
            .unwrap();

        assert!(saved.is_complete());
        assert_eq!(saved.record.children, entries);
        assert_eq!(service.history().get(0), Some(&saved.record));

        let id = saved.record.id.unwrap();
        let loaded = service
            .complete(service.load_children_for(id))
            .await
            .unwrap();

        assert_eq!(loaded, entries);
        assert_eq!(service.history().find(id).unwrap().children, entries);
    }

    #[tokio::test]
    async fn test_children_failure_keeps_parent() {
        let (mut service, faults) = faulty_service();
        let seen = CallbackLog::default();
        faults.fail_entries.store(true, Ordering::SeqCst);

        let saved = service
            .complete(service.save_with_children_with(3.2, 7.5, semester(), seen.callbacks()))
            .await
            .unwrap();

        assert!(!saved.is_complete());
        assert!(saved.record.children.is_empty());
        assert_eq!(seen.outcomes(), vec!["success"]);

        let id = saved.record.id.unwrap();
        assert!(service.history().contains(id));
        assert_eq!(service.complete(service.count()).await.unwrap(), 1);
        assert!(service
            .complete(service.load_children_for(id))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_parent_failure_skips_children() {
        let (mut service, faults) = faulty_service();
        faults.fail_insert.store(true, Ordering::SeqCst);

        let result = service
            .complete(service.save_with_children(3.2, 7.5, semester()))
            .await;

        assert!(result.is_err());
        assert_eq!(faults.entry_batches.load(Ordering::SeqCst), 0);
        assert!(service.history().is_empty());
    }

    #[tokio::test]
    async fn test_children_for_summary_not_in_history_still_delivered() {
        let mut service = memory_service();
        let saved = service
            .complete(service.save_with_children(3.5, 7.5, semester()))
            .await
            .unwrap();
        let id = saved.record.id.unwrap();

        // Another view dropped it from history; storage still has it
        service.complete(service.load_all()).await.unwrap();
        service.history.remove_id(id);

        let entries = service
            .complete(service.load_children_for(id))
            .await
            .unwrap();
        assert_eq!(entries, semester());
        assert!(!service.history().contains(id));
    }

    // ------------------------------------------------------------------------
    // load_all / update
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_load_all_replaces_history() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("history.db");

        let seeded: Vec<i64> = {
            let mut storage = SqliteStorage::open(&path).unwrap();
            (0..3)
                .map(|i| storage.insert_summary(3.0, 10.0 + i as f64).unwrap())
                .collect()
        };

        let mut service = PersistenceService::open(&HistoryConfig::new(&path)).unwrap();
        assert!(service.history().is_empty());

        let loaded = service.complete(service.load_all()).await.unwrap();
        assert_eq!(loaded.len(), 3);

        let mut expected = seeded.clone();
        expected.reverse();
        assert_eq!(ids(&service), expected);

        // Reloading twice never duplicates
        service.complete(service.load_all()).await.unwrap();
        assert_eq!(ids(&service), expected);
    }

    #[tokio::test]
    async fn test_update_replaces_record() {
        let mut service = memory_service();
        let saved = service.complete(service.save(3.0, 9.0)).await.unwrap();

        let mut edited = saved.clone();
        edited.gpa = 3.4;
        edited.total_credits = 12.0;

        let updated = service.complete(service.update(edited.clone())).await.unwrap();
        assert_eq!(updated, edited);
        assert_eq!(service.history().get(0), Some(&edited));

        // Storage agrees
        let reloaded = service.complete(service.load_all()).await.unwrap();
        assert_eq!(reloaded[0].gpa, 3.4);
        assert_eq!(reloaded[0].total_credits, 12.0);
    }

    #[tokio::test]
    async fn test_update_failures() {
        let mut service = memory_service();
        let saved = service.complete(service.save(3.0, 9.0)).await.unwrap();

        let missing = SummaryRecord::persisted(999, 2.0, 3.0, saved.created_at.clone());
        let err = service.complete(service.update(missing)).await.unwrap_err();
        assert_eq!(err, ServiceError::NotFound(999));

        let transient = SummaryRecord::new(2.0, 3.0);
        let err = service.complete(service.update(transient)).await.unwrap_err();
        assert_eq!(err, ServiceError::MissingId);

        assert_eq!(service.history().snapshot(), vec![saved]);
    }

    // ------------------------------------------------------------------------
    // ordering, faults, threading
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_burst_of_requests_applies_in_submission_order() {
        let mut service = memory_service();

        // Fresh database: first save gets id 1
        let mut first = service.save(3.0, 9.0);
        let mut second = service.save(3.5, 9.0);
        let mut delete = service.delete(1);
        let mut load = service.load_all();
        let third = service.save(3.9, 9.0);

        let third = service.complete(third).await.unwrap();

        // Everything before `third` was dispatched on the way
        assert_eq!(service.pending(), 0);
        assert_eq!(first.try_outcome().unwrap().unwrap().id, Some(1));
        let second = second.try_outcome().unwrap().unwrap();
        assert_eq!(delete.try_outcome().unwrap().unwrap(), 1);
        assert_eq!(load.try_outcome().unwrap().unwrap(), vec![second.clone()]);

        assert_eq!(ids(&service), vec![third.id.unwrap(), second.id.unwrap()]);

        let unique: HashSet<i64> = ids(&service).into_iter().collect();
        assert_eq!(unique.len(), service.history().len());
    }

    #[tokio::test]
    async fn test_worker_survives_storage_panic() {
        let (mut service, faults) = faulty_service();
        let seen = CallbackLog::default();
        faults.panic_on_fetch_all.store(true, Ordering::SeqCst);

        let err = service
            .complete(service.load_all_with(seen.callbacks()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::TaskPanicked(ref m) if m.contains("simulated storage crash")));
        assert_eq!(seen.outcomes(), vec!["failure"]);

        // Same worker keeps serving
        assert_eq!(service.lifecycle(), LifecycleState::Running);
        let saved = service.complete(service.save(2.5, 6.0)).await.unwrap();
        assert!(saved.id.is_some());
    }

    #[tokio::test]
    async fn test_dead_worker_fails_requests_instead_of_hanging() {
        let (mut service, faults) = faulty_service();
        let seen = CallbackLog::default();
        switch_on(&faults.kill_worker_on_fetch_all);

        let fatal = service.load_all_with(seen.callbacks());
        let queued = service.save_with(3.0, 9.0, seen.callbacks());

        let outcome = tokio::time::timeout(Duration::from_secs(10), service.complete(fatal))
            .await
            .expect("complete returned");
        assert_eq!(outcome.unwrap_err(), ServiceError::WorkerGone);

        let outcome = tokio::time::timeout(Duration::from_secs(10), service.complete(queued))
            .await
            .expect("complete returned");
        assert_eq!(outcome.unwrap_err(), ServiceError::WorkerGone);

        assert_eq!(seen.outcomes(), vec!["failure", "failure"]);
        assert_eq!(service.pending(), 0);
        assert!(service.history().is_empty());

        // The queue is closed now, so later requests fail straight away
        let late = service.count();
        let outcome = tokio::time::timeout(Duration::from_secs(10), service.complete(late))
            .await
            .expect("complete returned");
        assert_eq!(outcome.unwrap_err(), ServiceError::WorkerGone);
        assert_eq!(service.pending(), 0);
    }

    #[tokio::test]
    async fn test_callbacks_run_on_consumer_thread_exactly_once() {
        let mut service = memory_service();
        let seen = CallbackLog::default();

        let mut ok = service.save_with(3.0, 9.0, seen.callbacks());
        let mut bad = service.delete_with(12345, seen.callbacks());
        let reload = service.load_all_with(seen.callbacks());

        service.complete(reload).await.unwrap();

        assert_eq!(seen.outcomes(), vec!["success", "failure", "success"]);
        assert_eq!(
            seen.threads(),
            HashSet::from([std::thread::current().id()])
        );

        // Already-dispatched tickets still hand out their outcome, once
        assert!(ok.try_outcome().unwrap().is_ok());
        assert!(ok.try_outcome().is_none());
        assert!(bad.try_outcome().unwrap().is_err());
    }

    #[tokio::test]
    async fn test_subscribers_are_notified() {
        let mut service = memory_service();
        let mut events = service.subscribe();

        let saved = service.complete(service.save(3.0, 9.0)).await.unwrap();
        let id = saved.id.unwrap();
        service.complete(service.delete(id)).await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.change, HistoryChange::Prepended { id: Some(id) });
        let second = events.recv().await.unwrap();
        assert_eq!(second.change, HistoryChange::Removed { id, count: 1 });
        assert_eq!(service.history().revision(), 2);
    }

    // ------------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_shutdown_drains_queue_and_rejects_new_requests() {
        let mut service = memory_service();
        let seen = CallbackLog::default();

        let queued: Vec<_> = (0..3).map(|_| service.save(3.0, 9.0)).collect();

        assert!(service.shutdown());
        assert!(!service.shutdown());
        assert_ne!(service.lifecycle(), LifecycleState::Running);

        let rejected = service.save_with(1.0, 1.0, seen.callbacks());

        for ticket in queued {
            assert!(service.complete(ticket).await.is_ok());
        }
        assert_eq!(service.complete(rejected).await.unwrap_err(), ServiceError::ShutDown);
        assert_eq!(seen.outcomes(), vec!["failure"]);
        assert_eq!(service.history().len(), 3);

        service.join_worker();
        assert_eq!(service.lifecycle(), LifecycleState::Stopped);

        let late = service.load_all();
        assert_eq!(service.complete(late).await.unwrap_err(), ServiceError::ShutDown);
    }

    #[tokio::test]
    async fn test_next_completion_without_work_returns_immediately() {
        let mut service = memory_service();
        assert_eq!(service.pending(), 0);
        assert!(!service.next_completion().await);
        assert_eq!(service.dispatch_pending(), 0);
    }

    #[test]
    fn test_dispatch_pending_from_a_polling_loop() {
        let mut service = memory_service();
        let mut ticket = service.save(3.3, 10.0);

        let mut applied = 0;
        while service.pending() > 0 {
            applied += service.dispatch_pending();
            std::thread::yield_now();
        }

        assert_eq!(applied, 1);
        let saved = ticket.try_outcome().unwrap().unwrap();
        assert_eq!(service.history().get(0), Some(&saved));
    }

    #[test]
    fn test_complete_blocking() {
        let mut service = memory_service();

        let saved = service.complete_blocking(service.save(2.75, 3.0)).unwrap();
        let count = service.complete_blocking(service.count()).unwrap();

        assert_eq!(count, 1);
        assert_eq!(service.history().get(0), Some(&saved));
    }
}
