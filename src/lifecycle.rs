// Worker Lifecycle - start, graceful shutdown, drain
//
// The worker is a single named OS thread that owns the Storage and runs
// queued jobs one at a time in submission order. Closing the job queue is the
// shutdown signal: the worker finishes whatever is already queued, then its
// loop ends and the thread exits.

use crate::error::{ServiceError, ServiceResult};
use crate::storage::Storage;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// A unit of work for the worker. Jobs report their own outcome.
pub(crate) type Job = Box<dyn FnOnce(&mut dyn Storage) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Accepting submissions.
    Running,
    /// Shutdown initiated; already-queued jobs are still running.
    Draining,
    /// Worker thread has exited.
    Stopped,
}

pub(crate) struct Worker {
    name: String,
    jobs: Option<mpsc::UnboundedSender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<S>(storage: S, name: &str) -> ServiceResult<Self>
    where
        S: Storage + 'static,
    {
        let (jobs, queue) = mpsc::unbounded_channel::<Job>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(storage, queue))
            .map_err(|e| ServiceError::WorkerSpawn(e.to_string()))?;

        info!(worker = name, "persistence worker started");

        Ok(Self {
            name: name.to_string(),
            jobs: Some(jobs),
            handle: Some(handle),
        })
    }

    /// Queue a job. Hands the job back if the worker no longer accepts work.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        match &self.jobs {
            Some(jobs) => jobs.send(job).map_err(|rejected| rejected.0),
            None => Err(job),
        }
    }

    /// Stop accepting jobs. Does not wait for the queue to drain.
    /// Returns `true` only on the call that actually initiated shutdown.
    pub(crate) fn shutdown(&mut self) -> bool {
        match self.jobs.take() {
            Some(_) => {
                info!(worker = %self.name, "persistence worker shutting down, draining queue");
                true
            }
            None => false,
        }
    }

    /// False once shutdown has been initiated. A worker that died on its own
    /// still "accepts" here; its submissions fail in [`Worker::submit`].
    pub(crate) fn is_accepting(&self) -> bool {
        self.jobs.is_some()
    }

    pub(crate) fn state(&self) -> LifecycleState {
        let finished = self.handle.as_ref().map_or(true, |h| h.is_finished());

        match (&self.jobs, finished) {
            (_, true) => LifecycleState::Stopped,
            (Some(_), false) => LifecycleState::Running,
            (None, false) => LifecycleState::Draining,
        }
    }

    /// Initiate shutdown (if needed) and block until the worker has drained.
    pub(crate) fn join(&mut self) {
        self.shutdown();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.name, "persistence worker thread panicked");
            }
        }
    }
}

fn run_worker<S: Storage>(mut storage: S, mut queue: mpsc::UnboundedReceiver<Job>) {
    let mut processed: u64 = 0;

    // `None` once every sender is gone and the queue is empty
    while let Some(job) = queue.blocking_recv() {
        job(&mut storage as &mut dyn Storage);
        processed += 1;
    }

    debug!(processed, "persistence worker queue closed");
    info!("persistence worker stopped");
}
