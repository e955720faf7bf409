//! A fixed set of worker tasks draining a bounded job queue.
//!
//! Processors and async-call callbacks never run on a connection's event loop task.  They are
//! handed to a [`WorkerPool`] instead, and the hand-off never waits: when the queue is full the
//! job is rejected on the spot and the caller decides what to do about it (for processors, that
//! means answering "system busy").
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Why a job was not accepted by [`WorkerPool::submit`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejected {
    #[error("Worker pool '{pool}' queue is full ({capacity} jobs waiting)")]
    QueueFull { pool: String, capacity: usize },

    #[error("Worker pool '{pool}' is shut down")]
    ShutDown { pool: String },
}

/// Cheaply clonable handle to a pool of worker tasks.
///
/// All clones share the same queue and workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    workers: usize,
    queue_capacity: usize,
    sender: mpsc::Sender<Job>,
    cancellation_token: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("workers", &self.inner.workers)
            .field("queue_capacity", &self.inner.queue_capacity)
            .finish()
    }
}

impl WorkerPool {
    /// Start `workers` worker tasks sharing a queue that holds at most `queue_capacity` jobs.
    ///
    /// Must be called from within a Tokio runtime.  Zero values are bumped to one.
    pub fn new(name: impl Into<String>, workers: usize, queue_capacity: usize) -> Self {
        let name = name.into();
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);

        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let cancellation_token = CancellationToken::new();

        let mut tasks = JoinSet::new();
        for index in 0..workers {
            let span = tracing::debug_span!("worker", pool = %name, index);
            tasks.spawn(
                Self::worker_loop(name.clone(), receiver.clone(), cancellation_token.clone()).instrument(span),
            );
        }

        tracing::debug!(pool = %name, workers, queue_capacity, "Worker pool started");

        Self {
            inner: Arc::new(Inner {
                name,
                workers,
                queue_capacity,
                sender,
                cancellation_token,
                tasks: Mutex::new(tasks),
            }),
        }
    }

    async fn worker_loop(
        name: String,
        receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
        cancellation_token: CancellationToken,
    ) {
        loop {
            let job = {
                let mut receiver = receiver.lock().await;
                tokio::select! {
                    biased;
                    job = receiver.recv() => job,
                    // Once shutdown starts, keep draining whatever is already queued and exit
                    // when the queue is empty
                    _ = cancellation_token.cancelled() => receiver.try_recv().ok(),
                }
            };

            let Some(job) = job else {
                break;
            };

            if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
                tracing::error!(
                    pool = %name,
                    panic = %error::panic_err_to_string(panic),
                    "Job panicked; worker keeps running"
                );
            }
        }

        tracing::trace!(pool = %name, "Worker exiting");
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.inner.queue_capacity
    }

    /// Number of jobs accepted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.inner.queue_capacity - self.inner.sender.capacity()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancellation_token.is_cancelled()
    }

    /// Queue `job` for execution on one of the workers.
    ///
    /// Never waits.  Fails immediately if the queue is full or the pool is shutting down.
    pub fn submit(&self, job: impl Future<Output = ()> + Send + 'static) -> Result<(), Rejected> {
        if self.is_shut_down() {
            return Err(Rejected::ShutDown {
                pool: self.inner.name.clone(),
            });
        }

        let span = tracing::Span::current();
        match self.inner.sender.try_send(Box::pin(job.instrument(span))) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Rejected::QueueFull {
                pool: self.inner.name.clone(),
                capacity: self.inner.queue_capacity,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Rejected::ShutDown {
                pool: self.inner.name.clone(),
            }),
        }
    }

    /// Like [`Self::submit`], but a job the pool can't take is run on its own Tokio task instead
    /// of being dropped.  For work that must happen exactly once no matter how loaded the pool is.
    pub(crate) fn submit_or_detach(&self, job: impl Future<Output = ()> + Send + 'static) {
        let span = tracing::Span::current();
        let job: Job = Box::pin(job.instrument(span));

        let rejected = if self.is_shut_down() {
            Some(job)
        } else {
            match self.inner.sender.try_send(job) {
                Ok(()) => None,
                Err(mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job)) => Some(job),
            }
        };

        if let Some(job) = rejected {
            tracing::warn!(
                pool = %self.inner.name,
                shut_down = self.is_shut_down(),
                "Worker pool can't take the job; running it on a detached task"
            );
            let name = self.inner.name.clone();
            tokio::spawn(async move {
                if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
                    tracing::error!(
                        pool = %name,
                        panic = %error::panic_err_to_string(panic),
                        "Detached job panicked"
                    );
                }
            });
        }
    }

    /// Stop accepting jobs, let the workers finish what is queued, and wait up to `grace` for
    /// them.  Workers still running after that are aborted.
    ///
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.cancellation_token.cancel();

        let mut tasks = self.inner.tasks.lock().await;
        if tasks.is_empty() {
            return;
        }

        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                pool = %self.inner.name,
                remaining_workers = tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "Workers did not finish within the grace period; aborting them"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        } else {
            tracing::debug!(pool = %self.inner.name, "Worker pool shut down");
        }
    }
}
