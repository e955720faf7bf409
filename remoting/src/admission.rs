//! Admission control for outbound calls that do not block their caller.
//!
//! Async and oneway calls return to the caller as soon as the request is queued, so without a
//! bound a caller could pile up an unlimited number of them against a slow peer.  Each kind gets
//! its own counting pool of permits; a call must hold a permit for as long as it is in flight.
//! Synchronous calls are bounded by the number of callers blocked on them and take no permit.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The two independent admission pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Pool {
    Oneway,
    Async,
}

/// Two semaphores, one per [`Pool`].
#[derive(Clone, Debug)]
pub struct AdmissionController {
    oneway: Arc<Semaphore>,
    oneway_capacity: usize,
    async_: Arc<Semaphore>,
    async_capacity: usize,
}

impl AdmissionController {
    pub fn new(oneway_permits: usize, async_permits: usize) -> Self {
        Self {
            oneway: Arc::new(Semaphore::new(oneway_permits)),
            oneway_capacity: oneway_permits,
            async_: Arc::new(Semaphore::new(async_permits)),
            async_capacity: async_permits,
        }
    }

    fn semaphore(&self, pool: Pool) -> &Arc<Semaphore> {
        match pool {
            Pool::Oneway => &self.oneway,
            Pool::Async => &self.async_,
        }
    }

    /// Try to take a permit from `pool`, waiting at most `wait` for one to free up.
    ///
    /// A zero `wait` never suspends.  Returns `None` if no permit became available in time.
    pub async fn try_acquire(&self, pool: Pool, wait: Duration) -> Option<AdmissionPermit> {
        let semaphore = self.semaphore(pool).clone();

        let permit = if wait.is_zero() {
            semaphore.try_acquire_owned().ok()
        } else {
            match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => tokio::time::timeout(wait, semaphore.acquire_owned())
                    .await
                    .ok()
                    .and_then(Result::ok),
            }
        };

        match permit {
            Some(permit) => {
                tracing::trace!(%pool, available = self.available(pool), "Admission permit acquired");
                Some(AdmissionPermit { pool, _permit: permit })
            }
            None => {
                tracing::warn!(
                    %pool,
                    capacity = self.capacity(pool),
                    wait_ms = wait.as_millis() as u64,
                    "Admission pool exhausted"
                );
                None
            }
        }
    }

    /// Permits currently free in `pool`.
    pub fn available(&self, pool: Pool) -> usize {
        self.semaphore(pool).available_permits()
    }

    /// Configured size of `pool`.
    pub fn capacity(&self, pool: Pool) -> usize {
        match pool {
            Pool::Oneway => self.oneway_capacity,
            Pool::Async => self.async_capacity,
        }
    }
}

/// A permit drawn from one of the admission pools.
///
/// The permit goes back to its pool when this is dropped, so whoever owns it is responsible for
/// the one and only release.
#[derive(Debug)]
pub struct AdmissionPermit {
    pool: Pool,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    pub fn pool(&self) -> Pool {
        self.pool
    }

    /// Return the permit to its pool now.
    pub fn release(self) {
        tracing::trace!(pool = %self.pool, "Admission permit released");
        drop(self);
    }
}
