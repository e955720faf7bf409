//! Book-keeping for outbound calls that are waiting on a response.
//!
//! Every non-oneway request that goes out is recorded here under its correlation id until exactly
//! one of these things happens to it:
//!
//! - a response with the same correlation id arrives ([`PendingCallRegistry::resolve`])
//! - its deadline passes and the periodic sweep finds it ([`PendingCallRegistry::expire`])
//! - the request could not be written ([`PendingCallRegistry::fail`])
//! - the connection it went out on is closed ([`PendingCallRegistry::fail_all`])
//!
//! Each of those paths claims the entry by removing it from the map, and only the path that
//! actually removed it gets to deliver an outcome.  Anything else that shows up for the same id
//! afterwards is a no-op.
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::admission::AdmissionPermit;
use crate::command::Command;
use crate::executor::WorkerPool;
use crate::{ConnectionId, RemotingError, Result};

/// Receives the outcome of an asynchronous call.
///
/// Implemented for any `FnOnce(Result<Command>)` closure, which is usually all that's needed.
/// Callbacks need only be `Send`; the registry never shares one between threads.
pub trait InvokeCallback: Send + 'static {
    fn on_complete(self: Box<Self>, result: Result<Command>);
}

impl<F> InvokeCallback for F
where
    F: FnOnce(Result<Command>) + Send + 'static,
{
    fn on_complete(self: Box<Self>, result: Result<Command>) {
        (*self)(result)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CallMode {
    Sync,
    Async,
}

/// Where a call ended up.  `Waiting` is only ever observed while the call is in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CallState {
    Waiting,
    Completed,
    TimedOut,
    Failed,
}

enum Completion {
    Sync(oneshot::Sender<Result<Command>>),
    Async {
        // Only ever taken out once, by whichever path removed the call; the mutex is there so
        // the registry is `Sync` without demanding `Sync` callbacks
        callback: Mutex<Box<dyn InvokeCallback>>,
        permit: AdmissionPermit,
    },
}

/// An outbound call waiting for its response.
pub struct PendingCall {
    correlation_id: i32,
    connection_id: ConnectionId,
    timeout: Duration,
    started_at: Instant,
    deadline: Instant,
    completion: Completion,
}

impl PendingCall {
    /// A call whose caller is suspended waiting on the returned receiver.
    pub fn sync(
        correlation_id: i32,
        connection_id: ConnectionId,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<Result<Command>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::new(correlation_id, connection_id, timeout, Completion::Sync(tx)),
            rx,
        )
    }

    /// A call whose outcome goes to `callback`.  The admission permit is held until the outcome
    /// is known, and released just before the callback runs.
    pub fn with_callback(
        correlation_id: i32,
        connection_id: ConnectionId,
        timeout: Duration,
        permit: AdmissionPermit,
        callback: impl InvokeCallback,
    ) -> Self {
        Self::new(
            correlation_id,
            connection_id,
            timeout,
            Completion::Async {
                callback: Mutex::new(Box::new(callback)),
                permit,
            },
        )
    }

    fn new(correlation_id: i32, connection_id: ConnectionId, timeout: Duration, completion: Completion) -> Self {
        let started_at = Instant::now();
        Self {
            correlation_id,
            connection_id,
            timeout,
            started_at,
            deadline: started_at + timeout,
            completion,
        }
    }

    pub fn correlation_id(&self) -> i32 {
        self.correlation_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn mode(&self) -> CallMode {
        match self.completion {
            Completion::Sync(_) => CallMode::Sync,
            Completion::Async { .. } => CallMode::Async,
        }
    }

    fn summarize(&self, state: CallState) -> CallSummary {
        CallSummary {
            correlation_id: self.correlation_id,
            connection_id: self.connection_id,
            mode: self.mode(),
            state,
            elapsed: self.started_at.elapsed(),
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("correlation_id", &self.correlation_id)
            .field("connection_id", &self.connection_id)
            .field("mode", &self.mode())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Returned by [`PendingCallRegistry::register`]; identifies the registered call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallToken {
    pub correlation_id: i32,
    pub deadline: Instant,
}

/// What happened to a call that left the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSummary {
    pub correlation_id: i32,
    pub connection_id: ConnectionId,
    pub mode: CallMode,
    pub state: CallState,
    pub elapsed: Duration,
}

/// Concurrent map from correlation id to [`PendingCall`].
pub struct PendingCallRegistry {
    calls: DashMap<i32, PendingCall>,
    callbacks: WorkerPool,
}

impl PendingCallRegistry {
    /// Async-call callbacks are run on `callbacks`, never on the task that completed the call.
    pub fn new(callbacks: WorkerPool) -> Self {
        Self {
            calls: DashMap::new(),
            callbacks,
        }
    }

    pub fn callback_executor(&self) -> &WorkerPool {
        &self.callbacks
    }

    pub fn register(&self, call: PendingCall) -> Result<CallToken> {
        match self.calls.entry(call.correlation_id) {
            Entry::Occupied(_) => {
                tracing::warn!(
                    correlation_id = call.correlation_id,
                    connection_id = %call.connection_id,
                    "Refusing to register a call whose correlation id is already outstanding"
                );
                Err(RemotingError::DuplicateCorrelationId {
                    correlation_id: call.correlation_id,
                })
            }
            Entry::Vacant(vacant) => {
                let token = CallToken {
                    correlation_id: call.correlation_id,
                    deadline: call.deadline,
                };
                tracing::trace!(
                    correlation_id = call.correlation_id,
                    connection_id = %call.connection_id,
                    mode = %call.mode(),
                    "Pending call registered"
                );
                vacant.insert(call);
                Ok(token)
            }
        }
    }

    /// Deliver `response` to the call waiting on `correlation_id`.
    ///
    /// Returns `false` if no such call is waiting, which happens when the response arrives after
    /// the call already timed out or failed, or when the peer answers something we never asked.
    pub fn resolve(&self, correlation_id: i32, response: Command) -> bool {
        match self.calls.remove(&correlation_id) {
            Some((_, call)) => {
                let summary = call.summarize(CallState::Completed);
                tracing::trace!(
                    correlation_id,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "Response matched a pending call"
                );
                self.complete(call, Ok(response));
                true
            }
            None => {
                tracing::warn!(
                    correlation_id,
                    code = response.code,
                    "Dropping response that matches no pending call; it may have already timed out"
                );
                false
            }
        }
    }

    /// Time out every call whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> Vec<CallSummary> {
        let expired_ids: Vec<i32> = self
            .calls
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut summaries = Vec::with_capacity(expired_ids.len());
        for correlation_id in expired_ids {
            // The deadline is checked again under the shard lock, and a response that raced us
            // here has already taken the entry
            if let Some((_, call)) = self.calls.remove_if(&correlation_id, |_, call| call.deadline <= now) {
                let summary = call.summarize(CallState::TimedOut);
                tracing::debug!(
                    correlation_id,
                    connection_id = %call.connection_id,
                    mode = %summary.mode,
                    timeout_ms = call.timeout.as_millis() as u64,
                    "Pending call timed out"
                );
                let err = RemotingError::Timeout {
                    correlation_id,
                    timeout: call.timeout,
                };
                self.complete(call, Err(err));
                summaries.push(summary);
            }
        }

        summaries
    }

    /// Fail one call because its request could not be sent.
    ///
    /// Returns `false` if the call had already left the registry some other way.
    pub fn fail(&self, correlation_id: i32, reason: impl Into<String>) -> bool {
        match self.calls.remove(&correlation_id) {
            Some((_, call)) => {
                let reason = reason.into();
                tracing::debug!(
                    correlation_id,
                    connection_id = %call.connection_id,
                    %reason,
                    "Pending call failed"
                );
                let err = RemotingError::send_failure(call.connection_id, correlation_id, reason);
                self.complete(call, Err(err));
                true
            }
            None => false,
        }
    }

    /// Fail every call waiting on a response from `connection_id`.
    pub fn fail_all(&self, connection_id: ConnectionId, reason: &str) -> Vec<CallSummary> {
        let ids: Vec<i32> = self
            .calls
            .iter()
            .filter(|entry| entry.connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect();

        let mut summaries = Vec::with_capacity(ids.len());
        for correlation_id in ids {
            if let Some((_, call)) = self.calls.remove(&correlation_id) {
                summaries.push(call.summarize(CallState::Failed));
                let err = RemotingError::send_failure(connection_id, correlation_id, reason);
                self.complete(call, Err(err));
            }
        }

        if !summaries.is_empty() {
            tracing::debug!(
                %connection_id,
                failed_calls = summaries.len(),
                reason,
                "Failed all pending calls on connection"
            );
        }

        summaries
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn contains(&self, correlation_id: i32) -> bool {
        self.calls.contains_key(&correlation_id)
    }

    /// Hand the outcome to whoever is waiting for it.  Only ever called with a call that has
    /// already been removed from the map.
    fn complete(&self, call: PendingCall, result: Result<Command>) {
        let correlation_id = call.correlation_id;
        match call.completion {
            Completion::Sync(tx) => {
                if tx.send(result).is_err() {
                    tracing::debug!(correlation_id, "Caller stopped waiting before the call completed");
                }
            }
            Completion::Async { callback, permit } => {
                let callback = callback.into_inner().unwrap_or_else(|e| e.into_inner());
                permit.release();
                self.callbacks.submit_or_detach(async move {
                    callback.on_complete(result);
                });
            }
        }
    }
}

impl std::fmt::Debug for PendingCallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCallRegistry")
            .field("pending", &self.calls.len())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
