//! The [`InvocationEngine`] ties everything together: it serves connections, routes the requests
//! that arrive on them to processors, and makes sync, async and oneway calls to the peers on the
//! other end.
//!
//! All state lives in the engine; there is nothing process-global besides the counter
//! [`Command::request`] draws correlation ids from.  Cloning an engine is cheap and every clone
//! refers to the same state.
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use pin_project::pin_project;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

use crate::admission::{AdmissionController, AdmissionPermit, Pool};
use crate::command::Command;
use crate::config::RemotingConfig;
use crate::connection;
use crate::dispatch::{ProcessorEntry, ProcessorTable};
use crate::executor::WorkerPool;
use crate::handle::{ConnectionHandle, ConnectionId, Enqueued, OutboundCommand};
use crate::hook::{Hooks, RpcHook};
use crate::lifecycle::{ConnectionEventListener, LifecycleNotifier};
use crate::processor::RequestProcessor;
use crate::registry::{InvokeCallback, PendingCall, PendingCallRegistry};
use crate::transport::{Peer, Transport};
use crate::{RemotingError, Result};

/// State shared by the engine and every connection it serves.
pub(crate) struct EngineShared {
    pub(crate) config: RemotingConfig,
    pub(crate) registry: PendingCallRegistry,
    pub(crate) admission: AdmissionController,
    pub(crate) processors: ProcessorTable,
    pub(crate) hooks: Hooks,
    pub(crate) notifier: LifecycleNotifier,
    pub(crate) public_executor: WorkerPool,
    pub(crate) connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Parent of every connection's token, and stops the timeout sweep
    pub(crate) cancellation_token: CancellationToken,
    /// Stops lifecycle event delivery; cancelled last during shutdown
    notifier_token: CancellationToken,
    started: AtomicBool,
}

#[derive(Clone)]
pub struct InvocationEngine {
    shared: Arc<EngineShared>,
}

impl InvocationEngine {
    pub fn builder() -> InvocationEngineBuilder {
        InvocationEngineBuilder::default()
    }

    /// An engine with its own executors, configured by `config`.  Must be called from within a
    /// Tokio runtime.
    pub fn new(config: RemotingConfig) -> Self {
        Self::builder().with_config(config).build()
    }

    pub fn config(&self) -> &RemotingConfig {
        &self.shared.config
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.shared.admission
    }

    pub fn registry(&self) -> &PendingCallRegistry {
        &self.shared.registry
    }

    pub fn processors(&self) -> &ProcessorTable {
        &self.shared.processors
    }

    /// The executor shared by processors registered without one of their own.
    pub fn public_executor(&self) -> &WorkerPool {
        &self.shared.public_executor
    }

    /// The executor async-call callbacks run on.
    pub fn callback_executor(&self) -> &WorkerPool {
        self.shared.registry.callback_executor()
    }

    /// Route requests with `code` to `processor`, running on `executor` or, if `None`, on the
    /// public executor.  Replaces any processor already registered for `code`.
    pub fn register_processor(&self, code: i32, processor: impl RequestProcessor, executor: Option<WorkerPool>) {
        let entry = ProcessorEntry {
            processor: Arc::new(processor),
            executor: executor.unwrap_or_else(|| self.shared.public_executor.clone()),
        };
        self.shared.processors.register(code, entry);
    }

    /// Route requests for every code without a processor of its own to `processor`.
    pub fn register_default_processor(&self, processor: impl RequestProcessor, executor: Option<WorkerPool>) {
        let entry = ProcessorEntry {
            processor: Arc::new(processor),
            executor: executor.unwrap_or_else(|| self.shared.public_executor.clone()),
        };
        self.shared.processors.register_default(entry);
    }

    /// The processor and executor registered for exactly `code`, not counting the default.
    pub fn processor_entry(&self, code: i32) -> Option<ProcessorEntry> {
        self.shared.processors.get(code)
    }

    /// Deliver connection lifecycle events to `listener`, replacing any earlier listener.
    pub fn listen(&self, listener: impl ConnectionEventListener) {
        self.shared.notifier.listen(Arc::new(listener));
    }

    pub fn register_hook(&self, hook: impl RpcHook) {
        self.shared.hooks.register(Arc::new(hook));
    }

    /// Start servicing a connection on its own task.
    ///
    /// Also starts the engine, if that hasn't happened yet.
    pub fn serve_connection(&self, transport: impl Transport) -> Result<ConnectionHandle> {
        self.start();
        connection::service_connection(self.shared.clone(), Peer::new(transport))
    }

    /// Handles to every connection currently being served.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.shared
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Start the periodic sweep that times out calls past their deadline.
    ///
    /// Idempotent.  Called automatically by [`Self::serve_connection`].
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let interval = self.shared.config.timeout_scan_interval;
        let cancellation_token = self.shared.cancellation_token.clone();
        let shared = Arc::downgrade(&self.shared);

        tracing::debug!(scan_interval = ?interval, "Starting pending call timeout sweep");
        tokio::spawn(Self::sweep_timeouts(shared, interval, cancellation_token));
    }

    async fn sweep_timeouts(shared: Weak<EngineShared>, interval: Duration, cancellation_token: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancellation_token.cancelled() => break,
            }

            let Some(shared) = shared.upgrade() else {
                break;
            };
            let expired = shared.registry.expire(Instant::now());
            if !expired.is_empty() {
                tracing::debug!(expired = expired.len(), "Timed out pending calls");
            }
        }

        tracing::debug!("Pending call timeout sweep stopped");
    }

    /// Send `request` and wait for its response.
    ///
    /// Fails with [`RemotingError::Timeout`] if no response arrives within `timeout` (give or
    /// take the sweep interval), or with [`RemotingError::SendFailure`] if the request can't be
    /// written or the connection closes first.  An error response from the peer is returned
    /// as-is; see [`Command::into_result`].
    ///
    /// Only the pending-call registry decides the outcome, so a write stuck behind a peer that
    /// has stopped reading can't hold the caller past its timeout.
    #[instrument(skip_all, fields(correlation_id = request.correlation_id, code = request.code, connection_id = %connection.id()))]
    pub async fn call_sync(&self, connection: &ConnectionHandle, request: Command, timeout: Duration) -> Result<Command> {
        if request.is_response() {
            return Err(RemotingError::Bug {
                message: format!("command {} is a response, not a request", request.correlation_id),
            });
        }

        let correlation_id = request.correlation_id;
        let (call, response_rx) = PendingCall::sync(correlation_id, connection.id(), timeout);
        let deadline = call.deadline();
        self.shared.registry.register(call)?;

        let hooks = &self.shared.hooks;
        let request_for_hooks = (!hooks.is_empty()).then(|| request.clone());
        if let Some(request) = &request_for_hooks {
            hooks.before_request(connection.remote_peer(), request);
        }

        if let Err(e) = self.hand_off(connection, OutboundCommand::new(request), deadline) {
            tracing::debug!(err = %e, "Failed to queue synchronous request");
            self.shared.registry.fail(correlation_id, failure_reason(&e));
        }

        let result = ResponseFuture { response_rx }.await;

        if let Some(request) = &request_for_hooks {
            hooks.after_response(connection.remote_peer(), request, result.as_ref().ok());
        }

        result
    }

    /// Send `request` without waiting for it to be written; `callback` gets the outcome later.
    ///
    /// The only wait is for an async permit.  Fails right away with
    /// [`RemotingError::TooManyRequests`] if none frees up within the configured admission wait,
    /// in which case `callback` is never called.  Once this returns `Ok`, `callback` is called
    /// exactly once, on the callback executor, with the response or with whatever went wrong,
    /// including a failure to write the request.
    #[instrument(skip_all, fields(correlation_id = request.correlation_id, code = request.code, connection_id = %connection.id()))]
    pub async fn call_async(
        &self,
        connection: &ConnectionHandle,
        request: Command,
        timeout: Duration,
        callback: impl InvokeCallback,
    ) -> Result<()> {
        if request.is_response() {
            return Err(RemotingError::Bug {
                message: format!("command {} is a response, not a request", request.correlation_id),
            });
        }

        let permit = self.acquire(Pool::Async).await?;

        let correlation_id = request.correlation_id;
        let call = PendingCall::with_callback(correlation_id, connection.id(), timeout, permit, callback);
        let deadline = call.deadline();
        self.shared.registry.register(call)?;

        if let Err(e) = self.hand_off(connection, OutboundCommand::new(request), deadline) {
            tracing::debug!(err = %e, "Failed to queue asynchronous request");
            self.shared.registry.fail(correlation_id, failure_reason(&e));
        }

        Ok(())
    }

    /// Send `request` without expecting a response.
    ///
    /// The request is marked oneway before it's sent.  Returns as soon as it's queued on the
    /// connection; the only wait is for a oneway permit.  Fails with
    /// [`RemotingError::SendFailure`] if the connection is already closed.  The permit stays
    /// taken until the request has been written, or until `timeout` has passed without it even
    /// getting into the connection's queue, in which case it's dropped.
    #[instrument(skip_all, fields(correlation_id = request.correlation_id, code = request.code, connection_id = %connection.id()))]
    pub async fn call_oneway(&self, connection: &ConnectionHandle, request: Command, timeout: Duration) -> Result<()> {
        let permit = self.acquire(Pool::Oneway).await?;

        let outbound = OutboundCommand::new(request.into_oneway()).with_permit(permit);
        self.hand_off(connection, outbound, Instant::now() + timeout)
    }

    async fn acquire(&self, pool: Pool) -> Result<AdmissionPermit> {
        let wait = self.shared.config.admission_wait;
        self.shared
            .admission
            .try_acquire(pool, wait)
            .await
            .ok_or(RemotingError::TooManyRequests { pool, waited: wait })
    }

    /// Queue `outbound` on `connection` without waiting.
    ///
    /// If the queue is full, a background task keeps trying until `deadline`.  Should that fail,
    /// a request awaiting a response is failed in the registry; anything else is dropped.
    fn hand_off(&self, connection: &ConnectionHandle, outbound: OutboundCommand, deadline: Instant) -> Result<()> {
        let outbound = match connection.try_enqueue(outbound)? {
            Enqueued::Queued => return Ok(()),
            Enqueued::Full(outbound) => outbound,
        };

        let (kind, correlation_id, _) = outbound.command.diagnostic_context();
        let awaits_response = !outbound.command.is_response() && !outbound.command.is_oneway();
        tracing::debug!(kind, "Outbound queue is full; waiting for room in the background");

        let connection = connection.clone();
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(
            async move {
                let failure = match tokio::time::timeout_at(deadline, connection.enqueue(outbound)).await {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => failure_reason(&e),
                    Err(_) => "timed out waiting for room in the outbound queue".to_string(),
                };

                tracing::debug!(kind, reason = %failure, "Gave up queueing command");
                if awaits_response {
                    if let Some(shared) = shared.upgrade() {
                        shared.registry.fail(correlation_id, failure);
                    }
                }
            }
            .in_current_span(),
        );

        Ok(())
    }

    /// Close every connection, then stop the executors and event delivery.
    ///
    /// Each stage waits at most the configured graceful shutdown timeout.  Calls still waiting
    /// on a response fail with [`RemotingError::SendFailure`], and their callbacks run before the
    /// callback executor stops.
    pub async fn shutdown(&self) {
        let grace = self.shared.config.graceful_shutdown_timeout;
        tracing::info!(
            connections = self.shared.connections.len(),
            pending_calls = self.shared.registry.len(),
            "Shutting down invocation engine"
        );

        self.shared.cancellation_token.cancel();

        let connections = self.connections();
        let all_closed = futures::future::join_all(connections.iter().map(|connection| connection.closed()));
        if tokio::time::timeout(grace, all_closed).await.is_err() {
            tracing::warn!(
                remaining = self.shared.connections.len(),
                "Connections did not close within the grace period"
            );
        }

        self.shared.public_executor.shutdown(grace).await;
        self.callback_executor().shutdown(grace).await;
        self.shared.notifier_token.cancel();

        tracing::debug!("Invocation engine shut down");
    }
}

impl std::fmt::Debug for InvocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationEngine")
            .field("connections", &self.shared.connections.len())
            .field("registry", &self.shared.registry)
            .field("processors", &self.shared.processors)
            .finish()
    }
}

/// The text to record as the reason a call failed, without repeating the connection and
/// correlation id that the resulting [`RemotingError::SendFailure`] already carries.
fn failure_reason(e: &RemotingError) -> String {
    match e {
        RemotingError::SendFailure { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

/// Waits for the registry to deliver the outcome of a synchronous call.
#[pin_project]
struct ResponseFuture {
    #[pin]
    response_rx: oneshot::Receiver<Result<Command>>,
}

impl Future for ResponseFuture {
    type Output = Result<Command>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.response_rx.poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The registry only drops the sender without sending when the engine itself is gone
            Poll::Ready(Err(_)) => Poll::Ready(Err(RemotingError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Builder for [`InvocationEngine`].
#[derive(Default)]
pub struct InvocationEngineBuilder {
    config: RemotingConfig,
    public_executor: Option<WorkerPool>,
    callback_executor: Option<WorkerPool>,
    listener: Option<Arc<dyn ConnectionEventListener>>,
    hooks: Vec<Arc<dyn RpcHook>>,
}

impl InvocationEngineBuilder {
    pub fn with_config(mut self, config: RemotingConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `executor` instead of building a public executor from the config.
    pub fn with_public_executor(mut self, executor: WorkerPool) -> Self {
        self.public_executor = Some(executor);
        self
    }

    /// Use `executor` instead of building a callback executor from the config.
    pub fn with_callback_executor(mut self, executor: WorkerPool) -> Self {
        self.callback_executor = Some(executor);
        self
    }

    pub fn with_listener(mut self, listener: impl ConnectionEventListener) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn with_hook(mut self, hook: impl RpcHook) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Build the engine.  Must be called from within a Tokio runtime, since it starts the
    /// executors and the event delivery task.
    pub fn build(self) -> InvocationEngine {
        let config = self.config;

        let public_executor = self.public_executor.unwrap_or_else(|| {
            WorkerPool::new("public", config.public_executor_workers, config.public_executor_queue)
        });
        let callback_executor = self.callback_executor.unwrap_or_else(|| {
            WorkerPool::new(
                "callback",
                config.callback_executor_workers,
                config.callback_executor_queue,
            )
        });

        let notifier_token = CancellationToken::new();
        let notifier = LifecycleNotifier::start(config.event_queue_capacity, notifier_token.clone());
        if let Some(listener) = self.listener {
            notifier.listen(listener);
        }

        let hooks = Hooks::default();
        for hook in self.hooks {
            hooks.register(hook);
        }

        let shared = EngineShared {
            registry: PendingCallRegistry::new(callback_executor),
            admission: AdmissionController::new(config.oneway_permits, config.async_permits),
            processors: ProcessorTable::new(),
            hooks,
            notifier,
            public_executor,
            connections: DashMap::new(),
            cancellation_token: CancellationToken::new(),
            notifier_token,
            started: AtomicBool::new(false),
            config,
        };

        InvocationEngine {
            shared: Arc::new(shared),
        }
    }
}
