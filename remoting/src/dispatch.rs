//! Routing of inbound requests to processors by request code.
//!
//! Lookup and queuing happen on the connection's event loop and never wait.  Whatever can be
//! answered right away (unknown code, processor refusing work, executor full) is returned to the
//! event loop as a reply to write; everything else runs on the processor's executor, which writes
//! the reply itself through the connection handle.
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use itertools::Itertools;
use tracing::Instrument;

use crate::command::{Command, ResponseCode};
use crate::error;
use crate::executor::WorkerPool;
use crate::hook::Hooks;
use crate::processor::{RequestContext, RequestProcessor};

/// A processor and the executor it runs on.
#[derive(Clone)]
pub struct ProcessorEntry {
    pub processor: Arc<dyn RequestProcessor>,
    pub executor: WorkerPool,
}

impl std::fmt::Debug for ProcessorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorEntry")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

/// What the event loop should do after handing a request to [`ProcessorTable::dispatch`].
#[derive(Debug)]
pub(crate) enum DispatchOutcome {
    /// Queued on an executor, which takes care of any reply
    Submitted,
    /// Not processed; write this reply
    Reply(Command),
    /// Not processed, and there's nobody to tell
    Dropped,
}

/// Request code to processor mapping, with an optional catch-all default.
#[derive(Clone, Default)]
pub struct ProcessorTable {
    entries: Arc<RwLock<HashMap<i32, ProcessorEntry>>>,
    default: Arc<RwLock<Option<ProcessorEntry>>>,
}

impl ProcessorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the processor for `code`.  A later registration for the same code replaces
    /// this one.
    pub fn register(&self, code: i32, entry: ProcessorEntry) {
        let replaced = self
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(code, entry)
            .is_some();
        if replaced {
            tracing::warn!(code, "Replacing the processor registered for request code");
        } else {
            tracing::debug!(code, "Processor registered");
        }
    }

    /// Register the processor for every code without one of its own.
    pub fn register_default(&self, entry: ProcessorEntry) {
        *self.default.write().unwrap_or_else(|e| e.into_inner()) = Some(entry);
        tracing::debug!("Default processor registered");
    }

    /// The entry registered for `code`, else the default entry, else `None`.
    pub fn lookup(&self, code: i32) -> Option<ProcessorEntry> {
        let specific = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&code)
            .cloned();
        specific.or_else(|| self.default_entry())
    }

    /// The entry registered for exactly `code`, ignoring the default.
    pub fn get(&self, code: i32) -> Option<ProcessorEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&code)
            .cloned()
    }

    pub fn default_entry(&self) -> Option<ProcessorEntry> {
        self.default.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Route one inbound request.  Never waits.
    pub(crate) fn dispatch(&self, ctx: RequestContext, request: Command, hooks: &Hooks) -> DispatchOutcome {
        let correlation_id = request.correlation_id;
        let code = request.code;
        let oneway = request.is_oneway();

        let Some(entry) = self.lookup(code) else {
            tracing::warn!(
                correlation_id,
                code,
                remote_peer = ctx.remote_peer(),
                oneway,
                "No processor for request code"
            );
            return Self::reply_unless_oneway(
                correlation_id,
                oneway,
                ResponseCode::RequestCodeNotSupported,
                format!("request type {code} not supported"),
            );
        };

        if entry.processor.reject_request() {
            tracing::debug!(correlation_id, code, "Processor is rejecting requests");
            return Self::reply_unless_oneway(
                correlation_id,
                oneway,
                ResponseCode::SystemBusy,
                "[REJECTREQUEST] system busy, start flow control for a while",
            );
        }

        let span = tracing::debug_span!(
            "process_request",
            correlation_id,
            code,
            connection_id = %ctx.connection_id(),
        );
        let job = Self::process(entry.processor.clone(), ctx, request, hooks.clone()).instrument(span);

        match entry.executor.submit(job) {
            Ok(()) => DispatchOutcome::Submitted,
            Err(e) => {
                tracing::warn!(
                    correlation_id,
                    code,
                    error = %e,
                    "Executor rejected request; replying system busy"
                );
                Self::reply_unless_oneway(
                    correlation_id,
                    oneway,
                    ResponseCode::SystemBusy,
                    "[OVERLOAD] system busy, start flow control for a while",
                )
            }
        }
    }

    fn reply_unless_oneway(
        correlation_id: i32,
        oneway: bool,
        code: ResponseCode,
        remark: impl Into<String>,
    ) -> DispatchOutcome {
        if oneway {
            DispatchOutcome::Dropped
        } else {
            DispatchOutcome::Reply(Command::error_response(correlation_id, code, remark))
        }
    }

    /// Runs on the executor
    async fn process(processor: Arc<dyn RequestProcessor>, ctx: RequestContext, request: Command, hooks: Hooks) {
        let correlation_id = request.correlation_id;
        let oneway = request.is_oneway();
        let connection = ctx.connection().clone();

        hooks.before_request(ctx.remote_peer(), &request);

        // The processor consumes the request; keep a copy only if a hook needs it afterwards
        let request_for_hooks = (!hooks.is_empty()).then(|| request.clone());

        let outcome = AssertUnwindSafe(processor.process_request(ctx, request))
            .catch_unwind()
            .await;

        let reply = match outcome {
            Ok(Ok(Some(response))) => Some(response.into_response_for(correlation_id)),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                tracing::error!(correlation_id, err = %format!("{e:#}"), "Processor failed");
                Some(Command::error_response(
                    correlation_id,
                    ResponseCode::SystemError,
                    format!("{e:#}"),
                ))
            }
            Err(panic) => {
                let message = error::panic_err_to_string(panic);
                tracing::error!(correlation_id, panic = %message, "Processor panicked");
                Some(Command::error_response(
                    correlation_id,
                    ResponseCode::SystemError,
                    format!("processor panicked: {message}"),
                ))
            }
        };

        let reply = if oneway {
            if reply.is_some() {
                tracing::trace!(correlation_id, "Discarding reply to oneway request");
            }
            None
        } else {
            reply
        };

        if let Some(request) = &request_for_hooks {
            hooks.after_response(connection.remote_peer(), request, reply.as_ref());
        }

        if let Some(reply) = reply {
            if let Err(e) = connection.write(reply).await {
                tracing::warn!(correlation_id, err = %e, "Failed to write reply");
            }
        }
    }
}

impl std::fmt::Debug for ProcessorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let codes = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .sorted()
            .collect_vec();
        f.debug_struct("ProcessorTable")
            .field("codes", &codes)
            .field("has_default", &self.default_entry().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{ConnectionHandle, OutboundCommand};
    use crate::processor_fn;
    use crate::testing::init_test_logging;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn entry(processor: impl RequestProcessor, executor: &WorkerPool) -> ProcessorEntry {
        ProcessorEntry {
            processor: Arc::new(processor),
            executor: executor.clone(),
        }
    }

    fn context() -> (RequestContext, mpsc::Receiver<OutboundCommand>) {
        let (connection, outbound) = ConnectionHandle::new_test_handle("peer");
        (RequestContext::new(connection), outbound)
    }

    /// Wait for the executor to write a reply, confirming the write so the job can finish.
    async fn written(outbound: &mut mpsc::Receiver<OutboundCommand>) -> Command {
        let outbound = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
            .await
            .expect("no reply within 5 seconds")
            .expect("outbound channel closed");
        let command = outbound.command.clone();
        outbound.confirm(Ok(()));
        command
    }

    struct Refusing;

    #[async_trait::async_trait]
    impl RequestProcessor for Refusing {
        async fn process_request(&self, _ctx: RequestContext, _request: Command) -> anyhow::Result<Option<Command>> {
            panic!("a refusing processor never gets a request");
        }

        fn reject_request(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn unknown_code_is_answered_unless_oneway() {
        init_test_logging();
        let table = ProcessorTable::new();

        let (ctx, _outbound) = context();
        let request = Command::request(42);
        let correlation_id = request.correlation_id;
        let reply = assert_matches!(
            table.dispatch(ctx, request, &Hooks::default()),
            DispatchOutcome::Reply(reply) => reply
        );
        assert_eq!(reply.correlation_id, correlation_id);
        assert_eq!(reply.response_code(), Some(ResponseCode::RequestCodeNotSupported));
        assert_eq!(reply.remark.as_deref(), Some("request type 42 not supported"));

        let (ctx, _outbound) = context();
        assert_matches!(
            table.dispatch(ctx, Command::oneway(42), &Hooks::default()),
            DispatchOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn default_processor_handles_unregistered_codes() {
        init_test_logging();
        let executor = WorkerPool::new("test", 1, 8);
        let table = ProcessorTable::new();
        table.register_default(entry(
            processor_fn(|_, request: Command| async move {
                Ok(Some(Command::response_to(&request, ResponseCode::Success).with_remark("default")))
            }),
            &executor,
        ));

        let (ctx, mut outbound) = context();
        assert_matches!(
            table.dispatch(ctx, Command::request(7), &Hooks::default()),
            DispatchOutcome::Submitted
        );
        assert_eq!(written(&mut outbound).await.remark.as_deref(), Some("default"));
        assert!(table.get(7).is_none());
        assert!(table.lookup(7).is_some());
    }

    #[tokio::test]
    async fn rejecting_processor_gets_system_busy() {
        init_test_logging();
        let executor = WorkerPool::new("test", 1, 8);
        let table = ProcessorTable::new();
        table.register(1, entry(Refusing, &executor));

        let (ctx, _outbound) = context();
        let reply = assert_matches!(
            table.dispatch(ctx, Command::request(1), &Hooks::default()),
            DispatchOutcome::Reply(reply) => reply
        );
        assert_eq!(reply.response_code(), Some(ResponseCode::SystemBusy));
        assert!(reply.remark.unwrap().starts_with("[REJECTREQUEST]"));
    }

    #[tokio::test]
    async fn replies_carry_the_request_correlation_id() {
        init_test_logging();
        let executor = WorkerPool::new("test", 1, 8);
        let table = ProcessorTable::new();
        // Deliberately answers with the wrong id and without the response flag
        table.register(
            1,
            entry(
                processor_fn(|_, _| async { Ok(Some(Command::request(0).with_correlation_id(-5))) }),
                &executor,
            ),
        );

        let (ctx, mut outbound) = context();
        let request = Command::request(1);
        let correlation_id = request.correlation_id;
        assert_matches!(
            table.dispatch(ctx, request, &Hooks::default()),
            DispatchOutcome::Submitted
        );

        let reply = written(&mut outbound).await;
        assert_eq!(reply.correlation_id, correlation_id);
        assert!(reply.is_response());
        assert!(!reply.is_oneway());
    }

    #[tokio::test]
    async fn processor_failures_become_system_errors() {
        init_test_logging();
        let executor = WorkerPool::new("test", 1, 8);
        let table = ProcessorTable::new();
        table.register(
            1,
            entry(
                processor_fn(|_, _| async { Err(anyhow::anyhow!("disk on fire")) }),
                &executor,
            ),
        );
        table.register(
            2,
            entry(
                processor_fn(|_, _| async {
                    if true {
                        panic!("unexpected state");
                    }
                    Ok(None)
                }),
                &executor,
            ),
        );

        let (ctx, mut outbound) = context();
        table.dispatch(ctx, Command::request(1), &Hooks::default());
        let reply = written(&mut outbound).await;
        assert_eq!(reply.response_code(), Some(ResponseCode::SystemError));
        assert_eq!(reply.remark.as_deref(), Some("disk on fire"));

        let (ctx, mut outbound) = context();
        table.dispatch(ctx, Command::request(2), &Hooks::default());
        let reply = written(&mut outbound).await;
        assert_eq!(reply.response_code(), Some(ResponseCode::SystemError));
        assert!(reply.remark.unwrap().contains("unexpected state"));
    }

    #[tokio::test]
    async fn oneway_requests_are_processed_without_reply() {
        init_test_logging();
        let executor = WorkerPool::new("test", 1, 8);
        let table = ProcessorTable::new();
        let (processed_tx, mut processed_rx) = mpsc::unbounded_channel();
        table.register(
            1,
            entry(
                processor_fn(move |_, request: Command| {
                    let processed_tx = processed_tx.clone();
                    async move {
                        let _ = processed_tx.send(request.correlation_id);
                        Ok(Some(Command::response_to(&request, ResponseCode::Success)))
                    }
                }),
                &executor,
            ),
        );

        let (ctx, mut outbound) = context();
        let request = Command::oneway(1);
        let correlation_id = request.correlation_id;
        assert_matches!(
            table.dispatch(ctx, request, &Hooks::default()),
            DispatchOutcome::Submitted
        );
        assert_eq!(processed_rx.recv().await, Some(correlation_id));

        executor.shutdown(Duration::from_secs(1)).await;
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_executor_means_overload() {
        init_test_logging();
        // The worker can't take anything off the queue until this task yields, so one queued job
        // fills it
        let executor = WorkerPool::new("stalled", 1, 1);
        let table = ProcessorTable::new();
        table.register(1, entry(processor_fn(|_, _| async { Ok(None) }), &executor));

        let (ctx, _outbound) = context();
        assert_matches!(
            table.dispatch(ctx, Command::request(1), &Hooks::default()),
            DispatchOutcome::Submitted
        );

        let (ctx, _outbound) = context();
        let reply = assert_matches!(
            table.dispatch(ctx, Command::request(1), &Hooks::default()),
            DispatchOutcome::Reply(reply) => reply
        );
        assert_eq!(reply.response_code(), Some(ResponseCode::SystemBusy));
        assert!(reply.remark.unwrap().starts_with("[OVERLOAD]"));

        let (ctx, _outbound) = context();
        assert_matches!(
            table.dispatch(ctx, Command::oneway(1), &Hooks::default()),
            DispatchOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn later_registration_replaces_earlier() {
        init_test_logging();
        let executor = WorkerPool::new("test", 1, 8);
        let table = ProcessorTable::new();
        for name in ["first", "second"] {
            table.register(
                1,
                entry(
                    processor_fn(move |_, request: Command| async move {
                        Ok(Some(Command::response_to(&request, ResponseCode::Success).with_remark(name)))
                    }),
                    &executor,
                ),
            );
        }

        let (ctx, mut outbound) = context();
        table.dispatch(ctx, Command::request(1), &Hooks::default());
        assert_eq!(written(&mut outbound).await.remark.as_deref(), Some("second"));
    }
}
