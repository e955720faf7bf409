//! Each connection is serviced by its own event loop, running in a dedicated async task.
//!
//! The event loop owns both halves of the transport.  It multiplexes:
//!
//! - commands other tasks want written, queued through [`ConnectionHandle::write`] and the
//!   engine's call paths
//! - completion of the one write currently in flight
//! - commands arriving from the peer: responses go to the pending-call registry, requests to the
//!   processor table
//! - the periodic idle check
//! - cancellation, from [`ConnectionHandle::shutdown`] or from engine shutdown
//!
//! A write is never awaited inline.  It runs as a future of its own that the loop polls alongside
//! everything else, so a peer that stops reading stalls only the writes.  Nothing in here waits on a processor or a callback; those run on
//! worker pools.
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::OptionFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::command::Command;
use crate::dispatch::DispatchOutcome;
use crate::engine::EngineShared;
use crate::handle::{ConnectionHandle, ConnectionId, OutboundCommand};
use crate::lifecycle::{ConnectionActivity, ConnectionEvent, IdlePolicy};
use crate::processor::RequestContext;
use crate::admission::AdmissionPermit;
use crate::transport::{CommandSink, CommandStream, Peer};
use crate::{RemotingError, Result, error};

/// Start servicing `peer` on a new task, returning the handle to the connection.
pub(crate) fn service_connection(shared: Arc<EngineShared>, peer: Peer) -> Result<ConnectionHandle> {
    let cancellation_token = shared.cancellation_token.child_token();

    if cancellation_token.is_cancelled() {
        tracing::warn!(
            remote_peer = peer.remote_peer(),
            "Engine is shutting down; refusing to service new connection"
        );
        return Err(RemotingError::Cancelled);
    }

    let id = ConnectionId::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(shared.config.outbound_queue_capacity.max(1));
    let closed = CancellationToken::new();
    let handle = ConnectionHandle::new(
        id,
        peer.remote_peer(),
        outbound_tx,
        cancellation_token.clone(),
        closed.clone(),
    );
    shared.connections.insert(id, handle.clone());

    let span = tracing::debug_span!("connection", connection_id = %id, remote_peer = peer.remote_peer());
    let (writer, reader) = peer.into_parts();

    let connection = ServiceConnection {
        id,
        idle_policy: shared.config.idle_policy(),
        shared: shared.clone(),
        writer: Some(writer),
        reader,
        in_flight: None,
        replies: VecDeque::new(),
        handle: handle.clone(),
        outbound: outbound_rx,
        activity: ConnectionActivity::new(Instant::now()),
        cancellation_token,
    };

    tokio::spawn(
        async move {
            if let Err(panic) = AssertUnwindSafe(connection.event_loop()).catch_unwind().await {
                // The orderly shutdown at the end of the loop didn't happen, so at least make
                // sure nobody keeps waiting on this connection
                tracing::error!(
                    panic = %error::panic_err_to_string(panic),
                    "BUG: connection event loop panicked"
                );
                shared.registry.fail_all(id, "connection event loop panicked");
                shared.connections.remove(&id);
            }
            closed.cancel();
        }
        .instrument(span),
    );

    Ok(handle)
}

/// Why the event loop stopped.
#[derive(Debug)]
enum Termination {
    PeerClosed,
    IdleTimeout,
    Cancelled,
    Failed(RemotingError),
}

impl Termination {
    fn reason(&self) -> String {
        match self {
            Termination::PeerClosed => "connection closed by remote peer".to_string(),
            Termination::IdleTimeout => "connection closed after being idle".to_string(),
            Termination::Cancelled => "connection closed locally".to_string(),
            Termination::Failed(e) => format!("connection failed: {e}"),
        }
    }
}

/// The outcome of one write, along with the writer so the next write can use it.
struct WriteDone {
    writer: CommandSink,
    correlation_id: i32,
    /// A request whose caller is waiting in the pending-call registry
    awaits_response: bool,
    confirm_tx: Option<oneshot::Sender<Result<()>>>,
    permit: Option<AdmissionPermit>,
    result: Result<()>,
}

type WriteInFlight = Pin<Box<dyn Future<Output = WriteDone> + Send>>;

/// The state of one connection, owned by its event loop task.  No locks: nothing outside the
/// loop touches it except through the channels in [`ConnectionHandle`].
struct ServiceConnection {
    id: ConnectionId,
    shared: Arc<EngineShared>,
    /// `None` while a write is in flight, which then owns it
    writer: Option<CommandSink>,
    reader: CommandStream,
    in_flight: Option<WriteInFlight>,
    /// Replies the loop produced itself, written ahead of queued commands
    replies: VecDeque<Command>,
    handle: ConnectionHandle,
    outbound: mpsc::Receiver<OutboundCommand>,
    activity: ConnectionActivity,
    idle_policy: IdlePolicy,
    cancellation_token: CancellationToken,
}

impl ServiceConnection {
    async fn event_loop(mut self) {
        tracing::debug!("Event loop is starting");
        self.shared.notifier.notify(ConnectionEvent::Connect, &self.handle);

        let period = self.shared.config.idle_check_interval;
        let mut idle_check = tokio::time::interval_at(Instant::now() + period, period);
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let check_idle = !self.idle_policy.is_disabled();

        let termination = loop {
            if self.in_flight.is_none() {
                if let Some(reply) = self.replies.pop_front() {
                    self.start_write(OutboundCommand::new(reply));
                }
            }

            tokio::select! {
                Some(done) = OptionFuture::from(self.in_flight.as_mut()), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    if let Err(e) = self.finish_write(done) {
                        break Termination::Failed(e);
                    }
                },
                outbound = self.outbound.recv(), if self.writer.is_some() && self.replies.is_empty() => {
                    match outbound {
                        Some(outbound) => self.start_write(outbound),
                        None => {
                            // The connection holds a handle to itself, so this can't happen
                            tracing::error!("BUG: outbound command channel closed; event loop terminating");
                            break Termination::Failed(RemotingError::Bug {
                                message: "outbound command channel closed".to_string(),
                            });
                        }
                    }
                },
                received = self.reader.next() => {
                    match received {
                        Some(Ok(command)) => self.handle_inbound(command),
                        None => {
                            tracing::debug!("Peer closed connection");
                            break Termination::PeerClosed;
                        }
                        Some(Err(e)) => {
                            tracing::error!(err = %e, "Error receiving from peer");
                            break Termination::Failed(e);
                        }
                    }
                },
                _ = idle_check.tick(), if check_idle => {
                    if self.check_idle() {
                        break Termination::IdleTimeout;
                    }
                },
                _ = self.cancellation_token.cancelled() => {
                    tracing::debug!("Cancellation signal received, shutting down connection");
                    break Termination::Cancelled;
                }
            }
        };

        self.shutdown(termination).await;
    }

    /// Bring everything still in flight on this connection to a conclusion.
    async fn shutdown(mut self, termination: Termination) {
        let reason = termination.reason();

        // From here on, handles see the connection as closed
        self.cancellation_token.cancel();
        self.outbound.close();

        // A write still waiting on the peer is abandoned along with the transport
        self.in_flight = None;
        self.replies.clear();

        // Commands queued but never written
        while let Some(outbound) = self.outbound.recv().await {
            let correlation_id = outbound.command.correlation_id;
            tracing::debug!(correlation_id, "Discarding queued command due to shutdown");
            outbound.confirm(Err(RemotingError::send_failure(self.id, correlation_id, reason.clone())));
        }

        // Calls that went out on this connection will never get their response.  They must all
        // be failed before anyone hears that the connection is gone.
        let failed = self.shared.registry.fail_all(self.id, &reason);
        self.activity.mark_closed();

        if let Termination::Failed(e) = &termination {
            self.shared
                .notifier
                .notify(ConnectionEvent::Exception(e.to_string()), &self.handle);
        }
        self.shared.notifier.notify(ConnectionEvent::Close, &self.handle);
        self.shared.connections.remove(&self.id);

        let termination_reason = match termination {
            Termination::PeerClosed => "remote_peer_closed_connection",
            Termination::IdleTimeout => "idle_timeout",
            Termination::Cancelled => "cancelled_token_triggered",
            Termination::Failed(_) => "error",
        };
        tracing::debug!(termination_reason, failed_calls = failed.len(), "Event loop is exiting");
    }

    fn handle_inbound(&mut self, command: Command) {
        self.activity.record_read(Instant::now());

        let (kind, correlation_id, code) = command.diagnostic_context();
        tracing::trace!(kind, correlation_id, code, "Received command");

        if command.is_response() {
            self.shared.registry.resolve(correlation_id, command);
            return;
        }

        let ctx = RequestContext::new(self.handle.clone());
        match self.shared.processors.dispatch(ctx, command, &self.shared.hooks) {
            DispatchOutcome::Submitted | DispatchOutcome::Dropped => {}
            DispatchOutcome::Reply(reply) => {
                if self.replies.len() >= self.shared.config.outbound_queue_capacity.max(1) {
                    tracing::warn!(correlation_id, "Too many replies waiting to be written; dropping reply");
                } else {
                    self.replies.push_back(reply);
                }
            }
        }
    }

    /// Hand `outbound` to the writer.  Only called while no other write is in flight.
    fn start_write(&mut self, outbound: OutboundCommand) {
        let Some(mut writer) = self.writer.take() else {
            tracing::error!("BUG: write started while another is in flight");
            outbound.confirm(Err(RemotingError::Bug {
                message: "write started while another is in flight".to_string(),
            }));
            return;
        };

        let OutboundCommand {
            command,
            confirm_tx,
            permit,
        } = outbound;
        let (kind, correlation_id, code) = command.diagnostic_context();
        let awaits_response = !command.is_response() && !command.is_oneway();

        tracing::trace!(kind, correlation_id, code, "Writing command");
        self.in_flight = Some(Box::pin(async move {
            let result = writer.send(command).await;
            WriteDone {
                writer,
                correlation_id,
                awaits_response,
                confirm_tx,
                permit,
                result,
            }
        }));
    }

    /// Account for a completed write.  Returns an error only if the transport is beyond use.
    fn finish_write(&mut self, done: WriteDone) -> Result<()> {
        let WriteDone {
            writer,
            correlation_id,
            awaits_response,
            confirm_tx,
            permit,
            result,
        } = done;
        self.writer = Some(writer);
        if let Some(permit) = permit {
            permit.release();
        }

        let confirm = |result: Result<()>| {
            if let Some(confirm_tx) = confirm_tx {
                let _ = confirm_tx.send(result);
            }
        };

        match result {
            Ok(()) => {
                self.activity.record_write(Instant::now());
                tracing::trace!(correlation_id, "Sent command");
                confirm(Ok(()));
                Ok(())
            }
            Err(e) => {
                tracing::error!(correlation_id, err = %e, "Error sending command to peer");
                if awaits_response {
                    self.shared.registry.fail(correlation_id, e.to_string());
                }
                confirm(Err(RemotingError::send_failure(self.id, correlation_id, e.to_string())));
                if Self::is_fatal(&e) { Err(e) } else { Ok(()) }
            }
        }
    }

    /// A codec error on write means that one command couldn't be encoded, and nothing reached
    /// the wire.  Anything else means the transport itself is broken.
    fn is_fatal(e: &RemotingError) -> bool {
        !matches!(e, RemotingError::Codec { .. } | RemotingError::Header { .. })
    }

    /// Returns `true` if the connection has been idle long enough to close.
    fn check_idle(&mut self) -> bool {
        let check = self.idle_policy.evaluate(&mut self.activity, Instant::now());

        for kind in check.idle {
            tracing::debug!(%kind, "Connection is idle");
            self.shared.notifier.notify(ConnectionEvent::Idle(kind), &self.handle);
        }

        if check.close {
            tracing::info!(
                all_idle = ?self.idle_policy.all,
                "Closing connection that has been idle for too long"
            );
        }
        check.close
    }
}
