//! Handle to a connection's event loop.
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::admission::AdmissionPermit;
use crate::command::Command;
use crate::{RemotingError, Result};

/// Identifies one connection for as long as the engine serves it.
///
/// UUIDv7, so ids sort roughly by the time the connection was accepted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// A command queued for the event loop to write.
///
/// `confirm_tx`, when present, hears how the write went.  `permit` is held until the write has
/// been attempted, so admission bounds commands that are queued as well as those in flight.
pub(crate) struct OutboundCommand {
    pub(crate) command: Command,
    pub(crate) confirm_tx: Option<oneshot::Sender<Result<()>>>,
    pub(crate) permit: Option<AdmissionPermit>,
}

impl OutboundCommand {
    pub(crate) fn new(command: Command) -> Self {
        Self {
            command,
            confirm_tx: None,
            permit: None,
        }
    }

    pub(crate) fn with_permit(mut self, permit: AdmissionPermit) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Report how the write went, to whoever asked.
    pub(crate) fn confirm(self, result: Result<()>) {
        if let Some(confirm_tx) = self.confirm_tx {
            let _ = confirm_tx.send(result);
        }
    }
}

/// What became of a command offered to [`ConnectionHandle::try_enqueue`].
pub(crate) enum Enqueued {
    Queued,
    /// The outbound queue has no room; the command is handed back
    Full(OutboundCommand),
}

/// Lightweight and cheaply-clonable handle to one connection.
///
/// Writes go through the connection's event loop, which owns the transport.  Every clone refers
/// to the same connection, and shutting down any of them shuts it down for all.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote_peer: Arc<str>,
    outbound: mpsc::Sender<OutboundCommand>,
    cancellation_token: CancellationToken,
    /// Cancelled by the event loop once it has completely finished
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        remote_peer: impl Into<Arc<str>>,
        outbound: mpsc::Sender<OutboundCommand>,
        cancellation_token: CancellationToken,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            remote_peer: remote_peer.into(),
            outbound,
            cancellation_token,
            closed,
        }
    }

    /// A handle that isn't attached to any event loop.  Whatever is written to it shows up on
    /// the returned receiver, where the test decides what to do with it.
    #[cfg(test)]
    pub(crate) fn new_test_handle(remote_peer: &str) -> (Self, mpsc::Receiver<OutboundCommand>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        (
            Self::new(
                ConnectionId::new(),
                remote_peer,
                outbound_tx,
                CancellationToken::new(),
                CancellationToken::new(),
            ),
            outbound_rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    /// Write `command` to the remote peer.
    ///
    /// Completes once the command has been handed to the transport.  Waits for room if the
    /// connection's outbound queue is full.  Fails with [`RemotingError::SendFailure`] if the
    /// connection is closed or the transport rejects the command.
    pub async fn write(&self, command: Command) -> Result<()> {
        let correlation_id = command.correlation_id;
        let (confirm_tx, confirm_rx) = oneshot::channel();

        let mut outbound = OutboundCommand::new(command);
        outbound.confirm_tx = Some(confirm_tx);
        self.enqueue(outbound).await?;

        confirm_rx.await.map_err(|_| {
            RemotingError::send_failure(
                self.id,
                correlation_id,
                "connection closed before the command was written",
            )
        })?
    }

    /// Queue `outbound` for writing if there is room right now, without waiting.
    pub(crate) fn try_enqueue(&self, outbound: OutboundCommand) -> Result<Enqueued> {
        let correlation_id = outbound.command.correlation_id;
        if self.cancellation_token.is_cancelled() {
            return Err(self.closed_error(correlation_id));
        }

        match self.outbound.try_send(outbound) {
            Ok(()) => Ok(Enqueued::Queued),
            Err(mpsc::error::TrySendError::Full(outbound)) => Ok(Enqueued::Full(outbound)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.closed_error(correlation_id)),
        }
    }

    /// Queue `outbound` for writing, waiting for room if the queue is full.
    pub(crate) async fn enqueue(&self, outbound: OutboundCommand) -> Result<()> {
        let correlation_id = outbound.command.correlation_id;
        if self.cancellation_token.is_cancelled() {
            return Err(self.closed_error(correlation_id));
        }

        self.outbound
            .send(outbound)
            .await
            .map_err(|_| self.closed_error(correlation_id))
    }

    fn closed_error(&self, correlation_id: i32) -> RemotingError {
        RemotingError::send_failure(self.id, correlation_id, "connection is closed")
    }

    /// True once shutdown has been requested or the event loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.cancellation_token.is_cancelled() || self.closed.is_cancelled()
    }

    /// Wait until the event loop has stopped, without asking it to.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Close the connection and wait until its event loop has stopped.
    ///
    /// Calls still waiting on a response from this connection fail with
    /// [`RemotingError::SendFailure`] before this returns.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.closed.cancelled().await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("remote_peer", &self.remote_peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
