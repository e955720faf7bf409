//! Server-side request processing.
//!
//! A [`RequestProcessor`] handles every inbound request carrying one request code (or, for the
//! default processor, every code nobody else claimed).  Processors always run on a
//! [`crate::WorkerPool`], never on a connection's event loop, so they are free to take their time.
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::Command;
use crate::{ConnectionHandle, ConnectionId};

/// What a processor knows about where a request came from.
#[derive(Clone, Debug)]
pub struct RequestContext {
    connection: ConnectionHandle,
}

impl RequestContext {
    pub(crate) fn new(connection: ConnectionHandle) -> Self {
        Self { connection }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn remote_peer(&self) -> &str {
        self.connection.remote_peer()
    }

    /// The connection the request arrived on.  Processors can use it to send more commands to
    /// the same peer, or to answer later instead of returning a response.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }
}

#[async_trait]
pub trait RequestProcessor: Send + Sync + 'static {
    /// Handle one request.
    ///
    /// Return `Ok(Some(response))` to answer it; the response is sent back with the request's
    /// correlation id, whatever the processor set.  Return `Ok(None)` to send nothing, either
    /// because the processor answers later through [`RequestContext::connection`] or because
    /// there is nothing to say.  An error is reported to the peer as a system error.
    ///
    /// Responses to oneway requests are discarded.
    async fn process_request(&self, ctx: RequestContext, request: Command) -> anyhow::Result<Option<Command>>;

    /// Return `true` to have new requests refused with a "system busy" response without being
    /// processed.  Checked once per request, before it is queued.
    fn reject_request(&self) -> bool {
        false
    }
}

#[async_trait]
impl<P: RequestProcessor + ?Sized> RequestProcessor for Arc<P> {
    async fn process_request(&self, ctx: RequestContext, request: Command) -> anyhow::Result<Option<Command>> {
        (**self).process_request(ctx, request).await
    }

    fn reject_request(&self) -> bool {
        (**self).reject_request()
    }
}

/// Processor made from an async closure.  See [`processor_fn`].
pub struct FnProcessor<F>(F);

/// Use an async function or closure as a [`RequestProcessor`].
///
/// ```
/// use remoting::{Command, ResponseCode, processor_fn};
///
/// let echo = processor_fn(|_ctx, request: Command| async move {
///     Ok(Some(Command::response_to(&request, ResponseCode::Success).with_body(request.body)))
/// });
/// # let _ = echo;
/// ```
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(RequestContext, Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Command>>> + Send + 'static,
{
    FnProcessor(f)
}

#[async_trait]
impl<F, Fut> RequestProcessor for FnProcessor<F>
where
    F: Fn(RequestContext, Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Command>>> + Send + 'static,
{
    async fn process_request(&self, ctx: RequestContext, request: Command) -> anyhow::Result<Option<Command>> {
        (self.0)(ctx, request).await
    }
}
