//! A transport is whatever carries [`Command`]s to and from the remote peer.
//!
//! By the time a transport is handed to this crate the connection is already established: TCP
//! accept, TLS handshake and the like all happen up-stack.  What remains is deceptively simple: a
//! source and a sink of commands, delivered in order.
//!
//! The usual way to get one is to wrap an `AsyncRead + AsyncWrite` byte stream in
//! [`tokio_util::codec::Framed`] with a [`RemotingCodec`].
use std::borrow::Cow;
use std::pin::Pin;

use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::codec::RemotingCodec;
use crate::command::Command;
use crate::{RemotingError, Result};

/// A source and sink of [`Command`]s for one connection.
///
/// The connection reads and writes at the same time, so a transport hands over its two
/// directions as independent halves.  A write that is stuck waiting on the peer must never stop
/// the connection from reading.
pub trait Transport: Send + Sized + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Write half.  Sending a command completes once it has been handed to the underlying
    /// transport and flushed.
    type Writer: Sink<Command, Error = Self::Error> + Send + 'static;

    /// Read half.  Ends once the peer has closed the connection.
    type Reader: Stream<Item = Result<Command, Self::Error>> + Send + 'static;

    /// Transport-specific identifier of the remote peer, for logging and for RPC hooks.
    fn remote_peer(&self) -> Cow<'static, str>;

    fn split(self) -> (Self::Writer, Self::Reader);

    /// Override what [`Transport::remote_peer`] reports, typically with a socket address.
    fn with_remote_peer(self, remote_peer: impl Into<String>) -> LabeledTransport<Self> {
        LabeledTransport {
            inner: self,
            remote_peer: remote_peer.into(),
        }
    }
}

/// Wrap a transport error, keeping it as-is if it already is a [`RemotingError`].
fn transport_error<E>(e: E) -> RemotingError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = Box::new(e);
    match boxed.downcast::<RemotingError>() {
        Ok(remoting) => *remoting,
        Err(source) => RemotingError::Transport { source },
    }
}

pub(crate) type CommandSink = Pin<Box<dyn Sink<Command, Error = RemotingError> + Send>>;
pub(crate) type CommandStream = Pin<Box<dyn Stream<Item = Result<Command>> + Send>>;

/// Type-erased transport halves, so the connection doesn't have to be generic over the
/// transport type.
pub(crate) struct Peer {
    remote_peer: String,
    writer: CommandSink,
    reader: CommandStream,
}

impl Peer {
    pub(crate) fn new<T: Transport>(transport: T) -> Self {
        let remote_peer = transport.remote_peer().into_owned();
        let (writer, reader) = transport.split();

        Self {
            remote_peer,
            writer: Box::pin(writer.sink_map_err(transport_error::<T::Error>)),
            reader: Box::pin(reader.map_err(transport_error::<T::Error>)),
        }
    }

    pub(crate) fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub(crate) fn into_parts(self) -> (CommandSink, CommandStream) {
        (self.writer, self.reader)
    }
}

/// A transport with an explicitly assigned remote peer name.  See [`Transport::with_remote_peer`].
pub struct LabeledTransport<T> {
    inner: T,
    remote_peer: String,
}

impl<T: Transport> Transport for LabeledTransport<T> {
    type Error = T::Error;
    type Writer = T::Writer;
    type Reader = T::Reader;

    fn remote_peer(&self) -> Cow<'static, str> {
        Cow::Owned(self.remote_peer.clone())
    }

    fn split(self) -> (Self::Writer, Self::Reader) {
        self.inner.split()
    }
}

/// Any stream/sink pair of commands is a transport.  Handy for tests and for in-process peers.
impl<In, InErr, Out> Transport for (In, Out)
where
    In: Stream<Item = Result<Command, InErr>> + Send + 'static,
    InErr: std::error::Error + Send + Sync + 'static,
    Out: Sink<Command> + Send + 'static,
    Out::Error: std::error::Error + Send + Sync + 'static,
{
    type Error = RemotingError;
    type Writer = futures::sink::SinkMapErr<Out, fn(Out::Error) -> RemotingError>;
    type Reader = futures::stream::MapErr<In, fn(InErr) -> RemotingError>;

    fn remote_peer(&self) -> Cow<'static, str> {
        format!("({}, {})", std::any::type_name::<In>(), std::any::type_name::<Out>()).into()
    }

    fn split(self) -> (Self::Writer, Self::Reader) {
        let (reader, writer) = self;
        let writer_error: fn(Out::Error) -> RemotingError = transport_error;
        let reader_error: fn(InErr) -> RemotingError = transport_error;
        (writer.sink_map_err(writer_error), reader.map_err(reader_error))
    }
}

/// Length-prefixed remoting frames over any async byte stream.
///
/// Both halves share the `Framed` behind a lock that is only held for the duration of a single
/// poll, so a write waiting on the peer never holds up a read.
impl<Io> Transport for Framed<Io, RemotingCodec>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Error = RemotingError;
    type Writer = SplitSink<Self, Command>;
    type Reader = SplitStream<Self>;

    fn remote_peer(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Io>())
    }

    fn split(self) -> (Self::Writer, Self::Reader) {
        StreamExt::split(self)
    }
}
