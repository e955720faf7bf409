//! The request/response core of a broker's remoting transport.
//!
//! Peers exchange [`Command`]s over long-lived, multiplexed connections.  Every request carries a
//! correlation id, and the response to it echoes that id back, so any number of calls can be in
//! flight on one connection and their responses can arrive in any order.
//!
//! An [`InvocationEngine`] serves connections and provides three ways to call the peer at the
//! other end:
//!
//! - [`InvocationEngine::call_sync`] waits for the response
//! - [`InvocationEngine::call_async`] returns once the request is queued and reports the outcome
//!   to a callback
//! - [`InvocationEngine::call_oneway`] expects no response at all
//!
//! Requests arriving from the peer are routed by request code to a [`RequestProcessor`], which
//! runs on a [`WorkerPool`] rather than on the connection's I/O task.
//!
//! This crate knows nothing about TCP or TLS.  Anything that implements [`Transport`] will do,
//! and [`RemotingCodec`] turns any async byte stream into one.

/// Re-export the exact async-trait macro we use, for implementing [`RequestProcessor`]
#[doc(hidden)]
pub use async_trait::async_trait;

mod admission;
mod codec;
mod command;
mod config;
mod connection;
mod dispatch;
mod engine;
mod error;
mod executor;
mod handle;
mod hook;
mod lifecycle;
mod processor;
mod registry;
#[cfg(test)]
pub mod testing;
mod transport;

pub use admission::{AdmissionController, AdmissionPermit, Pool};
pub use codec::{DEFAULT_MAX_FRAME_LENGTH, RemotingCodec};
pub use command::{Command, CommandFlags, LanguageCode, PROTOCOL_VERSION, ResponseCode};
pub use config::RemotingConfig;
pub use dispatch::{ProcessorEntry, ProcessorTable};
pub use engine::{InvocationEngine, InvocationEngineBuilder};
pub use error::{RemotingError, Result};
pub use executor::{Rejected, WorkerPool};
pub use handle::{ConnectionHandle, ConnectionId};
pub use hook::RpcHook;
pub use lifecycle::{
    ConnectionActivity, ConnectionEvent, ConnectionEventListener, ConnectionPhase, IdleCheck, IdleKind,
    IdlePolicy, LifecycleNotifier,
};
pub use processor::{FnProcessor, RequestContext, RequestProcessor, processor_fn};
pub use registry::{
    CallMode, CallState, CallSummary, CallToken, InvokeCallback, PendingCall, PendingCallRegistry,
};
pub use transport::{LabeledTransport, Transport};
