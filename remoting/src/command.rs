//! The [`Command`] is the unit of work exchanged between peers: every request, every response, and
//! every oneway message is a command.
//!
//! A command is matched to its response purely by correlation id.  The id is chosen by whoever
//! sends the request and echoed back unchanged by whoever answers it, so the response envelope
//! never needs to repeat anything else from the request.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{RemotingError, Result};

/// Source of correlation ids for [`Command::request`] and [`Command::oneway`].
///
/// Ids must be unique among outstanding calls in the whole process, not just on one connection,
/// because the pending-call registry is shared by every connection an engine serves.
static NEXT_CORRELATION_ID: AtomicI32 = AtomicI32::new(0);

fn next_correlation_id() -> i32 {
    NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Bit flags carried in every command header.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandFlags(i32);

impl CommandFlags {
    const RESPONSE: i32 = 0b01;
    const ONEWAY: i32 = 0b10;

    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> i32 {
        self.0
    }

    pub fn is_response(self) -> bool {
        self.0 & Self::RESPONSE != 0
    }

    pub fn is_request(self) -> bool {
        !self.is_response()
    }

    pub fn is_oneway(self) -> bool {
        self.0 & Self::ONEWAY != 0
    }

    fn with_response(self) -> Self {
        Self(self.0 | Self::RESPONSE)
    }

    fn with_oneway(self) -> Self {
        Self(self.0 | Self::ONEWAY)
    }
}

impl fmt::Debug for CommandFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_response() { "response" } else { "request" };
        if self.is_oneway() {
            write!(f, "{kind}|oneway ({:#b})", self.0)
        } else {
            write!(f, "{kind} ({:#b})", self.0)
        }
    }
}

/// Well-known response codes.
///
/// The remoting layer itself only ever produces the first four; anything else is owned by the
/// processors built on top of it and is carried through untouched as [`ResponseCode::Other`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Success,
    SystemError,
    SystemBusy,
    RequestCodeNotSupported,
    Other(i32),
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseCode::Other(code) => write!(f, "Other({code})"),
            known => fmt::Debug::fmt(known, f),
        }
    }
}

impl From<i32> for ResponseCode {
    fn from(code: i32) -> Self {
        match code {
            0 => ResponseCode::Success,
            1 => ResponseCode::SystemError,
            2 => ResponseCode::SystemBusy,
            3 => ResponseCode::RequestCodeNotSupported,
            other => ResponseCode::Other(other),
        }
    }
}

impl From<ResponseCode> for i32 {
    fn from(code: ResponseCode) -> Self {
        match code {
            ResponseCode::Success => 0,
            ResponseCode::SystemError => 1,
            ResponseCode::SystemBusy => 2,
            ResponseCode::RequestCodeNotSupported => 3,
            ResponseCode::Other(other) => other,
        }
    }
}

/// Implementation language advertised in the command header.  Purely informational.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LanguageCode {
    Java,
    Cpp,
    Go,
    Python,
    #[default]
    Rust,
    #[serde(other)]
    Other,
}

/// Version of the remoting protocol this crate speaks, stamped into every command it creates.
pub const PROTOCOL_VERSION: i32 = 1;

/// A request, response, or oneway message.
#[derive(Clone, PartialEq)]
pub struct Command {
    pub correlation_id: i32,
    pub code: i32,
    pub flags: CommandFlags,
    pub language: LanguageCode,
    pub version: i32,
    pub remark: Option<String>,
    pub ext_fields: HashMap<String, String>,
    pub body: Bytes,
}

impl Command {
    fn new(correlation_id: i32, code: i32, flags: CommandFlags) -> Self {
        Self {
            correlation_id,
            code,
            flags,
            language: LanguageCode::default(),
            version: PROTOCOL_VERSION,
            remark: None,
            ext_fields: HashMap::new(),
            body: Bytes::new(),
        }
    }

    /// A new request for the operation `code`, with a freshly allocated correlation id.
    pub fn request(code: i32) -> Self {
        Self::new(next_correlation_id(), code, CommandFlags::default())
    }

    /// A new request for the operation `code` which the remote peer must not answer.
    pub fn oneway(code: i32) -> Self {
        Self::request(code).into_oneway()
    }

    /// A response to `request`, echoing its correlation id.
    pub fn response_to(request: &Command, code: impl Into<i32>) -> Self {
        Self::response(request.correlation_id, code)
    }

    /// A response with an explicit correlation id.
    pub fn response(correlation_id: i32, code: impl Into<i32>) -> Self {
        Self::new(correlation_id, code.into(), CommandFlags::default().with_response())
    }

    /// An error response carrying a human-readable remark.
    pub fn error_response(correlation_id: i32, code: ResponseCode, remark: impl Into<String>) -> Self {
        Self::response(correlation_id, code).with_remark(remark)
    }

    pub fn with_correlation_id(mut self, correlation_id: i32) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }

    pub fn with_ext_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ext_fields.insert(key.into(), value.into());
        self
    }

    pub fn into_oneway(mut self) -> Self {
        self.flags = self.flags.with_oneway();
        self
    }

    /// Turn this command into a response tagged with `correlation_id`.
    ///
    /// Processors build their reply however they like; the dispatcher runs every reply through
    /// this before writing it, so the flags and correlation id are always right.
    pub(crate) fn into_response_for(mut self, correlation_id: i32) -> Self {
        self.correlation_id = correlation_id;
        self.flags = CommandFlags::from_bits(self.flags.bits() & !CommandFlags::ONEWAY).with_response();
        self
    }

    pub fn is_response(&self) -> bool {
        self.flags.is_response()
    }

    pub fn is_request(&self) -> bool {
        self.flags.is_request()
    }

    pub fn is_oneway(&self) -> bool {
        self.flags.is_oneway()
    }

    pub fn ext_field(&self, key: &str) -> Option<&str> {
        self.ext_fields.get(key).map(String::as_str)
    }

    /// The response code of this command, if it is a response.
    pub fn response_code(&self) -> Option<ResponseCode> {
        self.is_response().then(|| ResponseCode::from(self.code))
    }

    /// Convert a response into a `Result`, mapping the response codes the remoting layer itself
    /// produces onto the matching error kinds.
    ///
    /// Codes other than the built-in error codes are returned as `Ok`, since their meaning is
    /// owned by the processor that produced them.
    pub fn into_result(self) -> Result<Command> {
        let code = match self.response_code() {
            Some(code) => code,
            None => {
                return Err(RemotingError::Bug {
                    message: format!("command {} is a request, not a response", self.correlation_id),
                });
            }
        };
        let remark = || self.remark.clone().unwrap_or_default();
        let err = match code {
            ResponseCode::SystemBusy => RemotingError::ServerBusy { remark: remark() },
            ResponseCode::RequestCodeNotSupported => RemotingError::RequestCodeNotSupported { remark: remark() },
            ResponseCode::SystemError => RemotingError::HandlerFailure {
                code: self.code,
                remark: remark(),
            },
            ResponseCode::Success | ResponseCode::Other(_) => return Ok(self),
        };
        Err(err)
    }

    /// Fields worth attaching to log events about this command
    pub(crate) fn diagnostic_context(&self) -> (&'static str, i32, i32) {
        let kind = match (self.is_response(), self.is_oneway()) {
            (true, _) => "response",
            (false, true) => "oneway",
            (false, false) => "request",
        };
        (kind, self.correlation_id, self.code)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("correlation_id", &self.correlation_id)
            .field("code", &self.code)
            .field("flags", &self.flags)
            .field("remark", &self.remark)
            .field("ext_fields", &self.ext_fields)
            .field("body_len", &self.body.len())
            .finish()
    }
}
