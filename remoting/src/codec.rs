//! Binary framing for [`Command`]s, for use with [`tokio_util::codec::Framed`].
//!
//! Each frame on the wire looks like this (all integers big-endian):
//!
//! ```text
//! [4 bytes] frame length: number of bytes that follow this field
//! [4 bytes] header length; the high byte holds the header serialization type
//! [N bytes] header
//! [M bytes] body
//! ```
//!
//! The header is a JSON object:
//!
//! ```text
//! {"code":10,"language":"RUST","version":1,"opaque":42,"flag":0,"remark":null,"extFields":{}}
//! ```
//!
//! `opaque` is the correlation id.  Only the JSON serialization type (`0`) is supported.
use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::{Command, CommandFlags, LanguageCode};
use crate::{RemotingError, Result};

/// Default cap on the size of one frame, not counting the length prefix.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const LENGTH_FIELD_LEN: usize = 4;
const HEADER_LENGTH_FIELD_LEN: usize = 4;
const SERIALIZE_TYPE_JSON: u8 = 0;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandHeader {
    code: i32,
    #[serde(default)]
    language: LanguageCode,
    #[serde(default)]
    version: i32,
    opaque: i32,
    #[serde(default)]
    flag: CommandFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remark: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    ext_fields: HashMap<String, String>,
}

/// Encoder and decoder for remoting frames.
#[derive(Clone, Debug)]
pub struct RemotingCodec {
    max_frame_length: usize,
}

impl RemotingCodec {
    pub fn new() -> Self {
        Self::new_with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn new_with_max_length(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for RemotingCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RemotingCodec {
    type Item = Command;
    type Error = RemotingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > self.max_frame_length {
            return Err(RemotingError::Codec {
                message: format!(
                    "frame of {frame_len} bytes exceeds the maximum of {} bytes",
                    self.max_frame_length
                ),
            });
        }
        if frame_len < HEADER_LENGTH_FIELD_LEN {
            return Err(RemotingError::Codec {
                message: format!("frame of {frame_len} bytes is too short to hold a header length"),
            });
        }

        if src.len() < LENGTH_FIELD_LEN + frame_len {
            // Wait for the rest of the frame, and make room for it while we're at it
            src.reserve(LENGTH_FIELD_LEN + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_LEN);
        let mut frame = src.split_to(frame_len);

        let header_field = frame.get_u32();
        let serialize_type = (header_field >> 24) as u8;
        let header_len = (header_field & 0x00FF_FFFF) as usize;

        if serialize_type != SERIALIZE_TYPE_JSON {
            return Err(RemotingError::Codec {
                message: format!("unsupported header serialization type {serialize_type}"),
            });
        }
        if header_len > frame.len() {
            return Err(RemotingError::Codec {
                message: format!(
                    "header length {header_len} exceeds the {} bytes remaining in the frame",
                    frame.len()
                ),
            });
        }

        let header_bytes = frame.split_to(header_len);
        let header: CommandHeader = serde_json::from_slice(&header_bytes)?;

        Ok(Some(Command {
            correlation_id: header.opaque,
            code: header.code,
            flags: header.flag,
            language: header.language,
            version: header.version,
            remark: header.remark,
            ext_fields: header.ext_fields,
            body: frame.freeze(),
        }))
    }
}

impl Encoder<Command> for RemotingCodec {
    type Error = RemotingError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<()> {
        let Command {
            correlation_id,
            code,
            flags,
            language,
            version,
            remark,
            ext_fields,
            body,
        } = command;

        let header = serde_json::to_vec(&CommandHeader {
            code,
            language,
            version,
            opaque: correlation_id,
            flag: flags,
            remark,
            ext_fields,
        })?;

        if header.len() > 0x00FF_FFFF {
            return Err(RemotingError::Codec {
                message: format!("header of {} bytes is too large to encode", header.len()),
            });
        }

        let frame_len = HEADER_LENGTH_FIELD_LEN + header.len() + body.len();
        if frame_len > self.max_frame_length {
            return Err(RemotingError::Codec {
                message: format!(
                    "frame of {frame_len} bytes exceeds the maximum of {} bytes",
                    self.max_frame_length
                ),
            });
        }

        dst.reserve(LENGTH_FIELD_LEN + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_u32(((SERIALIZE_TYPE_JSON as u32) << 24) | header.len() as u32);
        dst.put_slice(&header);
        dst.put_slice(&body);

        Ok(())
    }
}
