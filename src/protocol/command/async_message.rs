//! Severity-classified notification body.
//!
//! An async message reuses the response header shape with a nonzero code
//! carrying the classification, followed by the originating device, a log
//! level, and the message text. The dispatcher never emits one on its own;
//! [`encode_async_message`] is the out-of-band emission entry point.

use enum_primitive_derive::Primitive;

use crate::protocol::buffer::{Buffer, CodecError};

use super::{encode_response_header, MessageType, WireDecode, WireEncode, MESSAGE_CAP};

/// Severity of an async message or a server log entry.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum LogLevel {
    /// An error.
    Error = 0,
    /// A warning.
    Warn = 1,
    /// Informational.
    Info = 2,
    /// Debug chatter.
    Debug = 3,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

/// A notification pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncMessage {
    /// The device the message concerns.
    pub device: u64,
    /// Raw severity level.
    pub level: u64,
    /// The message text.
    pub message: String,
}

impl WireEncode for AsyncMessage {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.device)?;
        buf.put_varint(self.level)?;
        buf.put_string(&self.message)
    }
}

impl WireDecode for AsyncMessage {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            device: buf.get_varint()?,
            level: buf.get_varint()?,
            message: buf.get_string(MESSAGE_CAP)?,
        })
    }
}

/// Appends a complete async message: the response-shaped header with the
/// classification code, then the body.
pub fn encode_async_message(
    buf: &mut Buffer,
    code: u64,
    device: u64,
    level: LogLevel,
    message: &str,
) -> Result<(), CodecError> {
    encode_response_header(buf, MessageType::AsyncMessage as u64, code)?;
    AsyncMessage {
        device,
        level: level as u64,
        message: message.to_owned(),
    }
    .encode(buf)
}
