//! The command catalog: message types, headers, and per-command bodies.
//!
//! Every command has a request body and a response body, both expressed as
//! plain structs that encode into and decode from a [`Buffer`]. Response
//! bodies are only present when the response header's result code is zero;
//! otherwise the body is a single error string.

use enum_primitive_derive::Primitive;

mod async_message;
mod device;
mod memory;
mod register;
mod session;

pub use async_message::{encode_async_message, AsyncMessage, LogLevel};
pub use device::{
    Capabilities, DeviceCloseRequest, DeviceOpenReply, DeviceOpenRequest,
    GetConfigReply, GetConfigRequest, GetDeviceCapabilitiesReply,
    GetDeviceCapabilitiesRequest, SetConfigRequest,
};
pub use memory::{
    AccessSize, MemFlags, MemReadReply, MemReadRequest, MemPollRequest, MemWriteRequest,
};
pub use register::{
    RegListReply, RegListRequest, RegReadReply, RegReadRequest, RegWriteRequest, RegisterInfo,
    RegisterWrite,
};
pub use session::{
    ClientInfoRequest, DeviceDescriptor, GetDevicesReply, InitReply, InitRequest,
    SetDevicesRequest, SystemDescriptionReply,
};

use super::buffer::{Buffer, CodecError};

/// Message type identifiers. The numeric values are part of the wire ABI.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum MessageType {
    /// Initialize a session.
    Init = 0x0001,
    /// Terminate a session.
    Term = 0x0002,
    /// Free-form information from a client, recorded in the server log.
    ClientInfo = 0x0005,
    /// Replace the server's device list.
    SetDevices = 0x0010,
    /// Enumerate the server's device list.
    GetDevices = 0x0011,
    /// Fetch the system description blob.
    GetSystemDescription = 0x0012,
    /// Open a device.
    DeviceOpen = 0x0100,
    /// Close a device.
    DeviceClose = 0x0101,
    /// Set a configuration item.
    SetConfig = 0x0102,
    /// Get a configuration item.
    GetConfig = 0x0103,
    /// Query per-device capability bits.
    GetDeviceCapabilities = 0x0104,
    /// Enumerate a device's registers.
    RegList = 0x0200,
    /// Read registers.
    RegRead = 0x0201,
    /// Write registers.
    RegWrite = 0x0202,
    /// Read memory.
    MemRead = 0x0300,
    /// Write memory.
    MemWrite = 0x0301,
    /// Poll a memory location until it matches.
    MemPoll = 0x0302,
    /// Severity-classified notification.
    AsyncMessage = 0x1000,
}

/// First message type of the implementation-defined range.
pub const IMPLEMENTATION_DEFINED_BEGIN: u64 = 0x8000;
/// Last message type of the implementation-defined range.
pub const IMPLEMENTATION_DEFINED_END: u64 = 0xFFFF;

/// Decode cap for names and other short strings: client and device
/// identifiers, device types, config names and values, device info.
pub const NAME_CAP: usize = 256;
/// Decode cap for register descriptions and log/error messages.
pub const MESSAGE_CAP: usize = 1024;

/// Serializes a body into a [`Buffer`].
pub trait WireEncode {
    /// Appends `self` at the buffer's write position.
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError>;
}

/// Deserializes a body from a [`Buffer`].
pub trait WireDecode: Sized {
    /// Reads an instance of `Self` at the buffer's read position.
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError>;
}

/// Appends a command header (the varint message type).
pub fn encode_command_header(buf: &mut Buffer, ty: MessageType) -> Result<(), CodecError> {
    buf.put_varint(ty as u64)
}

/// Reads a command header, returning the raw message type value.
pub fn decode_command_header(buf: &mut Buffer) -> Result<u64, CodecError> {
    buf.get_varint()
}

/// The `(type, code)` pair prefixing every response body.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Raw message type this response answers.
    pub message_type: u64,
    /// Raw result code; zero means success.
    pub error_code: u64,
}

/// Appends a response header.
pub fn encode_response_header(
    buf: &mut Buffer,
    message_type: u64,
    error_code: u64,
) -> Result<(), CodecError> {
    buf.put_varint(message_type)?;
    buf.put_varint(error_code)
}

/// Reads a response header.
pub fn decode_response_header(buf: &mut Buffer) -> Result<ResponseHeader, CodecError> {
    Ok(ResponseHeader {
        message_type: buf.get_varint()?,
        error_code: buf.get_varint()?,
    })
}

/// Appends a complete error response: header with a nonzero code, then the
/// message string.
pub fn encode_error_response(
    buf: &mut Buffer,
    message_type: u64,
    error_code: u64,
    message: &str,
) -> Result<(), CodecError> {
    encode_response_header(buf, message_type, error_code)?;
    buf.put_string(message)
}

/// Reads the error string body following a response header with a nonzero
/// code.
pub fn decode_error_message(buf: &mut Buffer) -> Result<String, CodecError> {
    buf.get_string(MESSAGE_CAP)
}

#[cfg(test)]
pub(crate) mod test_util {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Encodes `v`, decodes it back, and checks the result and the cursor.
    pub(crate) fn roundtrip<T>(v: &T)
    where
        T: WireEncode + WireDecode + PartialEq + std::fmt::Debug,
    {
        let mut buf = Buffer::new(8192);
        v.encode(&mut buf).expect("encode");

        buf.seek(0);
        let v2 = T::decode(&mut buf).expect("decode");
        assert_eq!(v, &v2);
        assert_eq!(buf.pos(), buf.used(), "decode consumed the whole body");
    }
}
