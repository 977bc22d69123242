//! Defines error types and wire result codes.

use enum_primitive_derive::Primitive;
use thiserror::Error;

use super::buffer::CodecError;

/// A result code understood by the protocol.
///
/// The numeric values are part of the wire ABI: error responses carry them
/// as a varint after the message type.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum ResultCode {
    /// Successful operation.
    Success = 0x0000,
    /// Other error.
    Failed = 0x0001,
    /// Not executed due to a previous failure in an aborting batch.
    Cancelled = 0x0002,
    /// The session has not been initialized.
    NotInitialized = 0x0003,
    /// Insufficient space in a buffer while encoding.
    BufferFull = 0x0010,
    /// Insufficient data left in a buffer while decoding.
    BufferEmpty = 0x0011,
    /// Insufficient space in an output buffer while decoding.
    OutputOverflow = 0x0012,
    /// Communication error.
    Comms = 0x0020,
    /// The server is not compatible with the client.
    Incompatible = 0x0021,
    /// A timeout occurred executing a command.
    Timeout = 0x0022,
    /// Command unsupported.
    Unsupported = 0x0023,
    /// Unsupported device.
    DeviceUnsupported = 0x0024,
    /// Invalid device index.
    InvalidDevice = 0x0025,
    /// Bad arguments to a command.
    BadArgs = 0x0026,
    /// Operation not permitted.
    NotPermitted = 0x0027,
    /// Register access failed.
    RegFailed = 0x0200,
    /// Attempt to access part of a multi-word register.
    RegPartial = 0x0201,
    /// Memory access failed.
    MemFailed = 0x0300,
    /// Invalid address for a memory access.
    MemInvalidAddress = 0x0301,
    /// Invalid access size for a memory access.
    MemBadAccessSize = 0x0302,
    /// A memory poll did not match before running out of tries.
    MemPollNoMatch = 0x0303,
}

impl ResultCode {
    /// The wire value of this code.
    pub fn value(self) -> u64 {
        self as u64
    }
}

impl CodecError {
    /// The wire result code this codec failure maps to.
    pub fn result_code(&self) -> ResultCode {
        match self {
            CodecError::BufferFull => ResultCode::BufferFull,
            CodecError::BufferEmpty => ResultCode::BufferEmpty,
            CodecError::OutputOverflow => ResultCode::OutputOverflow,
            CodecError::VarintOverflow | CodecError::InvalidString => ResultCode::Comms,
        }
    }
}

/// A generic protocol error, as surfaced by the client session.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A codec operation failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The peer violated the framing or response-matching rules.
    #[error("communication error: {0}")]
    Comms(String),
    /// A caller-supplied argument was rejected before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An error response sent by the server. `code` is the raw wire value;
    /// unknown codes are preserved.
    #[error("server error {code:#06x}: {message}")]
    Server {
        /// The wire result code.
        code: u64,
        /// The human-readable error body from the response.
        message: String,
    },
    /// An error occurred reading or writing the transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Builds a server-error value from a decoded error response.
    pub fn server(code: u64, message: String) -> Self {
        ProtocolError::Server { code, message }
    }

    /// The wire result code this error maps to.
    pub fn result_code(&self) -> u64 {
        match self {
            ProtocolError::Codec(e) => e.result_code().value(),
            ProtocolError::Comms(_) | ProtocolError::Io(_) => ResultCode::Comms.value(),
            ProtocolError::InvalidArgument(_) => ResultCode::BadArgs.value(),
            ProtocolError::Server { code, .. } => *code,
        }
    }

    /// The server's result code, when this error is a decoded error
    /// response with a known code.
    pub fn server_code(&self) -> Option<ResultCode> {
        use num_traits::FromPrimitive as _;

        match self {
            ProtocolError::Server { code, .. } => ResultCode::from_u64(*code),
            _ => None,
        }
    }
}
