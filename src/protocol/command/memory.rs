//! Memory command bodies: reads, writes, and polls.
//!
//! The bulk payloads of MEM_WRITE and MEM_POLL are not part of the request
//! structs; they follow the encoded head directly and are borrowed out of
//! the command buffer with [`Buffer::get_direct`] on the receiving side.

use bitflags::bitflags;
use enum_primitive_derive::Primitive;

use crate::protocol::buffer::{Buffer, CodecError};

use super::{WireDecode, WireEncode};

/// Element width for memory accesses.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum AccessSize {
    /// Whatever width the device prefers.
    Default = 0,
    /// 8-bit accesses.
    Bits8 = 1,
    /// 16-bit accesses.
    Bits16 = 2,
    /// 32-bit accesses.
    Bits32 = 3,
    /// 64-bit accesses.
    Bits64 = 4,
}

impl Default for AccessSize {
    fn default() -> Self {
        AccessSize::Default
    }
}

bitflags! {
    /// Flags for memory commands.
    ///
    /// Bits above the ones named here are access-port specific and pass
    /// through to the backend untouched.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u64 {
        /// Do not advance the address between elements.
        const NO_ADDR_INC = 1 << 0;
        /// Poll succeeds when the masked comparison does NOT match.
        const POLL_MATCH_NE = 1 << 1;
        /// Poll compares the previously read data without a new access.
        const POLL_CHECK_LAST = 1 << 2;
    }
}

/// Read `size` bytes of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemReadRequest {
    /// Index into the device list.
    pub device: u64,
    /// Start address.
    pub address: u64,
    /// Number of bytes to read.
    pub size: u64,
    /// Raw access size value; validated by the dispatcher.
    pub access_size: u64,
    /// Raw memory flag word.
    pub flags: u64,
}

impl WireEncode for MemReadRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.device)?;
        buf.put_u64(self.address)?;
        buf.put_varint(self.size)?;
        buf.put_varint(self.access_size)?;
        buf.put_varint(self.flags)
    }
}

impl WireDecode for MemReadRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            device: buf.get_varint()?,
            address: buf.get_u64()?,
            size: buf.get_varint()?,
            access_size: buf.get_varint()?,
            flags: buf.get_varint()?,
        })
    }
}

/// Server reply to [`MemReadRequest`] and [`MemPollRequest`]: a varint byte
/// count followed by the raw data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemReadReply {
    /// The bytes read.
    pub data: Vec<u8>,
}

impl WireEncode for MemReadReply {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.data.len() as u64)?;
        buf.put_data(&self.data)
    }
}

impl WireDecode for MemReadReply {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        let size = buf.get_varint()? as usize;
        let data = buf.get_direct(size)?.to_vec();
        Ok(Self { data })
    }
}

/// Head of a MEM_WRITE request; `size` bytes of payload follow on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemWriteRequest {
    /// Index into the device list.
    pub device: u64,
    /// Start address.
    pub address: u64,
    /// Number of payload bytes.
    pub size: u64,
    /// Raw access size value.
    pub access_size: u64,
    /// Raw memory flag word.
    pub flags: u64,
}

impl WireEncode for MemWriteRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.device)?;
        buf.put_u64(self.address)?;
        buf.put_varint(self.size)?;
        buf.put_varint(self.access_size)?;
        buf.put_varint(self.flags)
    }
}

impl WireDecode for MemWriteRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            device: buf.get_varint()?,
            address: buf.get_u64()?,
            size: buf.get_varint()?,
            access_size: buf.get_varint()?,
            flags: buf.get_varint()?,
        })
    }
}

/// Head of a MEM_POLL request; two `size`-byte blocks follow on the wire,
/// the mask and then the match value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemPollRequest {
    /// Index into the device list.
    pub device: u64,
    /// Address to poll.
    pub address: u64,
    /// Number of bytes compared per attempt.
    pub size: u64,
    /// Raw access size value.
    pub access_size: u64,
    /// Raw memory flag word.
    pub flags: u64,
    /// Maximum number of read attempts.
    pub tries: u64,
    /// Microseconds to wait between attempts.
    pub interval_us: u64,
}

impl WireEncode for MemPollRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.device)?;
        buf.put_u64(self.address)?;
        buf.put_varint(self.size)?;
        buf.put_varint(self.access_size)?;
        buf.put_varint(self.flags)?;
        buf.put_varint(self.tries)?;
        buf.put_varint(self.interval_us)
    }
}

impl WireDecode for MemPollRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            device: buf.get_varint()?,
            address: buf.get_u64()?,
            size: buf.get_varint()?,
            access_size: buf.get_varint()?,
            flags: buf.get_varint()?,
            tries: buf.get_varint()?,
            interval_us: buf.get_varint()?,
        })
    }
}
