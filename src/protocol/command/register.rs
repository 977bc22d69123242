//! Register command bodies: enumeration, reads, and writes.

use crate::protocol::buffer::{Buffer, CodecError};

use super::{WireDecode, WireEncode, MESSAGE_CAP, NAME_CAP};

/// Description of one register exposed by an open device.
///
/// Register IDs need not be consecutive; a device may fold access
/// information into the ID. `size` is in 32-bit words, so a 64-bit register
/// has size 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInfo {
    /// Device-assigned register ID.
    pub id: u32,
    /// Unique register name.
    pub name: String,
    /// Register size in 32-bit words.
    pub size: u32,
    /// Display name.
    pub display_name: String,
    /// Description.
    pub description: String,
}

impl WireEncode for RegisterInfo {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(u64::from(self.id))?;
        buf.put_string(&self.name)?;
        buf.put_varint(u64::from(self.size))?;
        buf.put_string(&self.display_name)?;
        buf.put_string(&self.description)
    }
}

impl WireDecode for RegisterInfo {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        let id = narrow(buf.get_varint()?)?;
        let name = buf.get_string(NAME_CAP)?;
        let size = narrow(buf.get_varint()?)?;
        let display_name = buf.get_string(NAME_CAP)?;
        let description = buf.get_string(MESSAGE_CAP)?;
        Ok(Self {
            id,
            name,
            size,
            display_name,
            description,
        })
    }
}

fn narrow(v: u64) -> Result<u32, CodecError> {
    u32::try_from(v).map_err(|_| CodecError::VarintOverflow)
}

/// Enumerate the registers of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegListRequest {
    /// Index into the device list.
    pub device: u64,
}

impl WireEncode for RegListRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.device)
    }
}

impl WireDecode for RegListRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            device: buf.get_varint()?,
        })
    }
}

/// Server reply to [`RegListRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegListReply {
    /// The device's register list.
    pub registers: Vec<RegisterInfo>,
}

impl WireEncode for RegListReply {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.registers.len() as u64)?;
        for register in &self.registers {
            register.encode(buf)?;
        }
        Ok(())
    }
}

impl WireDecode for RegListReply {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        let count = buf.get_varint()?;
        let mut registers = Vec::new();
        for _ in 0..count {
            registers.push(RegisterInfo::decode(buf)?);
        }
        Ok(Self { registers })
    }
}

/// Read a sequence of registers from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegReadRequest {
    /// Index into the device list.
    pub device: u64,
    /// Register IDs to read, in order.
    pub ids: Vec<u64>,
}

impl WireEncode for RegReadRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.device)?;
        buf.put_varint(self.ids.len() as u64)?;
        for id in &self.ids {
            buf.put_varint(*id)?;
        }
        Ok(())
    }
}

impl WireDecode for RegReadRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        let device = buf.get_varint()?;
        let count = buf.get_varint()?;
        let mut ids = Vec::new();
        for _ in 0..count {
            ids.push(buf.get_varint()?);
        }
        Ok(Self { device, ids })
    }
}

/// Server reply to [`RegReadRequest`]: one value per requested ID, in
/// request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegReadReply {
    /// The register values.
    pub values: Vec<u32>,
}

impl WireEncode for RegReadReply {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.values.len() as u64)?;
        for value in &self.values {
            buf.put_u32(*value)?;
        }
        Ok(())
    }
}

impl WireDecode for RegReadReply {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        let count = buf.get_varint()?;
        let mut values = Vec::new();
        for _ in 0..count {
            values.push(buf.get_u32()?);
        }
        Ok(Self { values })
    }
}

/// One register write: an ID and the value to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    /// Register ID.
    pub id: u64,
    /// Value to write.
    pub value: u32,
}

/// Write a sequence of registers on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegWriteRequest {
    /// Index into the device list.
    pub device: u64,
    /// The writes to apply, in order.
    pub writes: Vec<RegisterWrite>,
}

impl WireEncode for RegWriteRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.device)?;
        buf.put_varint(self.writes.len() as u64)?;
        for write in &self.writes {
            buf.put_varint(write.id)?;
            buf.put_u32(write.value)?;
        }
        Ok(())
    }
}

impl WireDecode for RegWriteRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        let device = buf.get_varint()?;
        let count = buf.get_varint()?;
        let mut writes = Vec::new();
        for _ in 0..count {
            writes.push(RegisterWrite {
                id: buf.get_varint()?,
                value: buf.get_u32()?,
            });
        }
        Ok(Self { device, writes })
    }
}
