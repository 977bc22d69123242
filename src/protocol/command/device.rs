//! Device lifecycle and configuration command bodies.

use bitflags::bitflags;

use crate::protocol::buffer::{Buffer, CodecError};

use super::{WireDecode, WireEncode, NAME_CAP};

bitflags! {
    /// Per-device capability bits advertised by GET_DEVICE_CAPABILITIES.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u64 {
        /// Register commands supported.
        const REG = 0x1;
        /// Memory commands supported.
        const MEM = 0x2;
        /// Memory poll command supported.
        const MEM_POLL = 0x200;
    }
}

/// Open a device, making its registers and memory accessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOpenRequest {
    /// Index into the device list.
    pub device: u64,
}

impl WireEncode for DeviceOpenRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.device)
    }
}

impl WireDecode for DeviceOpenRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            device: buf.get_varint()?,
        })
    }
}

/// Server reply to [`DeviceOpenRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOpenReply {
    /// A human-readable description of the opened device.
    pub info: String,
}

impl WireEncode for DeviceOpenReply {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_string(&self.info)
    }
}

impl WireDecode for DeviceOpenReply {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            info: buf.get_string(NAME_CAP)?,
        })
    }
}

/// Close a device, releasing its register list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCloseRequest {
    /// Index into the device list.
    pub device: u64,
}

impl WireEncode for DeviceCloseRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.device)
    }
}

impl WireDecode for DeviceCloseRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            device: buf.get_varint()?,
        })
    }
}

/// Set a free-form configuration item on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetConfigRequest {
    /// Index into the device list.
    pub device: u64,
    /// Config item name.
    pub name: String,
    /// Config item value.
    pub value: String,
}

impl WireEncode for SetConfigRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.device)?;
        buf.put_string(&self.name)?;
        buf.put_string(&self.value)
    }
}

impl WireDecode for SetConfigRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            device: buf.get_varint()?,
            name: buf.get_string(NAME_CAP)?,
            value: buf.get_string(NAME_CAP)?,
        })
    }
}

/// Fetch a configuration item from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetConfigRequest {
    /// Index into the device list.
    pub device: u64,
    /// Config item name.
    pub name: String,
}

impl WireEncode for GetConfigRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.device)?;
        buf.put_string(&self.name)
    }
}

impl WireDecode for GetConfigRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            device: buf.get_varint()?,
            name: buf.get_string(NAME_CAP)?,
        })
    }
}

/// Server reply to [`GetConfigRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetConfigReply {
    /// The config item value.
    pub value: String,
}

impl WireEncode for GetConfigReply {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_string(&self.value)
    }
}

impl WireDecode for GetConfigReply {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            value: buf.get_string(NAME_CAP)?,
        })
    }
}

/// Query the capability bits of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetDeviceCapabilitiesRequest {
    /// Index into the device list.
    pub device: u64,
}

impl WireEncode for GetDeviceCapabilitiesRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.device)
    }
}

impl WireDecode for GetDeviceCapabilitiesRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            device: buf.get_varint()?,
        })
    }
}

/// Server reply to [`GetDeviceCapabilitiesRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetDeviceCapabilitiesReply {
    /// Capability bits. Unknown bits are preserved.
    pub capabilities: Capabilities,
    /// Capability-specific data.
    pub capability_data: u64,
}

impl WireEncode for GetDeviceCapabilitiesReply {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.capabilities.bits())?;
        buf.put_varint(self.capability_data)
    }
}

impl WireDecode for GetDeviceCapabilitiesReply {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            capabilities: Capabilities::from_bits_retain(buf.get_varint()?),
            capability_data: buf.get_varint()?,
        })
    }
}
