//! Session-level command bodies: INIT, CLIENT_INFO, and device enumeration.

use crate::protocol::buffer::{Buffer, CodecError};

use super::{WireDecode, WireEncode, NAME_CAP};

/// Establish a session and exchange identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRequest {
    /// The protocol version the client speaks.
    pub protocol_version: u64,
    /// A free-form client identity string.
    pub client_id: String,
}

impl WireEncode for InitRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.protocol_version)?;
        buf.put_string(&self.client_id)
    }
}

impl WireDecode for InitRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            protocol_version: buf.get_varint()?,
            client_id: buf.get_string(NAME_CAP)?,
        })
    }
}

/// Server reply to [`InitRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReply {
    /// The protocol version the server speaks.
    pub protocol_version: u64,
    /// The server identity string.
    pub server_id: String,
    /// The server's implementation version.
    pub server_version: u64,
}

impl WireEncode for InitReply {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.protocol_version)?;
        buf.put_string(&self.server_id)?;
        buf.put_varint(self.server_version)
    }
}

impl WireDecode for InitReply {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            protocol_version: buf.get_varint()?,
            server_id: buf.get_string(NAME_CAP)?,
            server_version: buf.get_varint()?,
        })
    }
}

/// Free-form information from the client, recorded in the server log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfoRequest {
    /// The message to log.
    pub message: String,
}

impl WireEncode for ClientInfoRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_string(&self.message)
    }
}

impl WireDecode for ClientInfoRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            message: buf.get_string(super::MESSAGE_CAP)?,
        })
    }
}

/// One entry in the device list: a name and an opaque type string the
/// backend uses to pick an access method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Device name.
    pub name: String,
    /// Device type.
    pub device_type: String,
}

impl WireEncode for DeviceDescriptor {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_string(&self.name)?;
        buf.put_string(&self.device_type)
    }
}

impl WireDecode for DeviceDescriptor {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        Ok(Self {
            name: buf.get_string(NAME_CAP)?,
            device_type: buf.get_string(NAME_CAP)?,
        })
    }
}

/// Replace the server's device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDevicesRequest {
    /// The new device list.
    pub devices: Vec<DeviceDescriptor>,
}

impl WireEncode for SetDevicesRequest {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.devices.len() as u64)?;
        for device in &self.devices {
            device.encode(buf)?;
        }
        Ok(())
    }
}

impl WireDecode for SetDevicesRequest {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        let count = buf.get_varint()?;
        let mut devices = Vec::new();
        for _ in 0..count {
            devices.push(DeviceDescriptor::decode(buf)?);
        }
        Ok(Self { devices })
    }
}

/// Server reply to a GET_DEVICES request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDevicesReply {
    /// The server's current device list.
    pub devices: Vec<DeviceDescriptor>,
}

impl WireEncode for GetDevicesReply {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.devices.len() as u64)?;
        for device in &self.devices {
            device.encode(buf)?;
        }
        Ok(())
    }
}

impl WireDecode for GetDevicesReply {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        let count = buf.get_varint()?;
        let mut devices = Vec::new();
        for _ in 0..count {
            devices.push(DeviceDescriptor::decode(buf)?);
        }
        Ok(Self { devices })
    }
}

/// Server reply to a GET_SYSTEM_DESCRIPTION request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemDescriptionReply {
    /// Format tag of the description blob.
    pub format: u64,
    /// The description bytes.
    pub data: Vec<u8>,
}

impl WireEncode for SystemDescriptionReply {
    fn encode(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.put_varint(self.format)?;
        buf.put_varint(self.data.len() as u64)?;
        buf.put_data(&self.data)
    }
}

impl WireDecode for SystemDescriptionReply {
    fn decode(buf: &mut Buffer) -> Result<Self, CodecError> {
        let format = buf.get_varint()?;
        let size = buf.get_varint()? as usize;
        let data = buf.get_direct(size)?.to_vec();
        Ok(Self { format, data })
    }
}
