//! The pluggable backend interface and the session-owned device state.

use std::time::Duration;

use crate::protocol::{AccessSize, Capabilities, LogLevel, MemFlags, RegisterInfo, ResultCode};

/// One device known to the session.
///
/// The record is created by SET_DEVICES. Its register list is populated on
/// demand by the backend's [`Backend::register_list_build`] and released on
/// DEVICE_CLOSE or when the device list is replaced.
#[derive(Debug, Clone, Default)]
pub struct DeviceRecord {
    /// Device name, as supplied by the client.
    pub name: String,
    /// Opaque device type string the backend uses to pick an access method.
    pub device_type: String,
    /// The device's registers, valid while the device is open.
    pub registers: Vec<RegisterInfo>,
}

/// The system description blob advertised by GET_SYSTEM_DESCRIPTION.
#[derive(Debug, Clone)]
pub struct SystemDescription {
    /// Format tag of the blob.
    pub format: u64,
    /// The blob itself.
    pub data: Vec<u8>,
}

/// Protocol-visible server state, owned by the session and shared with the
/// backend on every call.
#[derive(Debug, Default)]
pub struct SessionState {
    /// The device table.
    pub devices: Vec<DeviceRecord>,
    /// The system description, if the backend provides one.
    pub system_description: Option<SystemDescription>,
}

impl SessionState {
    /// The device at `index`, if it exists.
    pub fn device(&self, index: usize) -> Option<&DeviceRecord> {
        self.devices.get(index)
    }

    /// The device at `index`, mutably.
    pub fn device_mut(&mut self, index: usize) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(index)
    }
}

/// Outcome of a backend operation. Failures carry the wire result code the
/// dispatcher serializes into the error response.
pub type BackendResult<T> = Result<T, ResultCode>;

/// Whether `data` matches `value` under `mask`, inverted by `not_equal`.
pub fn poll_match(data: &[u8], mask: &[u8], value: &[u8], not_equal: bool) -> bool {
    let equal = data
        .iter()
        .zip(mask.iter())
        .zip(value.iter())
        .all(|((d, m), v)| d & m == v & m);
    if not_equal {
        !equal
    } else {
        equal
    }
}

/// Device operations provided by a server implementation.
///
/// Lifecycle hooks default to no-ops; command-backed operations default to
/// [`ResultCode::Unsupported`], which the dispatcher reports to the client
/// unchanged. Implementations override exactly the capabilities their
/// hardware has and advertise them via
/// [`Backend::get_device_capabilities`].
pub trait Backend {
    /// Called when a session is initialized.
    fn init(&mut self, _state: &mut SessionState) -> BackendResult<()> {
        Ok(())
    }

    /// Called when a session terminates or the connection drops.
    fn term(&mut self, _state: &mut SessionState) -> BackendResult<()> {
        Ok(())
    }

    /// Called before `count` devices are added by a SET_DEVICES command.
    fn init_devices(&mut self, _state: &mut SessionState, _count: usize) -> BackendResult<()> {
        Ok(())
    }

    /// Called before the device list is cleared or replaced.
    fn clear_devices(&mut self, _state: &mut SessionState) -> BackendResult<()> {
        Ok(())
    }

    /// Called as each device is added; the record is already in
    /// `state.devices[index]`.
    fn device_add(
        &mut self,
        _state: &mut SessionState,
        _index: usize,
        _device_type: &str,
    ) -> BackendResult<()> {
        Ok(())
    }

    /// Opens a device.
    fn device_open(&mut self, _state: &mut SessionState, _index: usize) -> BackendResult<()> {
        Ok(())
    }

    /// Closes a device. The dispatcher releases the register list afterwards.
    fn device_close(&mut self, _state: &mut SessionState, _index: usize) -> BackendResult<()> {
        Ok(())
    }

    /// Sets a free-form configuration item.
    fn set_config(
        &mut self,
        _state: &mut SessionState,
        _index: usize,
        _name: &str,
        _value: &str,
    ) -> BackendResult<()> {
        Err(ResultCode::Unsupported)
    }

    /// Fetches a configuration item.
    fn get_config(
        &mut self,
        _state: &mut SessionState,
        _index: usize,
        _name: &str,
    ) -> BackendResult<String> {
        Err(ResultCode::Unsupported)
    }

    /// Queries the capability bits of a device.
    fn get_device_capabilities(
        &mut self,
        _state: &mut SessionState,
        _index: usize,
    ) -> BackendResult<(Capabilities, u64)> {
        Err(ResultCode::Unsupported)
    }

    /// Populates `state.devices[index].registers`.
    fn register_list_build(
        &mut self,
        _state: &mut SessionState,
        _index: usize,
    ) -> BackendResult<()> {
        Err(ResultCode::Unsupported)
    }

    /// Reads one register.
    fn register_read(
        &mut self,
        _state: &mut SessionState,
        _index: usize,
        _register: u64,
    ) -> BackendResult<u32> {
        Err(ResultCode::Unsupported)
    }

    /// Writes one register.
    fn register_write(
        &mut self,
        _state: &mut SessionState,
        _index: usize,
        _register: u64,
        _value: u32,
    ) -> BackendResult<()> {
        Err(ResultCode::Unsupported)
    }

    /// Reads `out.len()` bytes of device memory starting at `address`.
    fn mem_read(
        &mut self,
        _state: &mut SessionState,
        _index: usize,
        _address: u64,
        _access_size: AccessSize,
        _flags: MemFlags,
        _out: &mut [u8],
    ) -> BackendResult<()> {
        Err(ResultCode::Unsupported)
    }

    /// Writes `data` to device memory starting at `address`.
    fn mem_write(
        &mut self,
        _state: &mut SessionState,
        _index: usize,
        _address: u64,
        _access_size: AccessSize,
        _flags: MemFlags,
        _data: &[u8],
    ) -> BackendResult<()> {
        Err(ResultCode::Unsupported)
    }

    /// Polls device memory until the masked comparison matches, leaving the
    /// last data read in `out`.
    ///
    /// The default retries [`Backend::mem_read`] up to `tries` times with
    /// `interval_us` microseconds between attempts, so it blocks the session
    /// for up to `tries * interval_us`. Under
    /// [`MemFlags::POLL_CHECK_LAST`] no read is issued and the comparison
    /// runs against the bytes already in `out`.
    #[allow(clippy::too_many_arguments)]
    fn mem_poll(
        &mut self,
        state: &mut SessionState,
        index: usize,
        address: u64,
        access_size: AccessSize,
        flags: MemFlags,
        tries: u64,
        interval_us: u64,
        mask: &[u8],
        value: &[u8],
        out: &mut [u8],
    ) -> BackendResult<()> {
        let not_equal = flags.contains(MemFlags::POLL_MATCH_NE);
        if flags.contains(MemFlags::POLL_CHECK_LAST) {
            if poll_match(out, mask, value, not_equal) {
                return Ok(());
            }
            return Err(ResultCode::MemPollNoMatch);
        }

        for _ in 0..tries {
            self.mem_read(state, index, address, access_size, flags, out)?;
            if poll_match(out, mask, value, not_equal) {
                return Ok(());
            }
            if interval_us > 0 {
                std::thread::sleep(Duration::from_micros(interval_us));
            }
        }
        Err(ResultCode::MemPollNoMatch)
    }

    /// Records a server log message. The default forwards to the `log`
    /// crate.
    fn log(&mut self, level: LogLevel, message: &str) {
        log::log!(log::Level::from(level), "{message}");
    }
}
