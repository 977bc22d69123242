//! End-to-end tests driving a [`Client`] against a [`Session`] over an
//! in-memory transport, with a RAM-backed device implementation.

use std::collections::HashMap;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use probewire::client::{Client, CommandReply};
use probewire::protocol::{
    AccessSize, Buffer, Capabilities, DeviceDescriptor, MemFlags, ProtocolError, RegisterInfo,
    RegisterWrite, ResultCode, DEFAULT_BUFFER_SIZE, PROTOCOL_VERSION,
};
use probewire::server::{
    Backend, BackendResult, Session, SessionState, SystemDescription, SERVER_ID, SERVER_VERSION,
};
use probewire::transport::Transport;

const MEM_SIZE: usize = 0x1000;

/// A backend exposing RAM-backed devices. Devices whose type is "ram"
/// support registers, memory, and polling; any other type supports nothing.
#[derive(Default)]
struct RamBackend {
    devices: Vec<RamDevice>,
}

#[derive(Default)]
struct RamDevice {
    capable: bool,
    mem: Vec<u8>,
    regs: HashMap<u64, u32>,
    config: HashMap<String, String>,
}

impl Backend for RamBackend {
    fn init(&mut self, state: &mut SessionState) -> BackendResult<()> {
        state.system_description = Some(SystemDescription {
            format: 0,
            data: b"<sdf/>".to_vec(),
        });
        Ok(())
    }

    fn clear_devices(&mut self, _state: &mut SessionState) -> BackendResult<()> {
        self.devices.clear();
        Ok(())
    }

    fn device_add(
        &mut self,
        _state: &mut SessionState,
        _index: usize,
        device_type: &str,
    ) -> BackendResult<()> {
        self.devices.push(RamDevice {
            capable: device_type == "ram",
            mem: vec![0; MEM_SIZE],
            regs: HashMap::new(),
            config: HashMap::new(),
        });
        Ok(())
    }

    fn set_config(
        &mut self,
        _state: &mut SessionState,
        index: usize,
        name: &str,
        value: &str,
    ) -> BackendResult<()> {
        self.devices[index]
            .config
            .insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    fn get_config(
        &mut self,
        _state: &mut SessionState,
        index: usize,
        name: &str,
    ) -> BackendResult<String> {
        self.devices[index]
            .config
            .get(name)
            .cloned()
            .ok_or(ResultCode::BadArgs)
    }

    fn get_device_capabilities(
        &mut self,
        _state: &mut SessionState,
        index: usize,
    ) -> BackendResult<(Capabilities, u64)> {
        if self.devices[index].capable {
            Ok((Capabilities::REG | Capabilities::MEM | Capabilities::MEM_POLL, 0))
        } else {
            Ok((Capabilities::empty(), 0))
        }
    }

    fn register_list_build(&mut self, state: &mut SessionState, index: usize) -> BackendResult<()> {
        if !self.devices[index].capable {
            return Err(ResultCode::Unsupported);
        }
        let device = state.device_mut(index).ok_or(ResultCode::InvalidDevice)?;
        if device.registers.is_empty() {
            device.registers = vec![
                RegisterInfo {
                    id: 1,
                    name: "CTRL".into(),
                    size: 1,
                    display_name: "Control".into(),
                    description: "Control register".into(),
                },
                RegisterInfo {
                    id: 6,
                    name: "DATA".into(),
                    size: 1,
                    display_name: "Data".into(),
                    description: "Data register".into(),
                },
            ];
        }
        Ok(())
    }

    fn register_read(
        &mut self,
        _state: &mut SessionState,
        index: usize,
        register: u64,
    ) -> BackendResult<u32> {
        let device = &self.devices[index];
        if !device.capable {
            return Err(ResultCode::Unsupported);
        }
        Ok(device.regs.get(&register).copied().unwrap_or(register as u32))
    }

    fn register_write(
        &mut self,
        _state: &mut SessionState,
        index: usize,
        register: u64,
        value: u32,
    ) -> BackendResult<()> {
        let device = &mut self.devices[index];
        if !device.capable {
            return Err(ResultCode::Unsupported);
        }
        device.regs.insert(register, value);
        Ok(())
    }

    fn mem_read(
        &mut self,
        _state: &mut SessionState,
        index: usize,
        address: u64,
        _access_size: AccessSize,
        _flags: MemFlags,
        out: &mut [u8],
    ) -> BackendResult<()> {
        let device = &self.devices[index];
        if !device.capable {
            return Err(ResultCode::Unsupported);
        }
        let start = address as usize;
        let end = start.checked_add(out.len()).ok_or(ResultCode::MemInvalidAddress)?;
        if end > device.mem.len() {
            return Err(ResultCode::MemInvalidAddress);
        }
        out.copy_from_slice(&device.mem[start..end]);
        Ok(())
    }

    fn mem_write(
        &mut self,
        _state: &mut SessionState,
        index: usize,
        address: u64,
        _access_size: AccessSize,
        _flags: MemFlags,
        data: &[u8],
    ) -> BackendResult<()> {
        let device = &mut self.devices[index];
        if !device.capable {
            return Err(ResultCode::Unsupported);
        }
        let start = address as usize;
        let end = start.checked_add(data.len()).ok_or(ResultCode::MemInvalidAddress)?;
        if end > device.mem.len() {
            return Err(ResultCode::MemInvalidAddress);
        }
        device.mem[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// A transport that hands each request frame straight to an in-process
/// session and keeps the response for the next receive.
struct DirectTransport {
    session: Session<RamBackend>,
    response: Vec<u8>,
}

impl DirectTransport {
    fn new(backend: RamBackend) -> Self {
        Self {
            session: Session::new(backend),
            response: Vec::new(),
        }
    }
}

impl Transport for DirectTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        let mut cmd = Buffer::new(DEFAULT_BUFFER_SIZE);
        cmd.as_mut_slice()[..frame.len()].copy_from_slice(frame);
        cmd.set_used(frame.len());

        let mut rsp = Buffer::new(DEFAULT_BUFFER_SIZE);
        self.session.process_frame(&mut cmd, &mut rsp)?;
        self.response = rsp.bytes().to_vec();
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let frame = std::mem::take(&mut self.response);
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }
}

fn connected_client() -> Client<DirectTransport> {
    let mut client = Client::new(DirectTransport::new(RamBackend::default()));
    let info = client.connect_and_init("Test client").unwrap();
    assert_eq!(info.protocol_version, PROTOCOL_VERSION);
    client
}

fn ram_devices(client: &mut Client<DirectTransport>) {
    client
        .set_devices(&[
            DeviceDescriptor {
                name: "mem0".into(),
                device_type: "ram".into(),
            },
            DeviceDescriptor {
                name: "aux".into(),
                device_type: "fixture".into(),
            },
            DeviceDescriptor {
                name: "mem1".into(),
                device_type: "ram".into(),
            },
        ])
        .unwrap();
}

#[test_log::test]
fn init_roundtrip_reports_identity() {
    let mut client = Client::new(DirectTransport::new(RamBackend::default()));
    let info = client.connect_and_init("Test client").unwrap();
    assert_eq!(info.protocol_version, 1);
    assert_eq!(info.server_id, SERVER_ID);
    assert_eq!(info.server_version, SERVER_VERSION);
}

#[test]
fn device_enumeration_roundtrip() {
    let mut client = connected_client();
    ram_devices(&mut client);

    let devices = client.get_devices().unwrap();
    assert_eq!(
        devices,
        vec![
            DeviceDescriptor {
                name: "mem0".into(),
                device_type: "ram".into()
            },
            DeviceDescriptor {
                name: "aux".into(),
                device_type: "fixture".into()
            },
            DeviceDescriptor {
                name: "mem1".into(),
                device_type: "ram".into()
            },
        ]
    );
}

#[test]
fn system_description_roundtrip() {
    let mut client = connected_client();
    let description = client.get_system_description().unwrap();
    assert_eq!(description.format, 0);
    assert_eq!(description.data, b"<sdf/>");
}

#[test]
fn device_open_close() {
    let mut client = connected_client();
    ram_devices(&mut client);

    let info = client.device_open(0).unwrap();
    assert_eq!(info, "Device 0 info");
    client.device_close(0).unwrap();

    let err = client.device_open(9).unwrap_err();
    assert_eq!(err.server_code(), Some(ResultCode::InvalidDevice));
}

#[test]
fn config_roundtrip() -> anyhow::Result<()> {
    let mut client = connected_client();
    ram_devices(&mut client);

    client.set_config(0, "ADDRESS", "0x2000")?;
    assert_eq!(client.get_config(0, "ADDRESS")?, "0x2000");

    let err = client.get_config(0, "MISSING").unwrap_err();
    assert_eq!(err.server_code(), Some(ResultCode::BadArgs));
    Ok(())
}

#[test]
fn capabilities_by_device_type() {
    let mut client = connected_client();
    ram_devices(&mut client);

    let ram = client.get_device_capabilities(0).unwrap();
    assert!(ram.capabilities.contains(Capabilities::REG));
    assert!(ram.capabilities.contains(Capabilities::MEM));
    assert!(ram.capabilities.contains(Capabilities::MEM_POLL));

    let fixture = client.get_device_capabilities(1).unwrap();
    assert_eq!(fixture.capabilities, Capabilities::empty());
}

#[test]
fn register_list_and_access() {
    let mut client = connected_client();
    ram_devices(&mut client);
    client.device_open(0).unwrap();

    let registers = client.reg_list(0).unwrap();
    assert_eq!(registers.len(), 2);
    assert_eq!(registers[0].name, "CTRL");
    assert_eq!(registers[1].id, 6);

    client
        .reg_write(
            0,
            &[RegisterWrite {
                id: 6,
                value: 0xdead_beef,
            }],
        )
        .unwrap();
    assert_eq!(client.reg_read(0, &[6, 1]).unwrap(), vec![0xdead_beef, 1]);
}

#[test]
fn mem_read_returns_exact_payload() {
    let mut client = connected_client();
    ram_devices(&mut client);
    client.device_open(0).unwrap();

    client
        .mem_write(0, 0, AccessSize::Default, MemFlags::empty(), b"Hello world\0")
        .unwrap();

    let data = client
        .mem_read(0, 0, 12, AccessSize::Default, MemFlags::empty())
        .unwrap();
    assert_eq!(data, b"Hello world\0");
}

#[test]
fn mem_read_zero_bytes() {
    let mut client = connected_client();
    ram_devices(&mut client);

    let data = client
        .mem_read(0, 0, 0, AccessSize::Default, MemFlags::empty())
        .unwrap();
    assert!(data.is_empty());
}

#[test]
fn mem_access_out_of_range() {
    let mut client = connected_client();
    ram_devices(&mut client);

    let err = client
        .mem_read(0, MEM_SIZE as u64, 16, AccessSize::Default, MemFlags::empty())
        .unwrap_err();
    assert_eq!(err.server_code(), Some(ResultCode::MemInvalidAddress));
}

#[test]
fn mem_poll_matches_after_write() {
    let mut client = connected_client();
    ram_devices(&mut client);

    client
        .mem_write(0, 0x100, AccessSize::Bits32, MemFlags::empty(), &[0x21, 0x43, 0, 0])
        .unwrap();

    let data = client
        .mem_poll(
            0,
            0x100,
            AccessSize::Bits32,
            MemFlags::empty(),
            3,
            0,
            &[0xff, 0xff, 0, 0],
            &[0x21, 0x43, 0, 0],
        )
        .unwrap();
    assert_eq!(data[..2], [0x21, 0x43]);
}

#[test]
fn mem_poll_no_match_reports_code() {
    let mut client = connected_client();
    ram_devices(&mut client);

    let err = client
        .mem_poll(
            0,
            0x100,
            AccessSize::Bits32,
            MemFlags::empty(),
            2,
            0,
            &[0xff],
            &[0x77],
        )
        .unwrap_err();
    assert_eq!(err.server_code(), Some(ResultCode::MemPollNoMatch));
}

#[test]
fn mem_poll_not_equal_inverts_match() {
    let mut client = connected_client();
    ram_devices(&mut client);

    // memory starts zeroed, so NE against zero fails but NE against 0x77
    // succeeds immediately
    let err = client
        .mem_poll(
            0,
            0,
            AccessSize::Default,
            MemFlags::POLL_MATCH_NE,
            2,
            0,
            &[0xff],
            &[0x00],
        )
        .unwrap_err();
    assert_eq!(err.server_code(), Some(ResultCode::MemPollNoMatch));

    client
        .mem_poll(
            0,
            0,
            AccessSize::Default,
            MemFlags::POLL_MATCH_NE,
            2,
            0,
            &[0xff],
            &[0x77],
        )
        .unwrap();
}

#[test]
fn unsupported_device_rejects_memory_commands() {
    let mut client = connected_client();
    ram_devices(&mut client);

    let err = client
        .mem_read(1, 0, 4, AccessSize::Default, MemFlags::empty())
        .unwrap_err();
    assert_eq!(err.server_code(), Some(ResultCode::Unsupported));
}

#[test_log::test]
fn batch_continue_attempts_every_command() {
    let mut client = connected_client();
    ram_devices(&mut client);

    // reg reads against devices [0, 1, 2]; device 1 has no register support
    let mut batch = client.batch_begin(false).unwrap();
    batch.reg_read(0, &[1]).unwrap();
    batch.reg_read(1, &[1]).unwrap();
    batch.reg_read(2, &[6]).unwrap();
    assert_eq!(batch.len(), 3);

    let outcome = batch.end().unwrap();
    assert_eq!(outcome.completed, 1);
    assert_eq!(outcome.replies, vec![CommandReply::RegisterValues(vec![1])]);

    // the walk stopped at the failing response
    let err = outcome.error.unwrap();
    assert_eq!(err.server_code(), Some(ResultCode::Unsupported));
}

#[test]
fn batch_abort_cancels_the_tail() {
    let mut client = connected_client();
    ram_devices(&mut client);

    let mut batch = client.batch_begin(true).unwrap();
    batch.reg_read(0, &[1]).unwrap();
    batch.reg_read(1, &[1]).unwrap();
    batch.reg_read(2, &[6]).unwrap();

    let outcome = batch.end().unwrap();
    assert_eq!(outcome.completed, 1);
    let err = outcome.error.unwrap();
    assert_eq!(err.server_code(), Some(ResultCode::Unsupported));
}

#[test]
fn batch_of_writes_reports_all_replies() {
    let mut client = connected_client();
    ram_devices(&mut client);

    let mut batch = client.batch_begin(false).unwrap();
    batch
        .mem_write(0, 0, AccessSize::Default, MemFlags::empty(), &[1, 2, 3, 4])
        .unwrap();
    batch
        .mem_write(2, 8, AccessSize::Default, MemFlags::empty(), &[5, 6])
        .unwrap();
    batch.reg_write(0, &[RegisterWrite { id: 1, value: 9 }]).unwrap();

    let outcome = batch.end().unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(outcome.completed, 3);
    assert_eq!(outcome.replies.len(), 3);

    assert_eq!(
        client
            .mem_read(0, 0, 4, AccessSize::Default, MemFlags::empty())
            .unwrap(),
        vec![1, 2, 3, 4]
    );
    assert_eq!(
        client
            .mem_read(2, 8, 2, AccessSize::Default, MemFlags::empty())
            .unwrap(),
        vec![5, 6]
    );
}

#[test]
fn empty_batch_flushes_nothing() {
    let mut client = connected_client();
    let batch = client.batch_begin(true).unwrap();
    let outcome = batch.end().unwrap();
    assert_eq!(outcome.completed, 0);
    assert!(outcome.replies.is_empty());
    assert!(outcome.error.is_none());
}

#[test]
fn dropped_batch_discards_queued_commands() {
    let mut client = connected_client();
    ram_devices(&mut client);

    {
        let mut batch = client.batch_begin(false).unwrap();
        batch
            .mem_write(0, 0, AccessSize::Default, MemFlags::empty(), &[0xff; 4])
            .unwrap();
        // dropped without end()
    }

    // nothing was sent, memory is untouched
    assert_eq!(
        client
            .mem_read(0, 0, 4, AccessSize::Default, MemFlags::empty())
            .unwrap(),
        vec![0, 0, 0, 0]
    );
}

#[test]
fn client_info_and_term() {
    let mut client = connected_client();
    client.client_info("test rig attached").unwrap();
    client.term().unwrap();
}

#[test]
fn poll_argument_mismatch_fails_locally() {
    let mut client = connected_client();
    ram_devices(&mut client);

    let err = client
        .mem_poll(
            0,
            0,
            AccessSize::Default,
            MemFlags::empty(),
            1,
            0,
            &[0xff, 0xff],
            &[0x00],
        )
        .unwrap_err();
    assert_matches!(err, ProtocolError::InvalidArgument(_));
}

/// A transport that answers every request with a canned frame, for
/// exercising the client's response validation.
struct CannedTransport {
    response: Vec<u8>,
}

impl Transport for CannedTransport {
    fn send(&mut self, _frame: &[u8]) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        buf[..self.response.len()].copy_from_slice(&self.response);
        Ok(self.response.len())
    }
}

fn canned_frame(build: impl FnOnce(&mut Buffer)) -> Vec<u8> {
    let mut buf = Buffer::new(DEFAULT_BUFFER_SIZE);
    buf.put_u32(0).unwrap();
    build(&mut buf);
    buf.patch_u32(0, buf.used() as u32).unwrap();
    buf.bytes().to_vec()
}

#[test]
fn response_count_mismatch_is_comms_error() {
    let response = canned_frame(|buf| {
        buf.put_varint(2).unwrap(); // two responses to a single command
    });
    let mut client = Client::new(CannedTransport { response });

    let err = client.get_devices().unwrap_err();
    assert_matches!(err, ProtocolError::Comms(_));
}

#[test]
fn oversized_length_prefix_is_comms_error() {
    let mut response = canned_frame(|buf| {
        buf.put_varint(1).unwrap();
    });
    // claim more bytes than were delivered
    response[0] = 0xff;
    let mut client = Client::new(CannedTransport { response });

    let err = client.get_devices().unwrap_err();
    assert_matches!(err, ProtocolError::Comms(_));
}

#[test]
fn unexpected_response_type_is_comms_error() {
    let response = canned_frame(|buf| {
        buf.put_varint(1).unwrap();
        buf.put_varint(0x0012).unwrap(); // GET_SYSTEM_DESCRIPTION, not GET_DEVICES
        buf.put_varint(0).unwrap();
        buf.put_varint(0).unwrap();
    });
    let mut client = Client::new(CannedTransport { response });

    let err = client.get_devices().unwrap_err();
    assert_matches!(err, ProtocolError::Comms(_));
}

#[test]
fn error_response_surfaces_server_message() {
    let response = canned_frame(|buf| {
        buf.put_varint(1).unwrap();
        buf.put_varint(0x0011).unwrap();
        buf.put_varint(ResultCode::NotPermitted.value()).unwrap();
        buf.put_string("Error 39: no enumeration for you").unwrap();
    });
    let mut client = Client::new(CannedTransport { response });

    let err = client.get_devices().unwrap_err();
    assert_matches!(
        err,
        ProtocolError::Server { code, ref message }
            if code == ResultCode::NotPermitted.value() && message.contains("no enumeration")
    );
}
