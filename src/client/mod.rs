//! The client half of the protocol.
//!
//! Command handling is split in two: each command is encoded into the
//! request buffer and a pending-response record is queued for it. Outside a
//! batch the request is flushed immediately; inside a batch, nothing is sent
//! until [`Batch::end`]. After every flush the pending records are walked in
//! FIFO order against the response frame and then released, whatever the
//! outcome.

use std::collections::VecDeque;

use crate::protocol::{
    decode_error_message, decode_response_header, encode_command_header, finish_request,
    AccessSize, BatchPolicy, Buffer, ClientInfoRequest, CodecError, DeviceCloseRequest,
    DeviceDescriptor, DeviceOpenReply, DeviceOpenRequest, GetConfigReply, GetConfigRequest,
    GetDeviceCapabilitiesReply, GetDeviceCapabilitiesRequest, GetDevicesReply, InitReply,
    InitRequest, MemFlags, MemPollRequest, MemReadReply, MemReadRequest, MemWriteRequest,
    MessageType, ProtocolError, RegListReply, RegListRequest, RegReadReply, RegReadRequest,
    RegWriteRequest, RegisterInfo, RegisterWrite, SetConfigRequest, SetDevicesRequest,
    SystemDescriptionReply, WireDecode, WireEncode, DEFAULT_BUFFER_SIZE, PROTOCOL_VERSION,
    REQUEST_HEADER_RESERVE,
};
use crate::transport::Transport;

/// How to decode the reply body of a queued command. The set of completions
/// is closed, so a tagged variant avoids indirect dispatch on the response
/// walk.
#[derive(Debug, Clone, Copy)]
enum Completion {
    Discard,
    Init,
    GetDevices,
    SystemDescription,
    DeviceOpen,
    GetConfig,
    Capabilities,
    RegList,
    RegRead,
    Memory,
}

/// A pending-response record: the response type expected for a queued
/// command, and how to decode its body. Records are matched to responses in
/// queue order.
#[derive(Debug, Clone, Copy)]
struct PendingResponse {
    expected: MessageType,
    completion: Completion,
}

/// The decoded result of one command in a flushed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// The command's reply has no body.
    Done,
    /// Reply to INIT.
    ServerInfo(InitReply),
    /// Reply to GET_DEVICES.
    Devices(Vec<DeviceDescriptor>),
    /// Reply to GET_SYSTEM_DESCRIPTION.
    SystemDescription(SystemDescriptionReply),
    /// Reply to DEVICE_OPEN.
    DeviceInfo(String),
    /// Reply to GET_CONFIG.
    ConfigValue(String),
    /// Reply to GET_DEVICE_CAPABILITIES.
    Capabilities(GetDeviceCapabilitiesReply),
    /// Reply to REG_LIST.
    Registers(Vec<RegisterInfo>),
    /// Reply to REG_READ.
    RegisterValues(Vec<u32>),
    /// Reply to MEM_READ or MEM_POLL.
    Memory(Vec<u8>),
}

/// The result of flushing a batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Number of commands that completed successfully before the first
    /// failure.
    pub completed: usize,
    /// The decoded replies of the successful commands, in request order.
    pub replies: Vec<CommandReply>,
    /// The first failure, if any. The response walk stops here; later
    /// replies in the frame are not decoded.
    pub error: Option<ProtocolError>,
}

/// A protocol client.
///
/// Commands issued directly on the client are flushed immediately. To group
/// commands into one request frame with a shared error policy, use
/// [`Client::batch_begin`]; while the returned [`Batch`] is alive the
/// borrow checker keeps this session exclusively in batching mode.
pub struct Client<T: Transport> {
    transport: T,
    cmd: Buffer,
    rsp: Buffer,
    pending: VecDeque<PendingResponse>,
    batching: Option<BatchPolicy>,
}

impl<T: Transport> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pending", &self.pending.len())
            .field("batching", &self.batching)
            .finish()
    }
}

impl<T: Transport> Client<T> {
    /// Creates a client over `transport` with the default buffer sizes.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            cmd: Buffer::new(DEFAULT_BUFFER_SIZE),
            rsp: Buffer::new(DEFAULT_BUFFER_SIZE),
            pending: VecDeque::new(),
            batching: None,
        }
    }

    /// Connects the transport and initializes a session, returning the
    /// server's identity.
    pub fn connect_and_init(&mut self, client_id: &str) -> Result<InitReply, ProtocolError> {
        self.transport.connect()?;
        self.queue_init(client_id)?;
        match self.transact_single()? {
            CommandReply::ServerInfo(info) => {
                log::info!(
                    "session open: server {:?}, protocol {}, version {:#x}",
                    info.server_id,
                    info.protocol_version,
                    info.server_version
                );
                Ok(info)
            }
            _ => Err(mismatched_reply()),
        }
    }

    /// Terminates the session and disconnects the transport. The transport
    /// is disconnected even if the exchange fails.
    pub fn term(&mut self) -> Result<(), ProtocolError> {
        let res = match self.queue_discard(MessageType::Term, |_| Ok(())) {
            Ok(()) => self.transact_single().map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = self.transport.disconnect() {
            log::warn!("error disconnecting transport: {err}");
        }
        res
    }

    /// Sends a free-form message for the server to log.
    pub fn client_info(&mut self, message: &str) -> Result<(), ProtocolError> {
        self.queue_client_info(message)?;
        self.transact_single().map(|_| ())
    }

    /// Replaces the server's device list.
    pub fn set_devices(&mut self, devices: &[DeviceDescriptor]) -> Result<(), ProtocolError> {
        self.queue_set_devices(devices)?;
        self.transact_single().map(|_| ())
    }

    /// Fetches the server's device list.
    pub fn get_devices(&mut self) -> Result<Vec<DeviceDescriptor>, ProtocolError> {
        self.queue_get_devices()?;
        match self.transact_single()? {
            CommandReply::Devices(devices) => Ok(devices),
            _ => Err(mismatched_reply()),
        }
    }

    /// Fetches the system description blob.
    pub fn get_system_description(&mut self) -> Result<SystemDescriptionReply, ProtocolError> {
        self.queue_get_system_description()?;
        match self.transact_single()? {
            CommandReply::SystemDescription(description) => Ok(description),
            _ => Err(mismatched_reply()),
        }
    }

    /// Opens a device, returning its info string.
    pub fn device_open(&mut self, device: u64) -> Result<String, ProtocolError> {
        self.queue_device_open(device)?;
        match self.transact_single()? {
            CommandReply::DeviceInfo(info) => Ok(info),
            _ => Err(mismatched_reply()),
        }
    }

    /// Closes a device.
    pub fn device_close(&mut self, device: u64) -> Result<(), ProtocolError> {
        self.queue_device_close(device)?;
        self.transact_single().map(|_| ())
    }

    /// Sets a configuration item on a device.
    pub fn set_config(&mut self, device: u64, name: &str, value: &str) -> Result<(), ProtocolError> {
        self.queue_set_config(device, name, value)?;
        self.transact_single().map(|_| ())
    }

    /// Fetches a configuration item from a device.
    pub fn get_config(&mut self, device: u64, name: &str) -> Result<String, ProtocolError> {
        self.queue_get_config(device, name)?;
        match self.transact_single()? {
            CommandReply::ConfigValue(value) => Ok(value),
            _ => Err(mismatched_reply()),
        }
    }

    /// Queries the capability bits of a device.
    pub fn get_device_capabilities(
        &mut self,
        device: u64,
    ) -> Result<GetDeviceCapabilitiesReply, ProtocolError> {
        self.queue_get_device_capabilities(device)?;
        match self.transact_single()? {
            CommandReply::Capabilities(capabilities) => Ok(capabilities),
            _ => Err(mismatched_reply()),
        }
    }

    /// Enumerates the registers of an open device.
    pub fn reg_list(&mut self, device: u64) -> Result<Vec<RegisterInfo>, ProtocolError> {
        self.queue_reg_list(device)?;
        match self.transact_single()? {
            CommandReply::Registers(registers) => Ok(registers),
            _ => Err(mismatched_reply()),
        }
    }

    /// Reads registers, returning one value per ID in request order.
    pub fn reg_read(&mut self, device: u64, ids: &[u64]) -> Result<Vec<u32>, ProtocolError> {
        self.queue_reg_read(device, ids)?;
        match self.transact_single()? {
            CommandReply::RegisterValues(values) => Ok(values),
            _ => Err(mismatched_reply()),
        }
    }

    /// Writes registers in order.
    pub fn reg_write(
        &mut self,
        device: u64,
        writes: &[RegisterWrite],
    ) -> Result<(), ProtocolError> {
        self.queue_reg_write(device, writes)?;
        self.transact_single().map(|_| ())
    }

    /// Reads `size` bytes of device memory.
    pub fn mem_read(
        &mut self,
        device: u64,
        address: u64,
        size: u64,
        access_size: AccessSize,
        flags: MemFlags,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.queue_mem_read(device, address, size, access_size, flags)?;
        match self.transact_single()? {
            CommandReply::Memory(data) => Ok(data),
            _ => Err(mismatched_reply()),
        }
    }

    /// Writes `data` to device memory.
    pub fn mem_write(
        &mut self,
        device: u64,
        address: u64,
        access_size: AccessSize,
        flags: MemFlags,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        self.queue_mem_write(device, address, access_size, flags, data)?;
        self.transact_single().map(|_| ())
    }

    /// Polls device memory until `(read & mask) == (value & mask)` (or `!=`
    /// under [`MemFlags::POLL_MATCH_NE`]), returning the last data read.
    /// `mask` and `value` must be the same length.
    #[allow(clippy::too_many_arguments)]
    pub fn mem_poll(
        &mut self,
        device: u64,
        address: u64,
        access_size: AccessSize,
        flags: MemFlags,
        tries: u64,
        interval_us: u64,
        mask: &[u8],
        value: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        self.queue_mem_poll(device, address, access_size, flags, tries, interval_us, mask, value)?;
        match self.transact_single()? {
            CommandReply::Memory(data) => Ok(data),
            _ => Err(mismatched_reply()),
        }
    }

    /// Starts a batch. Commands issued on the returned [`Batch`] accumulate
    /// into a single request frame; nothing is sent until [`Batch::end`].
    ///
    /// With `abort_on_error` the server stops at the first failing command
    /// and answers `Cancelled` for the rest; otherwise every command is
    /// attempted independently.
    pub fn batch_begin(&mut self, abort_on_error: bool) -> Result<Batch<'_, T>, ProtocolError> {
        self.prepare_cmd()?;
        self.batching = Some(if abort_on_error {
            BatchPolicy::Abort
        } else {
            BatchPolicy::Continue
        });
        Ok(Batch { client: self })
    }

    /// Resets the request buffer and pending queue, reserving the frame
    /// header region. A no-op while accumulating a batch.
    fn prepare_cmd(&mut self) -> Result<(), CodecError> {
        if self.batching.is_none() {
            self.cmd.clear();
            self.cmd.put_data(&[0u8; REQUEST_HEADER_RESERVE])?;
            self.pending.clear();
        }
        Ok(())
    }

    /// Encodes one command into the request buffer and queues its pending
    /// response. A failed encode rolls the buffer back to its previous
    /// watermark.
    fn queue(
        &mut self,
        ty: MessageType,
        completion: Completion,
        encode: impl FnOnce(&mut Buffer) -> Result<(), CodecError>,
    ) -> Result<(), ProtocolError> {
        self.prepare_cmd()?;
        let mark = self.cmd.used();
        let res = encode_command_header(&mut self.cmd, ty).and_then(|()| encode(&mut self.cmd));
        if let Err(err) = res {
            self.cmd.truncate(mark);
            return Err(err.into());
        }
        self.pending.push_back(PendingResponse {
            expected: ty,
            completion,
        });
        Ok(())
    }

    fn queue_discard(
        &mut self,
        ty: MessageType,
        encode: impl FnOnce(&mut Buffer) -> Result<(), CodecError>,
    ) -> Result<(), ProtocolError> {
        self.queue(ty, Completion::Discard, encode)
    }

    fn queue_init(&mut self, client_id: &str) -> Result<(), ProtocolError> {
        self.queue(MessageType::Init, Completion::Init, |buf| {
            InitRequest {
                protocol_version: PROTOCOL_VERSION,
                client_id: client_id.to_owned(),
            }
            .encode(buf)
        })
    }

    fn queue_client_info(&mut self, message: &str) -> Result<(), ProtocolError> {
        self.queue_discard(MessageType::ClientInfo, |buf| {
            ClientInfoRequest {
                message: message.to_owned(),
            }
            .encode(buf)
        })
    }

    fn queue_set_devices(&mut self, devices: &[DeviceDescriptor]) -> Result<(), ProtocolError> {
        self.queue_discard(MessageType::SetDevices, |buf| {
            SetDevicesRequest {
                devices: devices.to_vec(),
            }
            .encode(buf)
        })
    }

    fn queue_get_devices(&mut self) -> Result<(), ProtocolError> {
        self.queue(MessageType::GetDevices, Completion::GetDevices, |_| Ok(()))
    }

    fn queue_get_system_description(&mut self) -> Result<(), ProtocolError> {
        self.queue(
            MessageType::GetSystemDescription,
            Completion::SystemDescription,
            |_| Ok(()),
        )
    }

    fn queue_device_open(&mut self, device: u64) -> Result<(), ProtocolError> {
        self.queue(MessageType::DeviceOpen, Completion::DeviceOpen, |buf| {
            DeviceOpenRequest { device }.encode(buf)
        })
    }

    fn queue_device_close(&mut self, device: u64) -> Result<(), ProtocolError> {
        self.queue_discard(MessageType::DeviceClose, |buf| {
            DeviceCloseRequest { device }.encode(buf)
        })
    }

    fn queue_set_config(
        &mut self,
        device: u64,
        name: &str,
        value: &str,
    ) -> Result<(), ProtocolError> {
        self.queue_discard(MessageType::SetConfig, |buf| {
            SetConfigRequest {
                device,
                name: name.to_owned(),
                value: value.to_owned(),
            }
            .encode(buf)
        })
    }

    fn queue_get_config(&mut self, device: u64, name: &str) -> Result<(), ProtocolError> {
        self.queue(MessageType::GetConfig, Completion::GetConfig, |buf| {
            GetConfigRequest {
                device,
                name: name.to_owned(),
            }
            .encode(buf)
        })
    }

    fn queue_get_device_capabilities(&mut self, device: u64) -> Result<(), ProtocolError> {
        self.queue(
            MessageType::GetDeviceCapabilities,
            Completion::Capabilities,
            |buf| GetDeviceCapabilitiesRequest { device }.encode(buf),
        )
    }

    fn queue_reg_list(&mut self, device: u64) -> Result<(), ProtocolError> {
        self.queue(MessageType::RegList, Completion::RegList, |buf| {
            RegListRequest { device }.encode(buf)
        })
    }

    fn queue_reg_read(&mut self, device: u64, ids: &[u64]) -> Result<(), ProtocolError> {
        self.queue(MessageType::RegRead, Completion::RegRead, |buf| {
            RegReadRequest {
                device,
                ids: ids.to_vec(),
            }
            .encode(buf)
        })
    }

    fn queue_reg_write(
        &mut self,
        device: u64,
        writes: &[RegisterWrite],
    ) -> Result<(), ProtocolError> {
        self.queue_discard(MessageType::RegWrite, |buf| {
            RegWriteRequest {
                device,
                writes: writes.to_vec(),
            }
            .encode(buf)
        })
    }

    fn queue_mem_read(
        &mut self,
        device: u64,
        address: u64,
        size: u64,
        access_size: AccessSize,
        flags: MemFlags,
    ) -> Result<(), ProtocolError> {
        self.queue(MessageType::MemRead, Completion::Memory, |buf| {
            MemReadRequest {
                device,
                address,
                size,
                access_size: access_size as u64,
                flags: flags.bits(),
            }
            .encode(buf)
        })
    }

    fn queue_mem_write(
        &mut self,
        device: u64,
        address: u64,
        access_size: AccessSize,
        flags: MemFlags,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        self.queue_discard(MessageType::MemWrite, |buf| {
            MemWriteRequest {
                device,
                address,
                size: data.len() as u64,
                access_size: access_size as u64,
                flags: flags.bits(),
            }
            .encode(buf)?;
            buf.put_data(data)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn queue_mem_poll(
        &mut self,
        device: u64,
        address: u64,
        access_size: AccessSize,
        flags: MemFlags,
        tries: u64,
        interval_us: u64,
        mask: &[u8],
        value: &[u8],
    ) -> Result<(), ProtocolError> {
        if mask.len() != value.len() {
            return Err(ProtocolError::InvalidArgument(
                "poll mask and value lengths differ".into(),
            ));
        }
        self.queue(MessageType::MemPoll, Completion::Memory, |buf| {
            MemPollRequest {
                device,
                address,
                size: mask.len() as u64,
                access_size: access_size as u64,
                flags: flags.bits(),
                tries,
                interval_us,
            }
            .encode(buf)?;
            buf.put_data(mask)?;
            buf.put_data(value)
        })
    }

    /// Flushes the request buffer and walks the response frame against the
    /// pending queue. The queue is always drained, whatever the outcome.
    fn transact(&mut self) -> Result<BatchOutcome, ProtocolError> {
        let pending = std::mem::take(&mut self.pending);
        let num_cmds = pending.len() as u64;
        let policy = self.batching.unwrap_or(BatchPolicy::None);

        let start = finish_request(&mut self.cmd, num_cmds, policy)?;
        log::debug!(
            "sending {} command(s), {} bytes",
            num_cmds,
            self.cmd.used() - start
        );
        self.transport.send(&self.cmd.bytes()[start..])?;

        let received = self.transport.receive(self.rsp.as_mut_slice())?;
        self.rsp.set_used(received);

        let reported = self.rsp.get_u32()? as usize;
        if reported > received {
            return Err(ProtocolError::Comms(format!(
                "incomplete response: received {received} bytes, expected {reported}"
            )));
        }

        let num_rsps = self.rsp.get_varint()?;
        if num_rsps != num_cmds {
            return Err(ProtocolError::Comms(format!(
                "incomplete response: received {num_rsps} responses, expected {num_cmds}"
            )));
        }

        let mut outcome = BatchOutcome {
            completed: 0,
            replies: Vec::with_capacity(pending.len()),
            error: None,
        };
        for record in &pending {
            match self.process_response(record) {
                Ok(reply) => {
                    outcome.replies.push(reply);
                    outcome.completed += 1;
                }
                Err(err) => {
                    // The walk stops at the first failure; the remaining
                    // records are released without decoding their replies.
                    outcome.error = Some(err);
                    break;
                }
            }
        }
        Ok(outcome)
    }

    /// Decodes one response at the response buffer's cursor against a
    /// pending record.
    fn process_response(&mut self, record: &PendingResponse) -> Result<CommandReply, ProtocolError> {
        let header = decode_response_header(&mut self.rsp)?;
        if header.message_type != record.expected as u64 {
            return Err(ProtocolError::Comms(format!(
                "unexpected response: {:#x}",
                header.message_type
            )));
        }
        if header.error_code != 0 {
            let message = decode_error_message(&mut self.rsp).unwrap_or_default();
            return Err(ProtocolError::server(header.error_code, message));
        }

        let reply = match record.completion {
            Completion::Discard => CommandReply::Done,
            Completion::Init => CommandReply::ServerInfo(InitReply::decode(&mut self.rsp)?),
            Completion::GetDevices => {
                CommandReply::Devices(GetDevicesReply::decode(&mut self.rsp)?.devices)
            }
            Completion::SystemDescription => {
                CommandReply::SystemDescription(SystemDescriptionReply::decode(&mut self.rsp)?)
            }
            Completion::DeviceOpen => {
                CommandReply::DeviceInfo(DeviceOpenReply::decode(&mut self.rsp)?.info)
            }
            Completion::GetConfig => {
                CommandReply::ConfigValue(GetConfigReply::decode(&mut self.rsp)?.value)
            }
            Completion::Capabilities => {
                CommandReply::Capabilities(GetDeviceCapabilitiesReply::decode(&mut self.rsp)?)
            }
            Completion::RegList => {
                CommandReply::Registers(RegListReply::decode(&mut self.rsp)?.registers)
            }
            Completion::RegRead => {
                CommandReply::RegisterValues(RegReadReply::decode(&mut self.rsp)?.values)
            }
            Completion::Memory => CommandReply::Memory(MemReadReply::decode(&mut self.rsp)?.data),
        };
        Ok(reply)
    }

    /// Flushes a single immediate command and extracts its reply.
    fn transact_single(&mut self) -> Result<CommandReply, ProtocolError> {
        let mut outcome = self.transact()?;
        if let Some(err) = outcome.error.take() {
            return Err(err);
        }
        outcome
            .replies
            .pop()
            .ok_or_else(|| ProtocolError::Comms("missing reply".into()))
    }
}

fn mismatched_reply() -> ProtocolError {
    ProtocolError::Comms("reply variant does not match command".into())
}

/// An in-progress batch. Commands accumulate in the client's request buffer
/// until [`Batch::end`] flushes them as one frame.
///
/// Dropping a batch without ending it discards the queued commands.
#[derive(Debug)]
pub struct Batch<'a, T: Transport> {
    client: &'a mut Client<T>,
}

impl<T: Transport> Batch<'_, T> {
    /// Queues a free-form message for the server to log.
    pub fn client_info(&mut self, message: &str) -> Result<(), ProtocolError> {
        self.client.queue_client_info(message)
    }

    /// Queues a device list replacement.
    pub fn set_devices(&mut self, devices: &[DeviceDescriptor]) -> Result<(), ProtocolError> {
        self.client.queue_set_devices(devices)
    }

    /// Queues a device list fetch.
    pub fn get_devices(&mut self) -> Result<(), ProtocolError> {
        self.client.queue_get_devices()
    }

    /// Queues a system description fetch.
    pub fn get_system_description(&mut self) -> Result<(), ProtocolError> {
        self.client.queue_get_system_description()
    }

    /// Queues a device open.
    pub fn device_open(&mut self, device: u64) -> Result<(), ProtocolError> {
        self.client.queue_device_open(device)
    }

    /// Queues a device close.
    pub fn device_close(&mut self, device: u64) -> Result<(), ProtocolError> {
        self.client.queue_device_close(device)
    }

    /// Queues a config item write.
    pub fn set_config(&mut self, device: u64, name: &str, value: &str) -> Result<(), ProtocolError> {
        self.client.queue_set_config(device, name, value)
    }

    /// Queues a config item fetch.
    pub fn get_config(&mut self, device: u64, name: &str) -> Result<(), ProtocolError> {
        self.client.queue_get_config(device, name)
    }

    /// Queues a capability query.
    pub fn get_device_capabilities(&mut self, device: u64) -> Result<(), ProtocolError> {
        self.client.queue_get_device_capabilities(device)
    }

    /// Queues a register enumeration.
    pub fn reg_list(&mut self, device: u64) -> Result<(), ProtocolError> {
        self.client.queue_reg_list(device)
    }

    /// Queues a register read.
    pub fn reg_read(&mut self, device: u64, ids: &[u64]) -> Result<(), ProtocolError> {
        self.client.queue_reg_read(device, ids)
    }

    /// Queues a register write.
    pub fn reg_write(&mut self, device: u64, writes: &[RegisterWrite]) -> Result<(), ProtocolError> {
        self.client.queue_reg_write(device, writes)
    }

    /// Queues a memory read.
    pub fn mem_read(
        &mut self,
        device: u64,
        address: u64,
        size: u64,
        access_size: AccessSize,
        flags: MemFlags,
    ) -> Result<(), ProtocolError> {
        self.client
            .queue_mem_read(device, address, size, access_size, flags)
    }

    /// Queues a memory write.
    pub fn mem_write(
        &mut self,
        device: u64,
        address: u64,
        access_size: AccessSize,
        flags: MemFlags,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        self.client
            .queue_mem_write(device, address, access_size, flags, data)
    }

    /// Queues a memory poll.
    #[allow(clippy::too_many_arguments)]
    pub fn mem_poll(
        &mut self,
        device: u64,
        address: u64,
        access_size: AccessSize,
        flags: MemFlags,
        tries: u64,
        interval_us: u64,
        mask: &[u8],
        value: &[u8],
    ) -> Result<(), ProtocolError> {
        self.client.queue_mem_poll(
            device,
            address,
            access_size,
            flags,
            tries,
            interval_us,
            mask,
            value,
        )
    }

    /// The number of commands queued so far.
    pub fn len(&self) -> usize {
        self.client.pending.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.client.pending.is_empty()
    }

    /// Flushes the batch as one request frame and walks the responses.
    ///
    /// Transport and framing failures are returned as `Err`; a failing
    /// command inside an otherwise-delivered batch lands in
    /// [`BatchOutcome::error`] with [`BatchOutcome::completed`] still
    /// counting the commands that succeeded before it.
    pub fn end(self) -> Result<BatchOutcome, ProtocolError> {
        if self.client.pending.is_empty() {
            return Ok(BatchOutcome::default());
        }
        self.client.transact()
    }
}

impl<T: Transport> Drop for Batch<'_, T> {
    fn drop(&mut self) {
        self.client.batching = None;
        self.client.pending.clear();
    }
}
