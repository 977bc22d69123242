//! The server half of the protocol: frame parsing, command dispatch, and
//! response encoding.
//!
//! A [`Session`] processes one request frame at a time. Each sub-command
//! dispatches to a handler that decodes its body, validates the target
//! device, calls into the [`Backend`], and appends either a success reply or
//! an error response. Under the abort batch policy the first failure
//! preempts the rest of the frame, and every skipped slot answers
//! `Cancelled` so the response count always equals the request count.

mod backend;

pub use backend::{
    poll_match, Backend, BackendResult, DeviceRecord, SessionState, SystemDescription,
};

use num_traits::FromPrimitive as _;

use crate::protocol::{
    decode_command_header, encode_error_response, encode_response_header, AccessSize, BatchPolicy,
    Buffer, ClientInfoRequest, CodecError, DeviceCloseRequest, DeviceDescriptor, DeviceOpenReply,
    DeviceOpenRequest, GetConfigReply, GetConfigRequest, GetDeviceCapabilitiesReply,
    GetDeviceCapabilitiesRequest, GetDevicesReply, InitReply, InitRequest, LogLevel, MemFlags,
    MemPollRequest, MemReadReply, MemReadRequest, MemWriteRequest, MessageType, ProtocolError,
    RegListRequest, RegReadReply, RegReadRequest, RegWriteRequest, ResultCode,
    SetConfigRequest, SystemDescriptionReply, WireDecode, WireEncode, DEFAULT_BUFFER_SIZE,
    IMPLEMENTATION_DEFINED_BEGIN, IMPLEMENTATION_DEFINED_END, PROTOCOL_VERSION,
};
use crate::transport::Transport;

/// Server identity reported in the INIT reply.
pub const SERVER_ID: &str = "probewire server";

/// Server implementation version reported in the INIT reply.
pub const SERVER_VERSION: u64 = 0x0100;

/// Handler for message types in the implementation-defined range. It must
/// append exactly one response to the response buffer and return the result
/// code it reported.
pub type ExtensionHandler = dyn FnMut(&mut SessionState, u64, &mut Buffer, &mut Buffer) -> u64;

/// A server session: the dispatch loop plus the state it owns.
pub struct Session<B: Backend> {
    state: SessionState,
    backend: B,
    extension: Option<Box<ExtensionHandler>>,
}

impl<B: Backend> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("devices", &self.state.devices.len())
            .field("extension", &self.extension.is_some())
            .finish()
    }
}

impl<B: Backend> Session<B> {
    /// Creates a session around a backend.
    pub fn new(backend: B) -> Self {
        Self {
            state: SessionState::default(),
            backend,
            extension: None,
        }
    }

    /// The protocol-visible session state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The protocol-visible session state, mutably. Embedding servers use
    /// this to seed the system description before serving.
    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    /// Registers a handler for message types in the implementation-defined
    /// range `0x8000..=0xFFFF`, which otherwise answer `Unsupported`.
    pub fn set_extension_handler(
        &mut self,
        handler: impl FnMut(&mut SessionState, u64, &mut Buffer, &mut Buffer) -> u64 + 'static,
    ) {
        self.extension = Some(Box::new(handler));
    }

    /// Serves request frames from `transport` until the peer disconnects.
    ///
    /// On return the backend's `term` hook has run and the device list is
    /// cleared. Transports that can reconnect without losing device state
    /// should drive [`Session::process_frame`] directly instead.
    pub fn serve<T: Transport>(&mut self, transport: &mut T) -> Result<(), ProtocolError> {
        let mut cmd = Buffer::new(DEFAULT_BUFFER_SIZE);
        let mut rsp = Buffer::new(DEFAULT_BUFFER_SIZE);

        let result = loop {
            let received = match transport.receive(cmd.as_mut_slice()) {
                Ok(0) => {
                    log::info!("peer closed the connection");
                    break Ok(());
                }
                Ok(received) => received,
                Err(err) => break Err(err),
            };
            cmd.set_used(received);

            if let Err(err) = self.process_frame(&mut cmd, &mut rsp) {
                break Err(err);
            }
            if let Err(err) = transport.send(rsp.bytes()) {
                break Err(err);
            }
        };

        let _ = self.backend.term(&mut self.state);
        self.state.devices.clear();
        result
    }

    /// Processes one request frame into one response frame.
    ///
    /// Errors mean the frame itself was malformed beyond per-command
    /// recovery; command-level failures are encoded into the response
    /// stream instead.
    pub fn process_frame(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> Result<(), ProtocolError> {
        cmd.seek(0);
        let total = cmd.get_u32()? as usize;
        if total > cmd.used() {
            return Err(ProtocolError::Comms(format!(
                "truncated request frame: {} of {total} bytes",
                cmd.used()
            )));
        }
        let num_cmds = cmd.get_varint()?;
        let abort = cmd.get_u8()? == BatchPolicy::Abort as u8;

        rsp.clear();
        rsp.put_u32(0)?; // length placeholder, patched below
        rsp.put_varint(num_cmds)?;

        let mut handled = 0;
        let mut aborted = false;
        while handled < num_cmds && cmd.pos() < cmd.used() {
            let code = self.handle_command(cmd, rsp);
            handled += 1;
            if code != ResultCode::Success.value() && abort {
                aborted = true;
                break;
            }
        }

        if aborted {
            for _ in handled..num_cmds {
                encode_error_response(rsp, 0, ResultCode::Cancelled.value(), "Cancelled")?;
            }
        }

        rsp.patch_u32(0, rsp.used() as u32)?;
        Ok(())
    }

    /// Dispatches one command at the request cursor, appending exactly one
    /// response. Returns the result code reported.
    fn handle_command(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let ty = match decode_command_header(cmd) {
            Ok(ty) => ty,
            Err(err) => {
                return self.error_response(
                    rsp,
                    0,
                    err.result_code().value(),
                    "Failed to decode command header",
                )
            }
        };

        match MessageType::from_u64(ty) {
            Some(MessageType::Init) => self.handle_init(cmd, rsp),
            Some(MessageType::Term) => self.handle_term(cmd, rsp),
            Some(MessageType::ClientInfo) => self.handle_client_info(cmd, rsp),
            Some(MessageType::SetDevices) => self.handle_set_devices(cmd, rsp),
            Some(MessageType::GetDevices) => self.handle_get_devices(cmd, rsp),
            Some(MessageType::GetSystemDescription) => self.handle_get_system_description(cmd, rsp),
            Some(MessageType::DeviceOpen) => self.handle_device_open(cmd, rsp),
            Some(MessageType::DeviceClose) => self.handle_device_close(cmd, rsp),
            Some(MessageType::SetConfig) => self.handle_set_config(cmd, rsp),
            Some(MessageType::GetConfig) => self.handle_get_config(cmd, rsp),
            Some(MessageType::GetDeviceCapabilities) => {
                self.handle_get_device_capabilities(cmd, rsp)
            }
            Some(MessageType::RegList) => self.handle_reg_list(cmd, rsp),
            Some(MessageType::RegRead) => self.handle_reg_read(cmd, rsp),
            Some(MessageType::RegWrite) => self.handle_reg_write(cmd, rsp),
            Some(MessageType::MemRead) => self.handle_mem_read(cmd, rsp),
            Some(MessageType::MemWrite) => self.handle_mem_write(cmd, rsp),
            Some(MessageType::MemPoll) => self.handle_mem_poll(cmd, rsp),
            Some(MessageType::AsyncMessage) | None => {
                if (IMPLEMENTATION_DEFINED_BEGIN..=IMPLEMENTATION_DEFINED_END).contains(&ty) {
                    if let Some(mut handler) = self.extension.take() {
                        let code = handler(&mut self.state, ty, cmd, rsp);
                        self.extension = Some(handler);
                        return code;
                    }
                }
                self.error_response(
                    rsp,
                    ty,
                    ResultCode::Unsupported.value(),
                    &format!("Unknown message type {ty}"),
                )
            }
        }
    }

    /// Appends an error response, logging it through the backend. Returns
    /// `code` so handlers can report and return in one expression.
    fn error_response(&mut self, rsp: &mut Buffer, message_type: u64, code: u64, context: &str) -> u64 {
        let message = format!("Error {code}: {context}");
        self.backend.log(LogLevel::Error, &message);
        if let Err(err) = encode_error_response(rsp, message_type, code, &message) {
            log::warn!("failed to encode error response: {err}");
        }
        code
    }

    fn decode_error(&mut self, rsp: &mut Buffer, ty: MessageType, err: CodecError) -> u64 {
        self.error_response(
            rsp,
            ty as u64,
            err.result_code().value(),
            &format!("Failed to decode {ty:?} command"),
        )
    }

    /// Appends a success response with a body. A failed encode rolls the
    /// response back and reports the failure for this command instead.
    fn encode_reply(&mut self, rsp: &mut Buffer, ty: MessageType, body: &impl WireEncode) -> u64 {
        let mark = rsp.used();
        let res =
            encode_response_header(rsp, ty as u64, 0).and_then(|()| body.encode(rsp));
        match res {
            Ok(()) => ResultCode::Success.value(),
            Err(err) => {
                rsp.truncate(mark);
                self.error_response(
                    rsp,
                    ty as u64,
                    err.result_code().value(),
                    &format!("Failed to encode {ty:?} response"),
                )
            }
        }
    }

    /// Appends a success response with no body.
    fn encode_empty_reply(&mut self, rsp: &mut Buffer, ty: MessageType) -> u64 {
        match encode_response_header(rsp, ty as u64, 0) {
            Ok(()) => ResultCode::Success.value(),
            Err(err) => self.error_response(
                rsp,
                ty as u64,
                err.result_code().value(),
                &format!("Failed to encode {ty:?} response"),
            ),
        }
    }

    /// Validates a device index, reporting `InvalidDevice` if out of range.
    fn require_device(&mut self, rsp: &mut Buffer, ty: MessageType, device: u64) -> Result<usize, u64> {
        let index = device as usize;
        if index < self.state.devices.len() {
            Ok(index)
        } else {
            Err(self.error_response(
                rsp,
                ty as u64,
                ResultCode::InvalidDevice.value(),
                &format!("Invalid device {device}"),
            ))
        }
    }

    /// Validates a raw access size value.
    fn require_access_size(
        &mut self,
        rsp: &mut Buffer,
        ty: MessageType,
        raw: u64,
    ) -> Result<AccessSize, u64> {
        AccessSize::from_u64(raw).ok_or_else(|| {
            self.error_response(
                rsp,
                ty as u64,
                ResultCode::MemBadAccessSize.value(),
                &format!("Invalid access size {raw}"),
            )
        })
    }

    fn handle_init(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match InitRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::Init, err),
        };

        self.backend.log(
            LogLevel::Info,
            &format!(
                "client {:?} connected, protocol version {}",
                req.client_id, req.protocol_version
            ),
        );

        self.state.devices.clear();
        if let Err(code) = self.backend.init(&mut self.state) {
            return self.error_response(
                rsp,
                MessageType::Init as u64,
                code.value(),
                "Failed to initialize session",
            );
        }

        let reply = InitReply {
            protocol_version: PROTOCOL_VERSION,
            server_id: SERVER_ID.to_owned(),
            server_version: SERVER_VERSION,
        };
        self.encode_reply(rsp, MessageType::Init, &reply)
    }

    fn handle_term(&mut self, _cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        self.backend.log(LogLevel::Info, "client disconnected");
        let _ = self.backend.term(&mut self.state);
        self.state.devices.clear();
        self.encode_empty_reply(rsp, MessageType::Term)
    }

    fn handle_client_info(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match ClientInfoRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::ClientInfo, err),
        };
        self.backend
            .log(LogLevel::Info, &format!("Client info: {}", req.message));
        self.encode_empty_reply(rsp, MessageType::ClientInfo)
    }

    fn handle_set_devices(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let count = match cmd.get_varint() {
            Ok(count) => count,
            Err(err) => return self.decode_error(rsp, MessageType::SetDevices, err),
        };

        let _ = self.backend.clear_devices(&mut self.state);
        self.state.devices.clear();
        let _ = self.backend.init_devices(&mut self.state, count as usize);

        for i in 0..count {
            let descriptor = match DeviceDescriptor::decode(cmd) {
                Ok(descriptor) => descriptor,
                Err(err) => return self.decode_error(rsp, MessageType::SetDevices, err),
            };
            self.backend
                .log(LogLevel::Info, &format!("Device {i}: {}", descriptor.name));

            self.state.devices.push(DeviceRecord {
                name: descriptor.name.clone(),
                device_type: descriptor.device_type.clone(),
                registers: Vec::new(),
            });
            if let Err(code) =
                self.backend
                    .device_add(&mut self.state, i as usize, &descriptor.device_type)
            {
                return self.error_response(
                    rsp,
                    MessageType::SetDevices as u64,
                    code.value(),
                    &format!("Failed to add device {}", descriptor.name),
                );
            }
        }

        self.encode_empty_reply(rsp, MessageType::SetDevices)
    }

    fn handle_get_devices(&mut self, _cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let reply = GetDevicesReply {
            devices: self
                .state
                .devices
                .iter()
                .map(|device| DeviceDescriptor {
                    name: device.name.clone(),
                    device_type: device.device_type.clone(),
                })
                .collect(),
        };
        self.encode_reply(rsp, MessageType::GetDevices, &reply)
    }

    fn handle_get_system_description(&mut self, _cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let Some(description) = self.state.system_description.as_ref() else {
            return self.error_response(
                rsp,
                MessageType::GetSystemDescription as u64,
                ResultCode::Unsupported.value(),
                "Failed to get system description",
            );
        };
        let reply = SystemDescriptionReply {
            format: description.format,
            data: description.data.clone(),
        };
        self.encode_reply(rsp, MessageType::GetSystemDescription, &reply)
    }

    fn handle_device_open(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match DeviceOpenRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::DeviceOpen, err),
        };
        self.backend
            .log(LogLevel::Info, &format!("Open device {}", req.device));

        let index = match self.require_device(rsp, MessageType::DeviceOpen, req.device) {
            Ok(index) => index,
            Err(code) => return code,
        };

        self.state.devices[index].registers.clear();
        if let Err(code) = self.backend.device_open(&mut self.state, index) {
            return self.error_response(
                rsp,
                MessageType::DeviceOpen as u64,
                code.value(),
                &format!("Failed to open device {}", req.device),
            );
        }

        let reply = DeviceOpenReply {
            info: format!("Device {} info", req.device),
        };
        self.encode_reply(rsp, MessageType::DeviceOpen, &reply)
    }

    fn handle_device_close(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match DeviceCloseRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::DeviceClose, err),
        };
        let index = match self.require_device(rsp, MessageType::DeviceClose, req.device) {
            Ok(index) => index,
            Err(code) => return code,
        };
        self.backend
            .log(LogLevel::Info, &format!("Close device {}", req.device));

        let res = self.backend.device_close(&mut self.state, index);
        self.state.devices[index].registers.clear();
        if let Err(code) = res {
            return self.error_response(
                rsp,
                MessageType::DeviceClose as u64,
                code.value(),
                &format!("Failed to close device {}", req.device),
            );
        }
        self.encode_empty_reply(rsp, MessageType::DeviceClose)
    }

    fn handle_set_config(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match SetConfigRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::SetConfig, err),
        };
        self.backend.log(
            LogLevel::Info,
            &format!("Set config device {}: {} = {}", req.device, req.name, req.value),
        );

        let index = match self.require_device(rsp, MessageType::SetConfig, req.device) {
            Ok(index) => index,
            Err(code) => return code,
        };
        if let Err(code) = self
            .backend
            .set_config(&mut self.state, index, &req.name, &req.value)
        {
            return self.error_response(
                rsp,
                MessageType::SetConfig as u64,
                code.value(),
                &format!("Failed to set config item on device {}", req.device),
            );
        }
        self.encode_empty_reply(rsp, MessageType::SetConfig)
    }

    fn handle_get_config(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match GetConfigRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::GetConfig, err),
        };
        self.backend.log(
            LogLevel::Info,
            &format!("Get config device {}: {}", req.device, req.name),
        );

        let index = match self.require_device(rsp, MessageType::GetConfig, req.device) {
            Ok(index) => index,
            Err(code) => return code,
        };
        match self.backend.get_config(&mut self.state, index, &req.name) {
            Ok(value) => self.encode_reply(rsp, MessageType::GetConfig, &GetConfigReply { value }),
            Err(code) => self.error_response(
                rsp,
                MessageType::GetConfig as u64,
                code.value(),
                &format!("Failed to get config item on device {}", req.device),
            ),
        }
    }

    fn handle_get_device_capabilities(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match GetDeviceCapabilitiesRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::GetDeviceCapabilities, err),
        };
        let index = match self.require_device(rsp, MessageType::GetDeviceCapabilities, req.device) {
            Ok(index) => index,
            Err(code) => return code,
        };
        match self.backend.get_device_capabilities(&mut self.state, index) {
            Ok((capabilities, capability_data)) => self.encode_reply(
                rsp,
                MessageType::GetDeviceCapabilities,
                &GetDeviceCapabilitiesReply {
                    capabilities,
                    capability_data,
                },
            ),
            Err(code) => self.error_response(
                rsp,
                MessageType::GetDeviceCapabilities as u64,
                code.value(),
                &format!("Failed to get capabilities on device {}", req.device),
            ),
        }
    }

    fn handle_reg_list(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match RegListRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::RegList, err),
        };
        let index = match self.require_device(rsp, MessageType::RegList, req.device) {
            Ok(index) => index,
            Err(code) => return code,
        };

        if let Err(code) = self.backend.register_list_build(&mut self.state, index) {
            return self.error_response(
                rsp,
                MessageType::RegList as u64,
                code.value(),
                &format!("Failed to build register list for device {}", req.device),
            );
        }

        // Stream the records straight from the device state.
        let mark = rsp.used();
        let res = {
            let registers = &self.state.devices[index].registers;
            encode_response_header(rsp, MessageType::RegList as u64, 0)
                .and_then(|()| rsp.put_varint(registers.len() as u64))
                .and_then(|()| registers.iter().try_for_each(|register| register.encode(rsp)))
        };
        match res {
            Ok(()) => ResultCode::Success.value(),
            Err(err) => {
                rsp.truncate(mark);
                self.error_response(
                    rsp,
                    MessageType::RegList as u64,
                    err.result_code().value(),
                    "Failed to encode RegList response",
                )
            }
        }
    }

    fn handle_reg_read(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match RegReadRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::RegRead, err),
        };
        let index = match self.require_device(rsp, MessageType::RegRead, req.device) {
            Ok(index) => index,
            Err(code) => return code,
        };

        let mut values = Vec::with_capacity(req.ids.len());
        for id in &req.ids {
            self.backend
                .log(LogLevel::Debug, &format!("Read reg {id}"));
            match self.backend.register_read(&mut self.state, index, *id) {
                Ok(value) => values.push(value),
                Err(code) => {
                    return self.error_response(
                        rsp,
                        MessageType::RegRead as u64,
                        code.value(),
                        &format!("Failed to read register {id}"),
                    )
                }
            }
        }
        self.encode_reply(rsp, MessageType::RegRead, &RegReadReply { values })
    }

    fn handle_reg_write(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match RegWriteRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::RegWrite, err),
        };
        let index = match self.require_device(rsp, MessageType::RegWrite, req.device) {
            Ok(index) => index,
            Err(code) => return code,
        };

        for write in &req.writes {
            self.backend.log(
                LogLevel::Debug,
                &format!("Write reg {} = {:#010x}", write.id, write.value),
            );
            if let Err(code) =
                self.backend
                    .register_write(&mut self.state, index, write.id, write.value)
            {
                return self.error_response(
                    rsp,
                    MessageType::RegWrite as u64,
                    code.value(),
                    &format!("Failed to write register {}", write.id),
                );
            }
        }
        self.encode_empty_reply(rsp, MessageType::RegWrite)
    }

    fn handle_mem_read(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match MemReadRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::MemRead, err),
        };
        let index = match self.require_device(rsp, MessageType::MemRead, req.device) {
            Ok(index) => index,
            Err(code) => return code,
        };
        let access_size = match self.require_access_size(rsp, MessageType::MemRead, req.access_size)
        {
            Ok(access_size) => access_size,
            Err(code) => return code,
        };
        let size = req.size as usize;
        if size > rsp.capacity() {
            return self.error_response(
                rsp,
                MessageType::MemRead as u64,
                ResultCode::BadArgs.value(),
                &format!("Transfer of {size} bytes exceeds the session buffer"),
            );
        }
        self.backend.log(
            LogLevel::Debug,
            &format!(
                "Mem read: {}: {:#x} ..+{:#x}, acc={}, flags={:#x}",
                req.device, req.address, req.size, req.access_size, req.flags
            ),
        );

        let mut data = vec![0u8; size];
        match self.backend.mem_read(
            &mut self.state,
            index,
            req.address,
            access_size,
            MemFlags::from_bits_retain(req.flags),
            &mut data,
        ) {
            Ok(()) => self.encode_reply(rsp, MessageType::MemRead, &MemReadReply { data }),
            Err(code) => self.error_response(
                rsp,
                MessageType::MemRead as u64,
                code.value(),
                &format!("Failed to read memory {}: {:#x} ..+{:#x}", req.device, req.address, req.size),
            ),
        }
    }

    fn handle_mem_write(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match MemWriteRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::MemWrite, err),
        };
        // Borrow the payload in place rather than copying it out.
        let data = match cmd.get_direct(req.size as usize) {
            Ok(data) => data,
            Err(err) => return self.decode_error(rsp, MessageType::MemWrite, err),
        };
        let index = match self.require_device(rsp, MessageType::MemWrite, req.device) {
            Ok(index) => index,
            Err(code) => return code,
        };
        let access_size =
            match self.require_access_size(rsp, MessageType::MemWrite, req.access_size) {
                Ok(access_size) => access_size,
                Err(code) => return code,
            };
        self.backend.log(
            LogLevel::Debug,
            &format!(
                "Mem write: {}: {:#x} ..+{:#x}, acc={}, flags={:#x}",
                req.device, req.address, req.size, req.access_size, req.flags
            ),
        );

        if let Err(code) = self.backend.mem_write(
            &mut self.state,
            index,
            req.address,
            access_size,
            MemFlags::from_bits_retain(req.flags),
            data,
        ) {
            return self.error_response(
                rsp,
                MessageType::MemWrite as u64,
                code.value(),
                &format!("Failed to write memory {}: {:#x} ..+{:#x}", req.device, req.address, req.size),
            );
        }
        self.encode_empty_reply(rsp, MessageType::MemWrite)
    }

    fn handle_mem_poll(&mut self, cmd: &mut Buffer, rsp: &mut Buffer) -> u64 {
        let req = match MemPollRequest::decode(cmd) {
            Ok(req) => req,
            Err(err) => return self.decode_error(rsp, MessageType::MemPoll, err),
        };
        let size = req.size as usize;
        // Mask and value ride back to back after the head.
        let blocks = match cmd.get_direct(size.saturating_mul(2)) {
            Ok(blocks) => blocks,
            Err(err) => return self.decode_error(rsp, MessageType::MemPoll, err),
        };
        let (mask, value) = blocks.split_at(size);

        let index = match self.require_device(rsp, MessageType::MemPoll, req.device) {
            Ok(index) => index,
            Err(code) => return code,
        };
        let access_size = match self.require_access_size(rsp, MessageType::MemPoll, req.access_size)
        {
            Ok(access_size) => access_size,
            Err(code) => return code,
        };
        if size > rsp.capacity() {
            return self.error_response(
                rsp,
                MessageType::MemPoll as u64,
                ResultCode::BadArgs.value(),
                &format!("Transfer of {size} bytes exceeds the session buffer"),
            );
        }
        self.backend.log(
            LogLevel::Debug,
            &format!(
                "Mem poll: {}: {:#x} ..+{:#x}, tries={}, interval={}us",
                req.device, req.address, req.size, req.tries, req.interval_us
            ),
        );

        let mut data = vec![0u8; size];
        match self.backend.mem_poll(
            &mut self.state,
            index,
            req.address,
            access_size,
            MemFlags::from_bits_retain(req.flags),
            req.tries,
            req.interval_us,
            mask,
            value,
            &mut data,
        ) {
            Ok(()) => self.encode_reply(rsp, MessageType::MemPoll, &MemReadReply { data }),
            Err(code) => self.error_response(
                rsp,
                MessageType::MemPoll as u64,
                code.value(),
                &format!("Failed to poll memory {}: {:#x} ..+{:#x}", req.device, req.address, req.size),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::protocol::{decode_error_message, decode_response_header};

    use super::*;

    struct NullBackend;

    impl Backend for NullBackend {
        fn register_read(
            &mut self,
            _state: &mut SessionState,
            _index: usize,
            register: u64,
        ) -> BackendResult<u32> {
            if register < 8 {
                Ok(register as u32 * 10)
            } else {
                Err(ResultCode::RegFailed)
            }
        }
    }

    // Builds a request frame by hand: length, count, policy, then bodies.
    fn frame_with_count(
        count: u64,
        policy: BatchPolicy,
        bodies: impl FnOnce(&mut Buffer),
    ) -> Buffer {
        let mut buf = Buffer::new(DEFAULT_BUFFER_SIZE);
        buf.put_u32(0).unwrap();
        buf.put_varint(count).unwrap();
        buf.put_u8(policy as u8).unwrap();
        bodies(&mut buf);
        buf.patch_u32(0, buf.used() as u32).unwrap();
        buf
    }

    fn process(session: &mut Session<NullBackend>, cmd: &mut Buffer) -> Buffer {
        let mut rsp = Buffer::new(DEFAULT_BUFFER_SIZE);
        session.process_frame(cmd, &mut rsp).unwrap();
        rsp.seek(0);
        let total = rsp.get_u32().unwrap();
        assert_eq!(total as usize, rsp.used());
        rsp
    }

    fn set_two_devices(session: &mut Session<NullBackend>) {
        let mut cmd = frame_with_count(1, BatchPolicy::None, |buf| {
            buf.put_varint(MessageType::SetDevices as u64).unwrap();
            buf.put_varint(2).unwrap();
            buf.put_string("dev0").unwrap();
            buf.put_string("probe").unwrap();
            buf.put_string("dev1").unwrap();
            buf.put_string("probe").unwrap();
        });
        let mut rsp = process(session, &mut cmd);
        rsp.get_varint().unwrap();
        let header = decode_response_header(&mut rsp).unwrap();
        assert_eq!(header.error_code, 0);
    }

    #[test]
    fn init_reports_server_identity() {
        let mut session = Session::new(NullBackend);
        let mut cmd = frame_with_count(1, BatchPolicy::None, |buf| {
            buf.put_varint(MessageType::Init as u64).unwrap();
            buf.put_varint(PROTOCOL_VERSION).unwrap();
            buf.put_string("Test client").unwrap();
        });

        let mut rsp = process(&mut session, &mut cmd);
        assert_eq!(rsp.get_varint().unwrap(), 1);
        let header = decode_response_header(&mut rsp).unwrap();
        assert_eq!(header.message_type, MessageType::Init as u64);
        assert_eq!(header.error_code, 0);

        let reply = InitReply::decode(&mut rsp).unwrap();
        assert_eq!(reply.protocol_version, PROTOCOL_VERSION);
        assert_eq!(reply.server_id, SERVER_ID);
        assert_eq!(reply.server_version, 0x100);
    }

    #[test]
    fn unknown_message_type_answers_unsupported() {
        let mut session = Session::new(NullBackend);
        let mut cmd = frame_with_count(2, BatchPolicy::Continue, |buf| {
            buf.put_varint(0x4242).unwrap();
            buf.put_varint(MessageType::GetDevices as u64).unwrap();
        });

        let mut rsp = process(&mut session, &mut cmd);
        assert_eq!(rsp.get_varint().unwrap(), 2);

        let header = decode_response_header(&mut rsp).unwrap();
        assert_eq!(header.message_type, 0x4242);
        assert_eq!(header.error_code, ResultCode::Unsupported.value());
        let message = decode_error_message(&mut rsp).unwrap();
        assert!(message.contains("Unknown message type"));

        // framing stays in sync: the next command still gets its reply
        let header = decode_response_header(&mut rsp).unwrap();
        assert_eq!(header.message_type, MessageType::GetDevices as u64);
        assert_eq!(header.error_code, 0);
    }

    #[test]
    fn abort_batch_fills_cancelled() {
        let mut session = Session::new(NullBackend);
        set_two_devices(&mut session);

        // three reg reads, the second targets a bad register
        let mut cmd = frame_with_count(3, BatchPolicy::Abort, |buf| {
            for register in [1u64, 9, 2] {
                buf.put_varint(MessageType::RegRead as u64).unwrap();
                buf.put_varint(0).unwrap();
                buf.put_varint(1).unwrap();
                buf.put_varint(register).unwrap();
            }
        });

        let mut rsp = process(&mut session, &mut cmd);
        assert_eq!(rsp.get_varint().unwrap(), 3);

        let first = decode_response_header(&mut rsp).unwrap();
        assert_eq!(first.error_code, 0);
        let values = RegReadReply::decode(&mut rsp).unwrap();
        assert_eq!(values.values, vec![10]);

        let second = decode_response_header(&mut rsp).unwrap();
        assert_eq!(second.message_type, MessageType::RegRead as u64);
        assert_eq!(second.error_code, ResultCode::RegFailed.value());
        decode_error_message(&mut rsp).unwrap();

        let third = decode_response_header(&mut rsp).unwrap();
        assert_eq!(third.message_type, 0);
        assert_eq!(third.error_code, ResultCode::Cancelled.value());
        assert_eq!(decode_error_message(&mut rsp).unwrap(), "Cancelled");

        assert_eq!(rsp.remaining(), 0);
    }

    #[test]
    fn continue_batch_attempts_every_entry() {
        let mut session = Session::new(NullBackend);
        set_two_devices(&mut session);

        let mut cmd = frame_with_count(3, BatchPolicy::Continue, |buf| {
            for register in [1u64, 9, 2] {
                buf.put_varint(MessageType::RegRead as u64).unwrap();
                buf.put_varint(0).unwrap();
                buf.put_varint(1).unwrap();
                buf.put_varint(register).unwrap();
            }
        });

        let mut rsp = process(&mut session, &mut cmd);
        assert_eq!(rsp.get_varint().unwrap(), 3);

        let codes: Vec<u64> = (0..3)
            .map(|_| {
                let header = decode_response_header(&mut rsp).unwrap();
                if header.error_code == 0 {
                    RegReadReply::decode(&mut rsp).unwrap();
                } else {
                    decode_error_message(&mut rsp).unwrap();
                }
                header.error_code
            })
            .collect();
        assert_eq!(codes, vec![0, ResultCode::RegFailed.value(), 0]);
    }

    #[test]
    fn invalid_device_is_rejected() {
        let mut session = Session::new(NullBackend);
        let mut cmd = frame_with_count(1, BatchPolicy::None, |buf| {
            buf.put_varint(MessageType::DeviceOpen as u64).unwrap();
            buf.put_varint(5).unwrap();
        });

        let mut rsp = process(&mut session, &mut cmd);
        rsp.get_varint().unwrap();
        let header = decode_response_header(&mut rsp).unwrap();
        assert_eq!(header.error_code, ResultCode::InvalidDevice.value());
        let message = decode_error_message(&mut rsp).unwrap();
        assert!(message.contains("Invalid device 5"));
    }

    #[test]
    fn extension_range_without_handler_is_unsupported() {
        let mut session = Session::new(NullBackend);
        let mut cmd = frame_with_count(1, BatchPolicy::None, |buf| {
            buf.put_varint(0x8001).unwrap();
        });

        let mut rsp = process(&mut session, &mut cmd);
        rsp.get_varint().unwrap();
        let header = decode_response_header(&mut rsp).unwrap();
        assert_eq!(header.message_type, 0x8001);
        assert_eq!(header.error_code, ResultCode::Unsupported.value());
    }

    #[test]
    fn extension_handler_owns_its_range() {
        let mut session = Session::new(NullBackend);
        session.set_extension_handler(|_state, ty, _cmd, rsp| {
            encode_response_header(rsp, ty, 0).unwrap();
            rsp.put_varint(0x55).unwrap();
            0
        });

        let mut cmd = frame_with_count(1, BatchPolicy::None, |buf| {
            buf.put_varint(0x8001).unwrap();
        });
        let mut rsp = process(&mut session, &mut cmd);
        rsp.get_varint().unwrap();
        let header = decode_response_header(&mut rsp).unwrap();
        assert_eq!(header.error_code, 0);
        assert_eq!(rsp.get_varint().unwrap(), 0x55);
    }

    #[test]
    fn async_message_request_is_unsupported() {
        let mut session = Session::new(NullBackend);
        let mut cmd = frame_with_count(1, BatchPolicy::None, |buf| {
            buf.put_varint(MessageType::AsyncMessage as u64).unwrap();
        });

        let mut rsp = process(&mut session, &mut cmd);
        rsp.get_varint().unwrap();
        let header = decode_response_header(&mut rsp).unwrap();
        assert_eq!(header.error_code, ResultCode::Unsupported.value());
    }

    #[test]
    fn truncated_frame_is_a_hard_error() {
        let mut session = Session::new(NullBackend);
        let mut cmd = Buffer::new(64);
        cmd.put_u32(100).unwrap(); // claims 100 bytes, delivers 4
        let mut rsp = Buffer::new(64);
        assert!(session.process_frame(&mut cmd, &mut rsp).is_err());
    }
}
