//! PIP2 command engine.
//!
//! PIP2 is spoken by the ROM boot loader over the raw I2C bus. Every command
//! is a single frame and every response comes back as a single frame, so the
//! engine is a plain send / sleep / receive loop with strict correlation
//! checks on the way back.

use std::thread;
use tracing::{debug, error, info, instrument};

use crate::engine::{
    CommandError, FlashEngine, Timing, response_payload, verify_packet_crc, write_chunks,
};
use crate::protocol::constants::{
    DEFAULT_SEQ, PIP2_FILE_WRITE_OVERHEAD, PIP2_MAX_CMD_LEN, RSP_MIN_LEN, RSP_PAYLOAD_START,
    ReportId, TAG_BIT,
};
use crate::protocol::header::encode_pip2_command;
use crate::protocol::{
    ExecMode, FileIoctl, Generation, Pip2CommandId, ResponseHeader, STATUS_SUCCESS, SeqField,
    SysMode, status_label,
};
use crate::transport::{ChannelKind, Received, Transport};

/// Response buffer sizes (header + payload + CRC) per command.
const CAP_NO_PAYLOAD: usize = RSP_MIN_LEN;
const CAP_FILE_OPEN: usize = RSP_MIN_LEN + 1;
const CAP_STATUS: usize = RSP_MIN_LEN + 4;
const CAP_UNBOUNDED: usize = 0xFFFF;

/// Decoded STATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pip2Status {
    pub exec: ExecMode,
    pub sys_mode: SysMode,
    pub protocol_mode: u8,
}

impl Pip2Status {
    fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        if payload.len() < 3 {
            return Err(CommandError::Malformed {
                command: Pip2CommandId::Status.name(),
                reason: format!("{} payload bytes, need 3", payload.len()),
            });
        }
        Ok(Self {
            exec: ExecMode::from_bit(payload[0]),
            sys_mode: SysMode::from_u8(payload[1]),
            protocol_mode: payload[2] & 0x07,
        })
    }
}

/// Boot loader command engine.
pub struct Pip2Engine {
    channel: Option<Box<dyn Transport>>,
    timing: Timing,
}

impl Pip2Engine {
    pub fn new() -> Self {
        Self::with_timing(Timing::pip2())
    }

    pub fn with_timing(timing: Timing) -> Self {
        Self {
            channel: None,
            timing,
        }
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_some()
    }

    pub fn channel_kind(&self) -> Option<ChannelKind> {
        self.channel.as_ref().map(|c| c.kind())
    }

    /// Attach the engine to a channel.
    ///
    /// Attaching a second channel of the kind already in use is a no-op; a
    /// different kind is refused. Only the raw bus carries PIP2.
    pub fn setup(&mut self, mut channel: Box<dyn Transport>) -> Result<(), CommandError> {
        let requested = channel.kind();
        if let Some(active) = self.channel_kind() {
            if active != requested {
                return Err(CommandError::ChannelConflict {
                    generation: Generation::Gen2,
                    active,
                    requested,
                });
            }
            debug!(channel = %requested, "PIP2 API already uses this channel");
            return Ok(());
        }
        if requested == ChannelKind::Hidraw {
            return Err(CommandError::InvalidArgument {
                command: "setup",
                reason: format!("PIP2 is not supported over the {requested} channel"),
            });
        }

        channel
            .setup(ReportId::Any)
            .map_err(CommandError::transport("setup"))?;
        debug!(channel = %requested, "Using the channel for PIP2");
        self.channel = Some(channel);
        Ok(())
    }

    /// Release the channel. Calling this while inactive does nothing.
    pub fn teardown(&mut self) -> Result<(), CommandError> {
        match self.channel.take() {
            Some(mut channel) => channel
                .teardown()
                .map_err(CommandError::transport("teardown")),
            None => {
                debug!("PIP2 API is already inactive");
                Ok(())
            }
        }
    }

    fn channel(&mut self) -> Result<&mut Box<dyn Transport>, CommandError> {
        self.channel.as_mut().ok_or(CommandError::NotActive {
            generation: Generation::Gen2,
        })
    }

    fn send(&mut self, cmd: Pip2CommandId, payload: &[u8]) -> Result<(), CommandError> {
        let seq = SeqField::new(DEFAULT_SEQ, TAG_BIT).map_err(CommandError::header(cmd.name()))?;
        let frame =
            encode_pip2_command(seq, cmd.as_u8(), payload).map_err(CommandError::header(cmd.name()))?;
        debug!("=> {} {}", cmd, hex::encode(&frame));
        self.channel()?
            .send(&frame)
            .map_err(CommandError::transport(cmd.name()))
    }

    /// Run one command and return the full response packet.
    ///
    /// `capacity` bounds the declared response length. Failures are logged at
    /// `error` unless `quiet` is set, in which case they go to `debug`.
    #[instrument(level = "trace", skip(self, cmd, payload), fields(cmd = %cmd, len = payload.len()))]
    pub fn execute(
        &mut self,
        cmd: Pip2CommandId,
        payload: &[u8],
        capacity: usize,
        quiet: bool,
    ) -> Result<Vec<u8>, CommandError> {
        let result = self.exchange(cmd, payload, capacity);
        if let Err(e) = &result {
            if quiet {
                debug!(command = %cmd, "PIP2 command failed: {}", e);
            } else {
                error!(command = %cmd, "PIP2 command failed: {}", e);
            }
        }
        result
    }

    fn exchange(
        &mut self,
        cmd: Pip2CommandId,
        payload: &[u8],
        capacity: usize,
    ) -> Result<Vec<u8>, CommandError> {
        let command = cmd.name();
        self.send(cmd, payload)?;

        thread::sleep(if cmd == Pip2CommandId::FileIoctl {
            self.timing.erase
        } else {
            self.timing.cmd_to_rsp
        });

        let timeout = self.timing.rsp_timeout;
        let response = match self
            .channel()?
            .receive(Some(timeout))
            .map_err(CommandError::transport(command))?
        {
            Received::Data(data) => data,
            Received::Timeout => return Err(CommandError::Timeout { command }),
            Received::Skip => return Err(CommandError::NoResponse { command }),
        };

        if response.len() < RSP_MIN_LEN {
            return Err(CommandError::ShortResponse {
                command,
                expected: RSP_MIN_LEN,
                actual: response.len(),
            });
        }
        let header = ResponseHeader::from_bytes(&response).map_err(CommandError::header(command))?;
        verify_response(cmd, &header)?;

        let declared = usize::from(header.len);
        debug!("<= {} {}", cmd, hex::encode(&response));
        if declared > capacity {
            return Err(CommandError::CapacityExceeded {
                command,
                declared,
                capacity,
            });
        }
        if response.len() > declared {
            return Err(CommandError::Overrun {
                command,
                declared,
                received: response.len(),
            });
        }
        Ok(response)
    }

    /// Run a command and return the bytes between the header and the CRC.
    fn query(&mut self, cmd: Pip2CommandId, payload: &[u8], capacity: usize) -> Result<Vec<u8>, CommandError> {
        let response = self.execute(cmd, payload, capacity, false)?;
        Ok(response_payload(&response).to_vec())
    }

    pub fn ping(&mut self) -> Result<Vec<u8>, CommandError> {
        self.query(Pip2CommandId::Ping, &[], CAP_UNBOUNDED)
    }

    pub fn status(&mut self) -> Result<Pip2Status, CommandError> {
        self.status_inner(false)
    }

    /// STATUS as a presence probe: failures only log at debug level.
    pub fn status_quiet(&mut self) -> Result<Pip2Status, CommandError> {
        self.status_inner(true)
    }

    fn status_inner(&mut self, quiet: bool) -> Result<Pip2Status, CommandError> {
        let response = self.execute(Pip2CommandId::Status, &[], CAP_STATUS, quiet)?;
        Pip2Status::parse(response_payload(&response))
    }

    pub fn version(&mut self) -> Result<Vec<u8>, CommandError> {
        self.query(Pip2CommandId::Version, &[], CAP_UNBOUNDED)
    }

    /// Restart the boot loader. There is no response to wait for.
    pub fn reset(&mut self) -> Result<(), CommandError> {
        self.send(Pip2CommandId::Reset, &[])?;
        thread::sleep(self.timing.reset);
        info!("PIP2 RESET sent");
        Ok(())
    }

    pub fn file_crc(&mut self, handle: u8) -> Result<Vec<u8>, CommandError> {
        self.query(
            Pip2CommandId::FileIoctl,
            &[handle, FileIoctl::Crc as u8],
            CAP_UNBOUNDED,
        )
    }

    pub fn flash_info(&mut self) -> Result<Vec<u8>, CommandError> {
        self.query(Pip2CommandId::FlashInfo, &[], CAP_UNBOUNDED)
    }

    pub fn get_last_errno(&mut self) -> Result<Vec<u8>, CommandError> {
        self.query(Pip2CommandId::GetLastErrno, &[], CAP_UNBOUNDED)
    }
}

impl Default for Pip2Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashEngine for Pip2Engine {
    fn generation(&self) -> Generation {
        Generation::Gen2
    }

    fn file_open(&mut self, file_num: u8) -> Result<u8, CommandError> {
        let response = self.execute(Pip2CommandId::FileOpen, &[file_num], CAP_FILE_OPEN, false)?;
        response_payload(&response)
            .first()
            .copied()
            .ok_or_else(|| CommandError::Malformed {
                command: Pip2CommandId::FileOpen.name(),
                reason: "missing file handle".into(),
            })
    }

    fn file_close(&mut self, handle: u8) -> Result<(), CommandError> {
        self.execute(Pip2CommandId::FileClose, &[handle], CAP_NO_PAYLOAD, false)?;
        Ok(())
    }

    fn file_erase(&mut self, handle: u8) -> Result<(), CommandError> {
        self.execute(
            Pip2CommandId::FileIoctl,
            &[handle, FileIoctl::Erase as u8],
            CAP_NO_PAYLOAD,
            false,
        )?;
        Ok(())
    }

    fn file_read(&mut self, handle: u8, len: u16) -> Result<Vec<u8>, CommandError> {
        let [lsb, msb] = len.to_le_bytes();
        let response = self.execute(
            Pip2CommandId::FileRead,
            &[handle, lsb, msb],
            usize::from(len) + RSP_MIN_LEN,
            false,
        )?;
        verify_packet_crc(Pip2CommandId::FileRead.name(), &response)?;

        let end = RSP_PAYLOAD_START + usize::from(len);
        let data = response
            .get(RSP_PAYLOAD_START..end)
            .ok_or_else(|| CommandError::ShortResponse {
                command: Pip2CommandId::FileRead.name(),
                expected: end + 2,
                actual: response.len(),
            })?;
        Ok(data.to_vec())
    }

    #[instrument(skip(self, data, progress), fields(len = data.len()))]
    fn file_write(
        &mut self,
        handle: u8,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<(), CommandError> {
        let total = data.len();
        write_chunks(
            Pip2CommandId::FileWrite.name(),
            data,
            PIP2_MAX_CMD_LEN - PIP2_FILE_WRITE_OVERHEAD,
            |offset, chunk| {
                let mut payload = Vec::with_capacity(chunk.len() + 1);
                payload.push(handle);
                payload.extend_from_slice(chunk);
                self.execute(Pip2CommandId::FileWrite, &payload, CAP_NO_PAYLOAD, false)?;
                progress(offset + chunk.len(), total);
                Ok(())
            },
        )?;
        Ok(())
    }
}

/// Check a response against the command that was sent.
fn verify_response(cmd: Pip2CommandId, header: &ResponseHeader) -> Result<(), CommandError> {
    let command = cmd.name();
    if header.cmd.id != cmd.as_u8() {
        return Err(CommandError::CommandMismatch {
            command,
            actual: header.cmd.id,
            actual_name: Pip2CommandId::name_of(header.cmd.id),
        });
    }
    if header.seq.seq != DEFAULT_SEQ {
        return Err(CommandError::SequenceMismatch {
            command,
            expected: DEFAULT_SEQ,
            actual: header.seq.seq,
        });
    }
    if !header.cmd.response {
        return Err(CommandError::ResponseFlag {
            command,
            expected: true,
            actual: false,
        });
    }
    if header.status != STATUS_SUCCESS {
        return Err(CommandError::Status {
            generation: Generation::Gen2,
            command,
            code: header.status,
            label: status_label(Generation::Gen2, header.status),
        });
    }
    Ok(())
}
