//! PIP3 command engine.
//!
//! PIP3 runs in the application firmware and is carried in HID reports. A
//! response packet can be larger than one input report, in which case it is
//! split over several reports flagged with "first" and "more" bits and the
//! engine stitches the segments back together.
//!
//! After START_TRACKING_HEATMAP the firmware also pushes unsolicited packets
//! on report id 0x45; [`Pip3Engine::unsolicited_response`] pulls those.

pub mod types;

use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use crate::engine::{
    CommandError, FlashEngine, Timing, response_payload, verify_packet_crc, write_chunks,
};
use crate::protocol::constants::{
    DEFAULT_SEQ, HID_INPUT_PACKET_START, HID_INPUT_STATUS_INDEX, PIP3_FILE_WRITE_OVERHEAD,
    PIP3_HEATMAP_PAYLOAD_MAX_LEN, PIP3_LOAD_SELF_TEST_PARAM_OVERHEAD, RSP_MIN_LEN,
    RSP_PAYLOAD_START, ReportId, TAG_BIT,
};
use crate::protocol::header::encode_pip3_command;
use crate::protocol::{
    CmdField, FileIoctl, Generation, ImageId, InputReportHeader, Pip3CommandId, Processor,
    STATUS_SUCCESS, SeqField, status_label,
};
use crate::transport::{ChannelKind, DeviceDescriptor, Received, Transport};

pub use types::{Pip3Status, Pip3Version, SelfTestResults, Sysinfo};

const CAP_NO_PAYLOAD: usize = RSP_MIN_LEN;
const CAP_FILE_OPEN: usize = RSP_MIN_LEN + 1;
const CAP_STATUS: usize = RSP_MIN_LEN + Pip3Status::PAYLOAD_LEN;
const CAP_VERSION: usize = RSP_MIN_LEN + Pip3Version::PAYLOAD_LEN;
const CAP_SYSINFO: usize = RSP_MIN_LEN + Sysinfo::PAYLOAD_LEN;
const CAP_LOAD_SELF_TEST_PARAM: usize = RSP_MIN_LEN + 3;
const CAP_UNBOUNDED: usize = 0xFFFF;

/// What a response report has to match.
#[derive(Debug, Clone, Copy)]
struct Expected {
    command: &'static str,
    report_id: ReportId,
    cmd_id: u8,
    seq: u8,
}

/// Command that armed async debug data mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AsyncMode {
    cmd_id: u8,
    seq: u8,
}

/// Application firmware command engine.
pub struct Pip3Engine {
    channel: Option<Box<dyn Transport>>,
    descriptor: DeviceDescriptor,
    async_mode: Option<AsyncMode>,
    timing: Timing,
}

impl Pip3Engine {
    pub fn new() -> Self {
        Self::with_timing(Timing::pip3())
    }

    pub fn with_timing(timing: Timing) -> Self {
        Self {
            channel: None,
            descriptor: DeviceDescriptor::default(),
            async_mode: None,
            timing,
        }
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_some()
    }

    pub fn channel_kind(&self) -> Option<ChannelKind> {
        self.channel.as_ref().map(|c| c.kind())
    }

    /// Report lengths learned when the channel was attached.
    pub fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor
    }

    pub fn is_async_active(&self) -> bool {
        self.async_mode.is_some()
    }

    /// Attach the engine to a report channel.
    ///
    /// Reads the device descriptor first, then starts the channel with
    /// `filter` (normally [`ReportId::SolicitedResponse`]).
    pub fn setup(
        &mut self,
        mut channel: Box<dyn Transport>,
        filter: ReportId,
    ) -> Result<(), CommandError> {
        let requested = channel.kind();
        if let Some(active) = self.channel_kind() {
            if active != requested {
                return Err(CommandError::ChannelConflict {
                    generation: Generation::Gen3,
                    active,
                    requested,
                });
            }
            debug!(channel = %requested, "PIP3 API already uses this channel");
            return Ok(());
        }
        if requested == ChannelKind::I2cDev {
            return Err(CommandError::InvalidArgument {
                command: "setup",
                reason: format!("PIP3 is not supported over the {requested} channel"),
            });
        }

        let descriptor = channel
            .describe()
            .map_err(CommandError::transport("setup"))?;
        channel
            .setup(filter)
            .map_err(CommandError::transport("setup"))?;

        debug!(
            channel = %requested,
            max_input_len = descriptor.max_input_len,
            max_output_len = descriptor.max_output_len,
            "Using the channel for PIP3"
        );
        self.descriptor = descriptor;
        self.channel = Some(channel);
        Ok(())
    }

    /// Release the channel. Calling this while inactive does nothing.
    pub fn teardown(&mut self) -> Result<(), CommandError> {
        self.async_mode = None;
        self.descriptor = DeviceDescriptor::default();
        match self.channel.take() {
            Some(mut channel) => channel
                .teardown()
                .map_err(CommandError::transport("teardown")),
            None => {
                debug!("PIP3 API is already inactive");
                Ok(())
            }
        }
    }

    fn channel(&mut self) -> Result<&mut Box<dyn Transport>, CommandError> {
        self.channel.as_mut().ok_or(CommandError::NotActive {
            generation: Generation::Gen3,
        })
    }

    /// Longest command the output report can carry.
    fn max_cmd_len(&self) -> usize {
        self.descriptor.max_output_len.saturating_sub(2)
    }

    fn send(&mut self, cmd: Pip3CommandId, payload: &[u8]) -> Result<(), CommandError> {
        let seq = SeqField::new(DEFAULT_SEQ, TAG_BIT).map_err(CommandError::header(cmd.name()))?;
        let frame =
            encode_pip3_command(seq, cmd.as_u8(), payload).map_err(CommandError::header(cmd.name()))?;
        debug!("=> {} {}", cmd, hex::encode(&frame));
        self.channel()?
            .send(&frame)
            .map_err(CommandError::transport(cmd.name()))
    }

    /// Send a command the firmware does not answer, then wait `settle`.
    fn send_unanswered(
        &mut self,
        cmd: Pip3CommandId,
        payload: &[u8],
        settle: Duration,
    ) -> Result<(), CommandError> {
        let result = self.send(cmd, payload);
        debug!(command = %cmd, settle_ms = settle.as_millis() as u64, "Waiting for the device to settle");
        thread::sleep(settle);
        if let Err(e) = &result {
            error!(command = %cmd, "PIP3 command failed: {}", e);
        }
        result
    }

    /// Run one command and return the reassembled response packet.
    #[instrument(level = "trace", skip(self, cmd, payload), fields(cmd = %cmd, len = payload.len()))]
    pub fn execute(
        &mut self,
        cmd: Pip3CommandId,
        payload: &[u8],
        capacity: usize,
    ) -> Result<Vec<u8>, CommandError> {
        let result = self.exchange(cmd, payload, capacity);
        if let Err(e) = &result {
            error!(command = %cmd, "PIP3 command failed: {}", e);
        }
        result
    }

    fn exchange(
        &mut self,
        cmd: Pip3CommandId,
        payload: &[u8],
        capacity: usize,
    ) -> Result<Vec<u8>, CommandError> {
        self.send(cmd, payload)?;
        thread::sleep(if cmd == Pip3CommandId::FileIoctl {
            self.timing.erase
        } else {
            self.timing.cmd_to_rsp
        });

        let expected = Expected {
            command: cmd.name(),
            report_id: ReportId::SolicitedResponse,
            cmd_id: cmd.as_u8(),
            seq: DEFAULT_SEQ,
        };
        let timeout = self.timing.rsp_timeout;
        self.read_packet(expected, capacity, Some(timeout))
    }

    /// Read reports until the packet they carry is complete.
    fn read_packet(
        &mut self,
        expected: Expected,
        capacity: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, CommandError> {
        let command = expected.command;
        let mut packet: Vec<u8> = Vec::new();
        let mut declared: Option<usize> = None;

        loop {
            let report = match self
                .channel()?
                .receive(timeout)
                .map_err(CommandError::transport(command))?
            {
                Received::Data(report) => report,
                Received::Timeout => return Err(CommandError::Timeout { command }),
                Received::Skip => return Err(CommandError::NoResponse { command }),
            };
            let header = verify_report(&expected, &report)?;

            let total = if header.first_report {
                if declared.is_some() {
                    return Err(CommandError::Malformed {
                        command,
                        reason: "a second first report arrived mid-response".into(),
                    });
                }
                let len = usize::from(u16::from_le_bytes([report[2], report[3]]));
                debug!(payload_len = len, "<= {} {}", command, hex::encode(&report));
                declared = Some(len);
                len
            } else {
                debug!("<= (continued response) {}", hex::encode(&report));
                declared.ok_or_else(|| CommandError::Malformed {
                    command,
                    reason: "continuation report without a first report".into(),
                })?
            };

            if total > capacity {
                return Err(CommandError::CapacityExceeded {
                    command,
                    declared: total,
                    capacity,
                });
            }

            let segment = &report[HID_INPUT_PACKET_START..];
            let copy_len = (total - packet.len()).min(segment.len());
            packet.extend_from_slice(&segment[..copy_len]);

            if !header.more_reports {
                break;
            }
            if packet.len() == total {
                return Err(CommandError::Overrun {
                    command,
                    declared: total,
                    received: packet.len() + segment.len() - copy_len,
                });
            }
        }

        let total = declared.unwrap_or_default();
        if packet.len() < total.max(RSP_MIN_LEN) {
            return Err(CommandError::ShortResponse {
                command,
                expected: total.max(RSP_MIN_LEN),
                actual: packet.len(),
            });
        }
        Ok(packet)
    }

    fn query(
        &mut self,
        cmd: Pip3CommandId,
        payload: &[u8],
        capacity: usize,
    ) -> Result<Vec<u8>, CommandError> {
        let packet = self.execute(cmd, payload, capacity)?;
        Ok(response_payload(&packet).to_vec())
    }

    pub fn ping(&mut self) -> Result<Vec<u8>, CommandError> {
        self.query(Pip3CommandId::Ping, &[], CAP_UNBOUNDED)
    }

    pub fn status(&mut self) -> Result<Pip3Status, CommandError> {
        let payload = self.query(Pip3CommandId::Status, &[], CAP_STATUS)?;
        Pip3Status::parse(&payload)
    }

    pub fn version(&mut self) -> Result<Pip3Version, CommandError> {
        let payload = self.query(Pip3CommandId::Version, &[], CAP_VERSION)?;
        Pip3Version::parse(&payload)
    }

    pub fn get_sysinfo(&mut self) -> Result<Sysinfo, CommandError> {
        let payload = self.query(Pip3CommandId::GetSysinfo, &[], CAP_SYSINFO)?;
        Sysinfo::parse(&payload)
    }

    /// Ask the firmware to jump to another image. Nothing is read back.
    pub fn switch_image(&mut self, image: ImageId) -> Result<(), CommandError> {
        info!(image = %image, "Switching image");
        let settle = self.timing.reset;
        self.send_unanswered(Pip3CommandId::SwitchImage, &[image as u8], settle)
    }

    /// Hand the bus to another processor. `switch_data` is the time (in
    /// seconds) the auxiliary processor stays active. Nothing is read back.
    pub fn switch_active_processor(
        &mut self,
        processor: Processor,
        switch_data: u8,
    ) -> Result<(), CommandError> {
        info!(processor = %processor, switch_data, "Switching active processor");
        let settle = self.timing.switch_processor;
        self.send_unanswered(
            Pip3CommandId::SwitchActiveProcessor,
            &[processor.as_u8(), switch_data],
            settle,
        )
    }

    pub fn suspend_scan(&mut self) -> Result<(), CommandError> {
        self.execute(Pip3CommandId::SuspendScan, &[], CAP_NO_PAYLOAD)?;
        Ok(())
    }

    pub fn resume_scan(&mut self) -> Result<(), CommandError> {
        self.execute(Pip3CommandId::ResumeScan, &[], CAP_NO_PAYLOAD)?;
        Ok(())
    }

    pub fn calibrate(&mut self, mode: u8, data: [u8; 3]) -> Result<(), CommandError> {
        self.execute(
            Pip3CommandId::Calibrate,
            &[mode, data[0], data[1], data[2]],
            CAP_NO_PAYLOAD,
        )?;
        Ok(())
    }

    pub fn initialize_baseline(&mut self, data_id_mask: u8) -> Result<(), CommandError> {
        self.execute(
            Pip3CommandId::InitializeBaseline,
            &[data_id_mask],
            CAP_NO_PAYLOAD,
        )?;
        Ok(())
    }

    /// Upload self-test parameters, split over as many commands as the
    /// output report length requires.
    pub fn load_self_test_param(&mut self, self_test_id: u8, params: &[u8]) -> Result<(), CommandError> {
        let command = Pip3CommandId::LoadSelfTestParam.name();
        let max_chunk = self
            .max_cmd_len()
            .saturating_sub(PIP3_LOAD_SELF_TEST_PARAM_OVERHEAD);
        write_chunks(command, params, max_chunk, |offset, chunk| {
            let offset = u16::try_from(offset).map_err(|_| CommandError::InvalidArgument {
                command,
                reason: format!("load offset {offset} does not fit 16 bits"),
            })?;
            let mut payload = Vec::with_capacity(chunk.len() + 5);
            payload.extend_from_slice(&offset.to_le_bytes());
            payload.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
            payload.push(self_test_id);
            payload.extend_from_slice(chunk);
            self.execute(
                Pip3CommandId::LoadSelfTestParam,
                &payload,
                CAP_LOAD_SELF_TEST_PARAM,
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn run_self_test(&mut self, self_test_id: u8) -> Result<(), CommandError> {
        self.execute(Pip3CommandId::RunSelfTest, &[self_test_id], CAP_NO_PAYLOAD)?;
        Ok(())
    }

    /// Fetch the results of the last run of a self-test.
    ///
    /// `capacity` bounds the whole response packet.
    pub fn get_self_test_results(
        &mut self,
        self_test_id: u8,
        capacity: usize,
    ) -> Result<SelfTestResults, CommandError> {
        let cmd = Pip3CommandId::GetSelfTestResults;
        let packet = self.execute(cmd, &[0x00, 0x00, 0xFF, 0xFF, self_test_id], capacity)?;
        let results = SelfTestResults::parse(response_payload(&packet))?;
        if results.self_test_id != self_test_id {
            return Err(CommandError::Malformed {
                command: cmd.name(),
                reason: format!(
                    "self-test id 0x{:02X} does not match the requested 0x{:02X}",
                    results.self_test_id, self_test_id
                ),
            });
        }
        verify_packet_crc(cmd.name(), &packet)?;
        Ok(results)
    }

    /// Arm async debug data mode; heatmaps then arrive unsolicited.
    pub fn start_tracking_heatmap(&mut self) -> Result<(), CommandError> {
        if let Some(mode) = self.async_mode {
            error!(
                armed_by = Pip3CommandId::name_of(mode.cmd_id),
                "Async debug data mode is already active"
            );
            return Err(CommandError::AsyncAlreadyActive);
        }
        let cmd = Pip3CommandId::StartTrackingHeatmap;
        self.execute(cmd, &[], CAP_NO_PAYLOAD)?;
        self.async_mode = Some(AsyncMode {
            cmd_id: cmd.as_u8(),
            seq: DEFAULT_SEQ,
        });
        Ok(())
    }

    pub fn stop_async_debug_data(&mut self) -> Result<(), CommandError> {
        self.execute(Pip3CommandId::StopAsyncDebugData, &[], CAP_NO_PAYLOAD)?;
        self.async_mode = None;
        Ok(())
    }

    /// Pull one unsolicited packet pushed in async debug data mode.
    ///
    /// `None` waits indefinitely.
    pub fn unsolicited_response(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, CommandError> {
        let mode = self.async_mode.ok_or(CommandError::AsyncNotActive)?;
        let expected = Expected {
            command: Pip3CommandId::name_of(mode.cmd_id),
            report_id: ReportId::UnsolicitedResponse,
            cmd_id: mode.cmd_id,
            seq: mode.seq,
        };
        self.read_packet(
            expected,
            PIP3_HEATMAP_PAYLOAD_MAX_LEN + RSP_MIN_LEN,
            timeout,
        )
    }
}

impl Default for Pip3Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashEngine for Pip3Engine {
    fn generation(&self) -> Generation {
        Generation::Gen3
    }

    fn file_open(&mut self, file_num: u8) -> Result<u8, CommandError> {
        let payload = self.query(Pip3CommandId::FileOpen, &[file_num], CAP_FILE_OPEN)?;
        payload.first().copied().ok_or_else(|| CommandError::Malformed {
            command: Pip3CommandId::FileOpen.name(),
            reason: "missing file handle".into(),
        })
    }

    fn file_close(&mut self, handle: u8) -> Result<(), CommandError> {
        self.execute(Pip3CommandId::FileClose, &[handle], CAP_NO_PAYLOAD)?;
        Ok(())
    }

    fn file_erase(&mut self, handle: u8) -> Result<(), CommandError> {
        self.execute(
            Pip3CommandId::FileIoctl,
            &[handle, FileIoctl::Erase as u8],
            CAP_NO_PAYLOAD,
        )?;
        Ok(())
    }

    fn file_read(&mut self, handle: u8, len: u16) -> Result<Vec<u8>, CommandError> {
        let cmd = Pip3CommandId::FileRead;
        let [lsb, msb] = len.to_le_bytes();
        let packet = self.execute(cmd, &[handle, lsb, msb], usize::from(len) + RSP_MIN_LEN)?;
        verify_packet_crc(cmd.name(), &packet)?;

        let end = RSP_PAYLOAD_START + usize::from(len);
        packet
            .get(RSP_PAYLOAD_START..end)
            .map(<[u8]>::to_vec)
            .ok_or(CommandError::ShortResponse {
                command: cmd.name(),
                expected: end + 2,
                actual: packet.len(),
            })
    }

    #[instrument(skip(self, data, progress), fields(len = data.len()))]
    fn file_write(
        &mut self,
        handle: u8,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<(), CommandError> {
        let total = data.len();
        let max_chunk = self.max_cmd_len().saturating_sub(PIP3_FILE_WRITE_OVERHEAD);
        write_chunks(
            Pip3CommandId::FileWrite.name(),
            data,
            max_chunk,
            |offset, chunk| {
                let mut payload = Vec::with_capacity(chunk.len() + 1);
                payload.push(handle);
                payload.extend_from_slice(chunk);
                self.execute(Pip3CommandId::FileWrite, &payload, CAP_NO_PAYLOAD)?;
                progress(offset + chunk.len(), total);
                Ok(())
            },
        )?;
        Ok(())
    }
}

/// Check one input report against what the engine is waiting for.
fn verify_report(expected: &Expected, report: &[u8]) -> Result<InputReportHeader, CommandError> {
    let command = expected.command;
    let header = InputReportHeader::from_bytes(report).map_err(CommandError::header(command))?;

    if header.report_id != expected.report_id.as_u8() {
        return Err(CommandError::ReportIdMismatch {
            command,
            expected: expected.report_id.as_u8(),
            actual: header.report_id,
        });
    }
    if !header.first_report {
        return Ok(header);
    }

    if report.len() <= HID_INPUT_STATUS_INDEX {
        return Err(CommandError::ShortResponse {
            command,
            expected: HID_INPUT_STATUS_INDEX + 1,
            actual: report.len(),
        });
    }
    let seq = SeqField::from_byte(report[HID_INPUT_PACKET_START + 2]);
    let cmd = CmdField::from_byte(report[HID_INPUT_PACKET_START + 3]);

    if cmd.id != expected.cmd_id {
        return Err(CommandError::CommandMismatch {
            command,
            actual: cmd.id,
            actual_name: Pip3CommandId::name_of(cmd.id),
        });
    }

    if expected.report_id == ReportId::SolicitedResponse {
        if seq.seq != expected.seq {
            return Err(CommandError::SequenceMismatch {
                command,
                expected: expected.seq,
                actual: seq.seq,
            });
        }
        if !cmd.response {
            return Err(CommandError::ResponseFlag {
                command,
                expected: true,
                actual: false,
            });
        }
        let status = report[HID_INPUT_STATUS_INDEX];
        if status != STATUS_SUCCESS {
            return Err(CommandError::Status {
                generation: Generation::Gen3,
                command,
                code: status,
                label: status_label(Generation::Gen3, status),
            });
        }
    } else if cmd.response {
        return Err(CommandError::ResponseFlag {
            command,
            expected: false,
            actual: true,
        });
    }
    Ok(header)
}
