//! Pieces shared by the PIP2 and PIP3 command engines.

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use crate::protocol::constants::{
    CMD_TO_RSP_DELAY, PIP2_ERASE_DELAY, PIP2_RSP_TIMEOUT, PIP3_RSP_TIMEOUT, RESET_DELAY,
    RSP_MIN_LEN, RSP_PAYLOAD_START, SWITCH_PROCESSOR_DELAY,
};
use crate::protocol::crc::{crc16_ccitt, footer};
use crate::protocol::{Generation, HeaderError};
use crate::transport::{ChannelKind, TransportError};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{command}: {source}")]
    Transport {
        command: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Timed out waiting for the {command} response")]
    Timeout { command: &'static str },

    #[error("No {command} response: the report reader has stopped")]
    NoResponse { command: &'static str },

    #[error("{command} response is {actual} bytes, shorter than the {expected}-byte minimum")]
    ShortResponse {
        command: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{command} response CRC mismatch: received 0x{received:04X}, calculated 0x{calculated:04X}")]
    CrcMismatch {
        command: &'static str,
        received: u16,
        calculated: u16,
    },

    #[error("Expected a {command} response but got one for {actual_name} (0x{actual:02X})")]
    CommandMismatch {
        command: &'static str,
        actual: u8,
        actual_name: &'static str,
    },

    #[error("{command} response sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch {
        command: &'static str,
        expected: u8,
        actual: u8,
    },

    #[error("{command} response flag is {actual}, expected {expected}")]
    ResponseFlag {
        command: &'static str,
        expected: bool,
        actual: bool,
    },

    #[error("{command} response arrived in report 0x{actual:02X}, expected 0x{expected:02X}")]
    ReportIdMismatch {
        command: &'static str,
        expected: u8,
        actual: u8,
    },

    #[error("{generation} {command} failed with status 0x{code:02X} ({label})")]
    Status {
        generation: Generation,
        command: &'static str,
        code: u8,
        label: &'static str,
    },

    #[error("{command} response declares {declared} bytes, more than the {capacity} bytes supported")]
    CapacityExceeded {
        command: &'static str,
        declared: usize,
        capacity: usize,
    },

    #[error("{command} response carried {received} bytes, more than the {declared} declared")]
    Overrun {
        command: &'static str,
        declared: usize,
        received: usize,
    },

    #[error("{command} response is malformed: {reason}")]
    Malformed {
        command: &'static str,
        reason: String,
    },

    #[error("{command}: {source}")]
    Header {
        command: &'static str,
        #[source]
        source: HeaderError,
    },

    #[error("{command}: {reason}")]
    InvalidArgument {
        command: &'static str,
        reason: String,
    },

    #[error("Async debug data mode is already active")]
    AsyncAlreadyActive,

    #[error("Async debug data mode is not active")]
    AsyncNotActive,

    #[error("The {generation} API is not active")]
    NotActive { generation: Generation },

    #[error("The {generation} API is already using the {active} channel, not {requested}")]
    ChannelConflict {
        generation: Generation,
        active: ChannelKind,
        requested: ChannelKind,
    },
}

impl CommandError {
    /// The device could not be talked to at all (as opposed to answering badly).
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            CommandError::Transport { .. }
                | CommandError::Timeout { .. }
                | CommandError::NoResponse { .. }
                | CommandError::NotActive { .. }
        )
    }

    /// The device answered with a non-success status code.
    pub fn is_status_failure(&self) -> bool {
        matches!(self, CommandError::Status { .. })
    }

    pub(crate) fn transport(command: &'static str) -> impl FnOnce(TransportError) -> Self {
        move |source| CommandError::Transport { command, source }
    }

    pub(crate) fn header(command: &'static str) -> impl FnOnce(HeaderError) -> Self {
        move |source| CommandError::Header { command, source }
    }
}

/// Delays and timeouts an engine applies around each command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Pause between sending a command and reading its response.
    pub cmd_to_rsp: Duration,
    /// Pause before reading a FILE_IOCTL (erase) response.
    pub erase: Duration,
    /// Settle time after commands that restart or swap the firmware.
    pub reset: Duration,
    /// Settle time after switching the active processor.
    pub switch_processor: Duration,
    /// How long to wait for each response frame.
    pub rsp_timeout: Duration,
}

impl Timing {
    pub fn pip2() -> Self {
        Self {
            cmd_to_rsp: CMD_TO_RSP_DELAY,
            erase: PIP2_ERASE_DELAY,
            reset: RESET_DELAY,
            switch_processor: SWITCH_PROCESSOR_DELAY,
            rsp_timeout: PIP2_RSP_TIMEOUT,
        }
    }

    pub fn pip3() -> Self {
        Self {
            cmd_to_rsp: CMD_TO_RSP_DELAY,
            erase: CMD_TO_RSP_DELAY,
            reset: RESET_DELAY,
            switch_processor: SWITCH_PROCESSOR_DELAY,
            rsp_timeout: PIP3_RSP_TIMEOUT,
        }
    }

    /// No pauses at all; for scripted transports.
    pub fn immediate() -> Self {
        Self {
            cmd_to_rsp: Duration::ZERO,
            erase: Duration::ZERO,
            reset: Duration::ZERO,
            switch_processor: Duration::ZERO,
            rsp_timeout: Duration::from_millis(10),
        }
    }
}

/// File operations a flash loader offers, independent of protocol generation.
pub trait FlashEngine {
    fn generation(&self) -> Generation;

    /// Open a file by number and return its handle.
    fn file_open(&mut self, file_num: u8) -> Result<u8, CommandError>;

    fn file_close(&mut self, handle: u8) -> Result<(), CommandError>;

    fn file_erase(&mut self, handle: u8) -> Result<(), CommandError>;

    fn file_read(&mut self, handle: u8, len: u16) -> Result<Vec<u8>, CommandError>;

    /// Write `data` in as many FILE_WRITE commands as needed.
    /// `progress` receives (bytes written, total bytes) after each chunk.
    fn file_write(
        &mut self,
        handle: u8,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<(), CommandError>;
}

/// Split `data` into chunks of at most `max_chunk` bytes and hand each to
/// `write`, stopping at the first failure.
///
/// Returns the number of chunks written.
pub fn write_chunks<F>(
    command: &'static str,
    data: &[u8],
    max_chunk: usize,
    mut write: F,
) -> Result<usize, CommandError>
where
    F: FnMut(usize, &[u8]) -> Result<(), CommandError>,
{
    if max_chunk == 0 {
        return Err(CommandError::InvalidArgument {
            command,
            reason: "command length leaves no room for data".into(),
        });
    }

    let total = data.len().div_ceil(max_chunk);
    for (index, chunk) in data.chunks(max_chunk).enumerate() {
        if let Err(e) = write(index * max_chunk, chunk) {
            error!(
                command,
                skipped = total - index - 1,
                "Aborting the remaining {} commands pending execution",
                command
            );
            return Err(e);
        }
        debug!(command, remaining = total - index - 1, "Chunk written");
    }
    Ok(total)
}

/// Recompute the CRC over the declared packet and compare it with the footer.
pub fn verify_packet_crc(command: &'static str, packet: &[u8]) -> Result<(), CommandError> {
    let declared = packet
        .get(..2)
        .map(|b| usize::from(u16::from_le_bytes([b[0], b[1]])))
        .unwrap_or_default();
    let body = match packet.get(..declared) {
        Some(body) if declared >= RSP_MIN_LEN => body,
        _ => {
            return Err(CommandError::ShortResponse {
                command,
                expected: declared.max(RSP_MIN_LEN),
                actual: packet.len(),
            });
        }
    };
    let calculated = crc16_ccitt(&body[..declared - 2]);
    let received = footer(body).unwrap_or_default();
    if received != calculated {
        return Err(CommandError::CrcMismatch {
            command,
            received,
            calculated,
        });
    }
    Ok(())
}

/// Bytes between the response header and the CRC footer.
pub fn response_payload(packet: &[u8]) -> &[u8] {
    let end = packet
        .get(..2)
        .map(|b| usize::from(u16::from_le_bytes([b[0], b[1]])))
        .unwrap_or_default()
        .min(packet.len());
    packet
        .get(RSP_PAYLOAD_START..end.saturating_sub(2))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_chunks_sizes() {
        let data = vec![0xA5u8; 700];
        let mut sizes = Vec::new();
        let count = write_chunks("FILE_WRITE", &data, 255, |_, chunk| {
            sizes.push(chunk.len());
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(sizes, [255, 255, 190]);
    }

    #[test]
    fn test_write_chunks_aborts_on_failure() {
        let data = vec![0u8; 700];
        let mut offsets = Vec::new();
        let result = write_chunks("FILE_WRITE", &data, 255, |offset, _| {
            offsets.push(offset);
            if offsets.len() == 2 {
                Err(CommandError::Timeout {
                    command: "FILE_WRITE",
                })
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(CommandError::Timeout { .. })));
        assert_eq!(offsets, [0, 255]);
    }

    #[test]
    fn test_write_chunks_rejects_zero_chunk() {
        assert!(write_chunks("FILE_WRITE", &[1, 2, 3], 0, |_, _| Ok(())).is_err());
    }

    #[test]
    fn test_error_classification() {
        let timeout = CommandError::Timeout { command: "STATUS" };
        assert!(timeout.is_unreachable());
        assert!(!timeout.is_status_failure());

        let status = CommandError::Status {
            generation: Generation::Gen3,
            command: "VERSION",
            code: 0x1C,
            label: "Incorrect System Mode to Execute Command",
        };
        assert!(status.is_status_failure());
        assert!(!status.is_unreachable());
        assert_eq!(
            status.to_string(),
            "PIP3 VERSION failed with status 0x1C (Incorrect System Mode to Execute Command)"
        );
    }
}
