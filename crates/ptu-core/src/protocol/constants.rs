//! Protocol constants shared by the PIP2 and PIP3 engines.

use std::time::Duration;

// ============================================================================
// Header fields
// ============================================================================

/// Highest sequence number that fits the 3-bit SEQ field.
pub const MAX_SEQ_NUM: u8 = 0x07;
/// Sequence number used for every command (one command in flight).
pub const DEFAULT_SEQ: u8 = 0x00;
/// TAG bit value set on every command.
pub const TAG_BIT: bool = true;

/// PIP2 command register, written ahead of every PIP2 command.
pub const PIP2_CMD_REG_LSB: u8 = 0x01;
pub const PIP2_CMD_REG_MSB: u8 = 0x01;

/// Minimum response length shared by both generations
/// (2 length + SEQ byte + CMD byte + status + 2 CRC).
pub const RSP_MIN_LEN: usize = 7;
/// Offset of the first payload byte inside a response packet.
pub const RSP_PAYLOAD_START: usize = 5;
/// Offset of the packet inside a PIP3 HID input report.
pub const HID_INPUT_PACKET_START: usize = 2;
/// Offset of the status byte inside a PIP3 HID input report.
pub const HID_INPUT_STATUS_INDEX: usize = HID_INPUT_PACKET_START + 4;

/// Longest PIP2 command the boot loader accepts.
pub const PIP2_MAX_CMD_LEN: usize = 255;
/// FILE_WRITE bytes that are not file data:
/// 2 register + 2 length + SEQ + CMD + handle + 2 CRC.
pub const PIP2_FILE_WRITE_OVERHEAD: usize = 9;
/// FILE_WRITE bytes that are not file data:
/// report id + 2 length + SEQ + CMD + handle + 2 CRC.
pub const PIP3_FILE_WRITE_OVERHEAD: usize = 8;
/// LOAD_SELF_TEST_PARAM bytes that are not parameter data.
pub const PIP3_LOAD_SELF_TEST_PARAM_OVERHEAD: usize = 12;
/// Largest heatmap payload pushed in async debug data mode.
pub const PIP3_HEATMAP_PAYLOAD_MAX_LEN: usize = 208;

/// Largest HID report the hidraw node is probed with.
pub const HID_MAX_REPORT_SIZE: usize = 0xFFFF;
/// Number of reports the background reader buffers.
pub const REPORT_BUFFER_CAPACITY: usize = 256;

// ============================================================================
// Timing
// ============================================================================

/// Average delay between sending a command and its response being ready.
pub const CMD_TO_RSP_DELAY: Duration = Duration::from_millis(5);
/// PIP2 FILE_IOCTL (erase) needs the flash to finish before replying.
pub const PIP2_ERASE_DELAY: Duration = Duration::from_secs(3);
/// PIP2 response timeout.
pub const PIP2_RSP_TIMEOUT: Duration = Duration::from_secs(3);
/// PIP3 per-report response timeout.
pub const PIP3_RSP_TIMEOUT: Duration = Duration::from_secs(7);
/// Settle time after a RESET or SWITCH_IMAGE command.
pub const RESET_DELAY: Duration = Duration::from_secs(2);
/// Settle time after SWITCH_ACTIVE_PROCESSOR.
pub const SWITCH_PROCESSOR_DELAY: Duration = Duration::from_millis(2);

/// Boot -> Scanning polling parameters.
pub const BOOT_TO_SCANNING_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const BOOT_TO_SCANNING_MAX_WAIT: Duration = Duration::from_millis(2000);
pub const BOOT_TO_SCANNING_INFO_INTERVAL: Duration = Duration::from_millis(1000);

/// Active processor switch polling parameters.
pub const PROCESSOR_SWITCH_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const PROCESSOR_SWITCH_MAX_WAIT: Duration = Duration::from_secs(5);
pub const PROCESSOR_SWITCH_INFO_INTERVAL: Duration = Duration::from_millis(1000);

// ============================================================================
// Flash files
// ============================================================================

/// File number of the primary firmware bin on the device.
pub const PRIMARY_FW_BIN_FILE_NUM: u8 = 0x01;
/// Upper bound on config files erased before writing an image.
pub const MAX_NUM_OF_FILES_TO_ERASE: usize = 10;

// ============================================================================
// HID report ids
// ============================================================================

/// Report identifiers found in byte 0 of every HID report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReportId {
    /// Matches every report when used as a reader filter.
    Any = 0x00,
    Finger = 0x01,
    Stylus = 0x02,
    Feature = 0x03,
    Command = 0x04,
    VendorFinger = 0x41,
    VendorStylus = 0x42,
    SolicitedResponse = 0x44,
    UnsolicitedResponse = 0x45,
}

impl ReportId {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether a report whose first byte is `id` passes this filter.
    pub fn accepts(self, id: u8) -> bool {
        self == ReportId::Any || self.as_u8() == id
    }
}

/// PIP3 SUSPEND_SCAN command used while probing the hidraw node.
pub const PROBE_SUSPEND_SCAN: [u8; 7] = [0x04, 0x06, 0x00, 0x08, 0x33, 0x2C, 0xC0];
/// PIP3 PING command used while probing the hidraw node.
pub const PROBE_PING: [u8; 7] = [0x04, 0x06, 0x00, 0x08, 0x00, 0x2A, 0xF0];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc::crc16_ccitt;

    #[test]
    fn test_probe_frames_carry_valid_crc() {
        for frame in [PROBE_SUSPEND_SCAN, PROBE_PING] {
            let crc = crc16_ccitt(&frame[1..5]);
            assert_eq!(crc.to_be_bytes(), [frame[5], frame[6]]);
        }
    }

    #[test]
    fn test_report_filter() {
        assert!(ReportId::Any.accepts(0x44));
        assert!(ReportId::SolicitedResponse.accepts(0x44));
        assert!(!ReportId::SolicitedResponse.accepts(0x45));
    }
}
