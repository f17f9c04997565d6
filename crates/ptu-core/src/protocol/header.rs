//! Frame headers for the PIP2 and PIP3 protocols.
//!
//! The bit-packed fields (3-bit SEQ, TAG, MORE_DATA, 7-bit command id and the
//! RESP flag) are packed and unpacked with explicit masks so the byte layout
//! never depends on compiler bitfield rules.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::{
    MAX_SEQ_NUM, PIP2_CMD_REG_LSB, PIP2_CMD_REG_MSB, RSP_MIN_LEN, ReportId,
};
use super::crc::append_crc;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Sequence number must be <= 7 ({0} was given)")]
    InvalidSequence(u8),
    #[error("Frame of {0} bytes does not fit the 16-bit length field")]
    FrameTooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

const SEQ_MASK: u8 = 0x07;
const TAG_SHIFT: u8 = 3;
const MORE_DATA_SHIFT: u8 = 4;
const CMD_ID_MASK: u8 = 0x7F;
const RESP_SHIFT: u8 = 7;

/// The SEQ / TAG / MORE_DATA byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeqField {
    pub seq: u8,
    pub tag: bool,
    /// Only meaningful for PIP3.
    pub more_data: bool,
}

impl SeqField {
    pub fn new(seq: u8, tag: bool) -> Result<Self, HeaderError> {
        if seq > MAX_SEQ_NUM {
            return Err(HeaderError::InvalidSequence(seq));
        }
        Ok(Self {
            seq,
            tag,
            more_data: false,
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.seq & SEQ_MASK)
            | (u8::from(self.tag) << TAG_SHIFT)
            | (u8::from(self.more_data) << MORE_DATA_SHIFT)
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            seq: byte & SEQ_MASK,
            tag: byte & (1 << TAG_SHIFT) != 0,
            more_data: byte & (1 << MORE_DATA_SHIFT) != 0,
        }
    }
}

/// The command id / RESP byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdField {
    pub id: u8,
    pub response: bool,
}

impl CmdField {
    pub fn to_byte(self) -> u8 {
        (self.id & CMD_ID_MASK) | (u8::from(self.response) << RESP_SHIFT)
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            id: byte & CMD_ID_MASK,
            response: byte & (1 << RESP_SHIFT) != 0,
        }
    }
}

/// Build a PIP2 command frame.
///
/// `[reg_lsb, reg_msb, len_lsb, len_msb, seq, cmd, payload.., crc_msb, crc_lsb]`
/// where the length excludes the two register bytes and the CRC covers
/// everything after them.
pub fn encode_pip2_command(
    seq: SeqField,
    cmd_id: u8,
    payload: &[u8],
) -> Result<Vec<u8>, HeaderError> {
    let total = 2 + 4 + payload.len() + 2;
    let len = u16::try_from(total - 2).map_err(|_| HeaderError::FrameTooLarge(total))?;

    let mut frame = Vec::with_capacity(total);
    frame.write_u8(PIP2_CMD_REG_LSB)?;
    frame.write_u8(PIP2_CMD_REG_MSB)?;
    frame.write_u16::<LittleEndian>(len)?;
    frame.write_u8(seq.to_byte())?;
    frame.write_u8(
        CmdField {
            id: cmd_id,
            response: false,
        }
        .to_byte(),
    )?;
    frame.extend_from_slice(payload);
    append_crc(&mut frame, 2);
    Ok(frame)
}

/// Build a PIP3 command report.
///
/// `[report_id, len_lsb, len_msb, seq, cmd, payload.., crc_msb, crc_lsb]`
/// where the length excludes the report id and the CRC covers everything
/// after it.
pub fn encode_pip3_command(
    seq: SeqField,
    cmd_id: u8,
    payload: &[u8],
) -> Result<Vec<u8>, HeaderError> {
    let total = 1 + 4 + payload.len() + 2;
    let len = u16::try_from(total - 1).map_err(|_| HeaderError::FrameTooLarge(total))?;

    let mut frame = Vec::with_capacity(total);
    frame.write_u8(ReportId::Command.as_u8())?;
    frame.write_u16::<LittleEndian>(len)?;
    frame.write_u8(seq.to_byte())?;
    frame.write_u8(
        CmdField {
            id: cmd_id,
            response: false,
        }
        .to_byte(),
    )?;
    frame.extend_from_slice(payload);
    append_crc(&mut frame, 1);
    Ok(frame)
}

/// Header of a response packet (PIP2 frame, or reassembled PIP3 payload).
///
/// `[len_lsb, len_msb, seq, cmd, status, payload.., crc_msb, crc_lsb]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Declared packet length, including the length bytes and the CRC.
    pub len: u16,
    pub seq: SeqField,
    pub cmd: CmdField,
    pub status: u8,
}

impl ResponseHeader {
    pub const SIZE: usize = 5;

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < RSP_MIN_LEN {
            return Err(HeaderError::BufferTooSmall {
                expected: RSP_MIN_LEN,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            len: cursor.read_u16::<LittleEndian>()?,
            seq: SeqField::from_byte(cursor.read_u8()?),
            cmd: CmdField::from_byte(cursor.read_u8()?),
            status: cursor.read_u8()?,
        })
    }
}

/// The two leading bytes of a PIP3 HID input report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputReportHeader {
    pub report_id: u8,
    pub more_reports: bool,
    pub first_report: bool,
}

impl InputReportHeader {
    pub const SIZE: usize = 2;

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < Self::SIZE {
            return Err(HeaderError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            report_id: data[0],
            more_reports: data[1] & 0x01 != 0,
            first_report: data[1] & 0x02 != 0,
        })
    }

    pub fn flags_byte(more_reports: bool, first_report: bool) -> u8 {
        u8::from(more_reports) | (u8::from(first_report) << 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc::{crc16_ccitt, footer};

    #[test]
    fn test_seq_field_packing() {
        let seq = SeqField {
            seq: 5,
            tag: true,
            more_data: true,
        };
        assert_eq!(seq.to_byte(), 0b0001_1101);
        assert_eq!(SeqField::from_byte(0b0001_1101), seq);
        assert!(SeqField::new(8, true).is_err());
    }

    #[test]
    fn test_cmd_field_packing() {
        let cmd = CmdField::from_byte(0x93);
        assert_eq!(cmd.id, 0x13);
        assert!(cmd.response);
        assert_eq!(cmd.to_byte(), 0x93);
    }

    #[test]
    fn test_pip3_ping_matches_probe_frame() {
        let frame = encode_pip3_command(SeqField::new(0, true).unwrap(), 0x00, &[]).unwrap();
        assert_eq!(frame, [0x04, 0x06, 0x00, 0x08, 0x00, 0x2A, 0xF0]);
    }

    #[test]
    fn test_pip2_frame_layout() {
        let frame = encode_pip2_command(SeqField::new(0, true).unwrap(), 0x10, &[0x01]).unwrap();
        assert_eq!(&frame[..7], &[0x01, 0x01, 0x07, 0x00, 0x08, 0x10, 0x01]);
        assert_eq!(frame.len(), 9);
        assert_eq!(footer(&frame), Some(crc16_ccitt(&frame[2..7])));
    }

    #[test]
    fn test_response_header_parse() {
        let rsp = [0x08, 0x00, 0x08, 0x81, 0x00, 0x01, 0xAB, 0xCD];
        let header = ResponseHeader::from_bytes(&rsp).unwrap();
        assert_eq!(header.len, 8);
        assert_eq!(header.cmd.id, 0x01);
        assert!(header.cmd.response);
        assert_eq!(header.status, 0);

        assert!(ResponseHeader::from_bytes(&rsp[..6]).is_err());
    }

    #[test]
    fn test_input_report_flags() {
        let header = InputReportHeader::from_bytes(&[0x44, 0x03]).unwrap();
        assert!(header.more_reports);
        assert!(header.first_report);
        assert_eq!(InputReportHeader::flags_byte(false, true), 0x02);
    }
}
