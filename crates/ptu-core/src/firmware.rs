//! Firmware bin header and version numbers.
//!
//! Every primary firmware bin starts with a 26-byte header. The same header
//! sits at the front of flash file 1 on the device, so it identifies both a
//! target image on disk and the image already programmed.

use std::fmt;
use std::io::Cursor;
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

use crate::pip3::Sysinfo;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Firmware bin header needs {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Header at the start of a primary firmware bin.
///
/// Multi-byte fields are big-endian.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FwBinHeader {
    pub header_len: u8,
    pub ttpid: u16,
    pub fw_major: u8,
    pub fw_minor: u8,
    pub fw_crc: u32,
    pub fw_rev_control: u32,
    pub silicon_id: u16,
    pub silicon_rev: u16,
    pub config_version: u16,
    pub encrypted_hex_file_len: u32,
}

impl FwBinHeader {
    pub const SIZE: usize = 26;

    pub fn parse(data: &[u8]) -> Result<Self, FirmwareError> {
        let too_short = |_| FirmwareError::TooShort {
            expected: Self::SIZE,
            actual: data.len(),
        };
        let mut rdr = Cursor::new(data);
        let header_len = rdr.read_u8().map_err(too_short)?;
        let ttpid = rdr.read_u16::<BigEndian>().map_err(too_short)?;
        let fw_major = rdr.read_u8().map_err(too_short)?;
        let fw_minor = rdr.read_u8().map_err(too_short)?;
        let fw_crc = rdr.read_u32::<BigEndian>().map_err(too_short)?;
        let fw_rev_control = rdr.read_u32::<BigEndian>().map_err(too_short)?;
        let silicon_id = rdr.read_u16::<BigEndian>().map_err(too_short)?;
        let silicon_rev = rdr.read_u16::<BigEndian>().map_err(too_short)?;
        let config_version = rdr.read_u16::<BigEndian>().map_err(too_short)?;
        let encrypted_hex_file_len = rdr.read_u32::<BigEndian>().map_err(too_short)?;

        Ok(Self {
            header_len,
            ttpid,
            fw_major,
            fw_minor,
            fw_crc,
            fw_rev_control,
            silicon_id,
            silicon_rev,
            config_version,
            encrypted_hex_file_len,
        })
    }

    /// Read the header from the start of a bin file.
    pub fn from_file(path: &Path) -> Result<Self, FirmwareError> {
        let data = std::fs::read(path).map_err(|source| FirmwareError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&data)
    }
}

/// `major.minor.rev_control.config_ver`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FwVersion {
    pub major: u8,
    pub minor: u8,
    pub rev_control: u32,
    pub config_ver: u16,
}

impl FwVersion {
    /// Shown when the active firmware cannot be queried.
    pub const UNKNOWN: FwVersion = FwVersion {
        major: 0,
        minor: 0,
        rev_control: 0,
        config_ver: 0,
    };

    pub fn from_sysinfo(info: &Sysinfo) -> Self {
        Self {
            major: info.fw_major,
            minor: info.fw_minor,
            rev_control: info.fw_rev_control,
            config_ver: info.fw_config_version,
        }
    }

    pub fn from_bin_header(header: &FwBinHeader) -> Self {
        Self {
            major: header.fw_major,
            minor: header.fw_minor,
            rev_control: header.fw_rev_control,
            config_ver: header.config_version,
        }
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.rev_control, self.config_ver
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Vec<u8> {
        let mut data = vec![
            0x19, // header_len
            0x12, 0x34, // ttpid
            0x03, 0x01, // major, minor
            0xDE, 0xAD, 0xBE, 0xEF, // fw_crc
            0x00, 0x01, 0x02, 0x03, // fw_rev_control
            0x0E, 0x9B, // silicon_id
            0x00, 0x02, // silicon_rev
            0x00, 0x2A, // config_version
            0x00, 0x00, 0x10, 0x00, // encrypted_hex_file_len
        ];
        data.extend_from_slice(&[0xFF; 3]);
        data
    }

    #[test]
    fn test_parse_bin_header() {
        let header = FwBinHeader::parse(&sample_header()).unwrap();
        assert_eq!(header.ttpid, 0x1234);
        assert_eq!(header.fw_crc, 0xDEAD_BEEF);
        assert_eq!(header.fw_rev_control, 0x0001_0203);
        assert_eq!(header.silicon_id, 0x0E9B);
        assert_eq!(header.config_version, 42);
        assert_eq!(header.encrypted_hex_file_len, 0x1000);
    }

    #[test]
    fn test_bin_header_too_short() {
        assert!(matches!(
            FwBinHeader::parse(&[0u8; 25]),
            Err(FirmwareError::TooShort {
                expected: 26,
                actual: 25
            })
        ));
    }

    #[test]
    fn test_version_from_bin_header() {
        let header = FwBinHeader::parse(&sample_header()).unwrap();
        let version = FwVersion::from_bin_header(&header);
        assert_eq!(version.to_string(), "3.1.66051.42");
        assert!(!version.is_unknown());
        assert!(FwVersion::UNKNOWN.is_unknown());
    }

    #[test]
    fn test_version_ordering() {
        let old = FwVersion {
            major: 3,
            minor: 1,
            rev_control: 100,
            config_ver: 1,
        };
        let new = FwVersion {
            rev_control: 101,
            ..old
        };
        assert!(new > old);
    }
}
