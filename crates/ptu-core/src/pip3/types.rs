//! Decoded PIP3 response payloads.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Cursor, Read};

use crate::engine::CommandError;
use crate::protocol::{ExecMode, FwCategory, Pip3CommandId, Processor, SysMode};
use crate::self_test::{DataFormat, DataUnit};

fn too_short(cmd: Pip3CommandId, need: usize, got: usize) -> CommandError {
    CommandError::Malformed {
        command: cmd.name(),
        reason: format!("{got} payload bytes, need {need}"),
    }
}

fn malformed(cmd: Pip3CommandId) -> impl FnOnce(io::Error) -> CommandError {
    move |e| CommandError::Malformed {
        command: cmd.name(),
        reason: e.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pip3Status {
    pub exec: ExecMode,
    pub active_processor: Processor,
    pub sys_mode: SysMode,
    pub protocol_mode: u8,
}

impl Pip3Status {
    pub const PAYLOAD_LEN: usize = 4;

    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        if payload.len() < Self::PAYLOAD_LEN {
            return Err(too_short(
                Pip3CommandId::Status,
                Self::PAYLOAD_LEN,
                payload.len(),
            ));
        }
        Ok(Self {
            exec: ExecMode::from_bit(payload[0]),
            active_processor: Processor::from_u8((payload[0] >> 1) & 0x03),
            sys_mode: SysMode::from_u8(payload[1]),
            protocol_mode: payload[2] & 0x07,
        })
    }
}

/// VERSION response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pip3Version {
    pub pip_major: u8,
    pub pip_minor: u8,
    pub fw_major: u8,
    pub fw_minor: u8,
    pub fw_rev_control: u32,
    pub category: FwCategory,
    pub fw_uid: u8,
    pub chip_rev: u16,
    pub chip_id: u16,
    pub silicon_uid: [u8; 12],
}

impl Pip3Version {
    pub const PAYLOAD_LEN: usize = 26;

    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        let cmd = Pip3CommandId::Version;
        if payload.len() < Self::PAYLOAD_LEN {
            return Err(too_short(cmd, Self::PAYLOAD_LEN, payload.len()));
        }
        let mut rdr = Cursor::new(payload);
        let pip_minor = rdr.read_u8().map_err(malformed(cmd))?;
        let pip_major = rdr.read_u8().map_err(malformed(cmd))?;
        let fw_minor = rdr.read_u8().map_err(malformed(cmd))?;
        let fw_major = rdr.read_u8().map_err(malformed(cmd))?;
        let fw_rev_control = rdr.read_u32::<LittleEndian>().map_err(malformed(cmd))?;
        let category = FwCategory::from_u8(rdr.read_u8().map_err(malformed(cmd))? >> 4);
        let fw_uid = rdr.read_u8().map_err(malformed(cmd))?;
        let chip_rev = rdr.read_u16::<LittleEndian>().map_err(malformed(cmd))?;
        let chip_id = rdr.read_u16::<LittleEndian>().map_err(malformed(cmd))?;
        let mut silicon_uid = [0u8; 12];
        rdr.read_exact(&mut silicon_uid).map_err(malformed(cmd))?;

        Ok(Self {
            pip_major,
            pip_minor,
            fw_major,
            fw_minor,
            fw_rev_control,
            category,
            fw_uid,
            chip_rev,
            chip_id,
            silicon_uid,
        })
    }
}

/// GET_SYSINFO response: firmware identity and panel geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysinfo {
    pub pip_major: u8,
    pub pip_minor: u8,
    pub product_id: u16,
    pub fw_major: u8,
    pub fw_minor: u8,
    pub fw_rev_control: u32,
    pub fw_config_version: u16,
    pub bl_major: u8,
    pub bl_minor: u8,
    pub family_id: u8,
    pub revision_id: u8,
    pub silicon_id: u16,
    pub mfg_id: [u8; 8],
    pub post_result: u16,
    pub electrodes_x: u8,
    pub electrodes_y: u8,
    pub panel_x_len: u16,
    pub panel_y_len: u16,
    pub panel_x_res: u16,
    pub panel_y_res: u16,
    pub pressure_res: u16,
    pub max_touch_records: u8,
}

impl Sysinfo {
    pub const PAYLOAD_LEN: usize = 49;

    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        let cmd = Pip3CommandId::GetSysinfo;
        if payload.len() < Self::PAYLOAD_LEN {
            return Err(too_short(cmd, Self::PAYLOAD_LEN, payload.len()));
        }
        let mut rdr = Cursor::new(payload);
        let pip_major = rdr.read_u8().map_err(malformed(cmd))?;
        let pip_minor = rdr.read_u8().map_err(malformed(cmd))?;
        let product_id = rdr.read_u16::<LittleEndian>().map_err(malformed(cmd))?;
        let fw_major = rdr.read_u8().map_err(malformed(cmd))?;
        let fw_minor = rdr.read_u8().map_err(malformed(cmd))?;
        let fw_rev_control = rdr.read_u32::<LittleEndian>().map_err(malformed(cmd))?;
        let fw_config_version = rdr.read_u16::<LittleEndian>().map_err(malformed(cmd))?;
        let bl_major = rdr.read_u8().map_err(malformed(cmd))?;
        let bl_minor = rdr.read_u8().map_err(malformed(cmd))?;
        let family_id = rdr.read_u8().map_err(malformed(cmd))?;
        let revision_id = rdr.read_u8().map_err(malformed(cmd))?;
        let silicon_id = rdr.read_u16::<LittleEndian>().map_err(malformed(cmd))?;
        let mut mfg_id = [0u8; 8];
        rdr.read_exact(&mut mfg_id).map_err(malformed(cmd))?;
        let post_result = rdr.read_u16::<LittleEndian>().map_err(malformed(cmd))?;
        let electrodes_x = rdr.read_u8().map_err(malformed(cmd))?;
        let electrodes_y = rdr.read_u8().map_err(malformed(cmd))?;
        let panel_x_len = rdr.read_u16::<LittleEndian>().map_err(malformed(cmd))?;
        let panel_y_len = rdr.read_u16::<LittleEndian>().map_err(malformed(cmd))?;
        let panel_x_res = rdr.read_u16::<LittleEndian>().map_err(malformed(cmd))?;
        let panel_y_res = rdr.read_u16::<LittleEndian>().map_err(malformed(cmd))?;
        let pressure_res = rdr.read_u16::<LittleEndian>().map_err(malformed(cmd))?;
        // Orientation, panel id, button and scan-type bit fields.
        rdr.set_position(rdr.position() + 5);
        let max_touch_records = rdr.read_u8().map_err(malformed(cmd))?;

        Ok(Self {
            pip_major,
            pip_minor,
            product_id,
            fw_major,
            fw_minor,
            fw_rev_control,
            fw_config_version,
            bl_major,
            bl_minor,
            family_id,
            revision_id,
            silicon_id,
            mfg_id,
            post_result,
            electrodes_x,
            electrodes_y,
            panel_x_len,
            panel_y_len,
            panel_x_res,
            panel_y_res,
            pressure_res,
            max_touch_records,
        })
    }
}

/// GET_SELF_TEST_RESULTS response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfTestResults {
    pub self_test_id: u8,
    pub format: DataFormat,
    pub unit: DataUnit,
    pub data: Vec<u8>,
}

impl SelfTestResults {
    /// Bytes before the result data.
    pub const PREFIX_LEN: usize = 4;

    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        let cmd = Pip3CommandId::GetSelfTestResults;
        if payload.len() < Self::PREFIX_LEN {
            return Err(too_short(cmd, Self::PREFIX_LEN, payload.len()));
        }
        let arl = usize::from(u16::from_le_bytes([payload[2], payload[3]]));
        let data = payload
            .get(Self::PREFIX_LEN..Self::PREFIX_LEN + arl)
            .ok_or_else(|| too_short(cmd, Self::PREFIX_LEN + arl, payload.len()))?;
        Ok(Self {
            self_test_id: payload[0],
            format: DataFormat::from_u8(payload[1] & 0x0F),
            unit: DataUnit::from_u8(payload[1] >> 4),
            data: data.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_fields() {
        let status = Pip3Status::parse(&[0x03, 0x05, 0x02, 0x00]).unwrap();
        assert_eq!(status.exec, ExecMode::Ram);
        assert_eq!(status.active_processor, Processor::AuxMcu);
        assert_eq!(status.sys_mode, SysMode::SecondaryImage);
        assert_eq!(status.protocol_mode, 2);
    }

    #[test]
    fn test_version_category_nibble() {
        let mut payload = vec![0u8; Pip3Version::PAYLOAD_LEN];
        payload[0] = 0x01;
        payload[1] = 0x03;
        payload[3] = 0x02;
        payload[4..8].copy_from_slice(&0x0012_3456u32.to_le_bytes());
        payload[8] = 0x10;
        let version = Pip3Version::parse(&payload).unwrap();
        assert_eq!(version.pip_major, 3);
        assert_eq!(version.fw_major, 2);
        assert_eq!(version.fw_rev_control, 0x0012_3456);
        assert_eq!(version.category, FwCategory::Programmer);
    }

    #[test]
    fn test_version_too_short() {
        assert!(matches!(
            Pip3Version::parse(&[0u8; 10]),
            Err(CommandError::Malformed { .. })
        ));
    }

    #[test]
    fn test_sysinfo_offsets() {
        let mut payload = vec![0u8; Sysinfo::PAYLOAD_LEN];
        payload[4] = 3;
        payload[5] = 1;
        payload[6..10].copy_from_slice(&1234u32.to_le_bytes());
        payload[10..12].copy_from_slice(&7u16.to_le_bytes());
        payload[28] = 32;
        payload[45] = 10;
        let info = Sysinfo::parse(&payload).unwrap();
        assert_eq!((info.fw_major, info.fw_minor), (3, 1));
        assert_eq!(info.fw_rev_control, 1234);
        assert_eq!(info.fw_config_version, 7);
        assert_eq!(info.electrodes_x, 32);
        assert_eq!(info.max_touch_records, 10);
    }

    #[test]
    fn test_self_test_results() {
        let payload = [0x05, 0x21, 0x04, 0x00, 1, 2, 3, 4];
        let results = SelfTestResults::parse(&payload).unwrap();
        assert_eq!(results.format, DataFormat::TwoByteUnsignedPlusExtra);
        assert_eq!(results.unit, DataUnit::Counts);
        assert_eq!(results.data, vec![1, 2, 3, 4]);

        assert!(SelfTestResults::parse(&[0x05, 0x00, 0x09, 0x00, 1]).is_err());
    }
}
