//! Device model values carried in STATUS and VERSION responses.

use std::fmt;

/// Where the touch processor is executing from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Boot ROM (boot loader).
    Rom,
    /// Application firmware in RAM.
    Ram,
}

impl ExecMode {
    pub fn from_bit(bit: u8) -> Self {
        if bit & 0x01 == 0 { ExecMode::Rom } else { ExecMode::Ram }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::Rom => write!(f, "ROM"),
            ExecMode::Ram => write!(f, "RAM"),
        }
    }
}

/// Application firmware operating sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysMode {
    Boot,
    Scanning,
    DeepSleep,
    TestConfig,
    DeepStandby,
    SecondaryImage,
    Unknown(u8),
}

impl SysMode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => SysMode::Boot,
            0x01 => SysMode::Scanning,
            0x02 => SysMode::DeepSleep,
            0x03 => SysMode::TestConfig,
            0x04 => SysMode::DeepStandby,
            0x05 => SysMode::SecondaryImage,
            other => SysMode::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SysMode::Boot => 0x00,
            SysMode::Scanning => 0x01,
            SysMode::DeepSleep => 0x02,
            SysMode::TestConfig => 0x03,
            SysMode::DeepStandby => 0x04,
            SysMode::SecondaryImage => 0x05,
            SysMode::Unknown(v) => v,
        }
    }
}

impl fmt::Display for SysMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SysMode::Boot => write!(f, "Bootup mode"),
            SysMode::Scanning => write!(f, "Scanning mode"),
            SysMode::DeepSleep => write!(f, "Deep sleep mode"),
            SysMode::TestConfig => write!(f, "Test and configuration mode"),
            SysMode::DeepStandby => write!(f, "Deep standby"),
            SysMode::SecondaryImage => write!(f, "Secondary image mode"),
            SysMode::Unknown(v) => write!(f, "Unknown system mode 0x{:02X}", v),
        }
    }
}

/// Physical processor currently answering PIP3 commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    Primary,
    AuxMcu,
    Unknown(u8),
}

impl Processor {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Processor::Primary,
            0x01 => Processor::AuxMcu,
            other => Processor::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Processor::Primary => 0x00,
            Processor::AuxMcu => 0x01,
            Processor::Unknown(v) => v,
        }
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Processor::Primary => write!(f, "Primary"),
            Processor::AuxMcu => write!(f, "AUX MCU"),
            Processor::Unknown(v) => write!(f, "Unknown processor 0x{:02X}", v),
        }
    }
}

/// Firmware image category reported by VERSION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwCategory {
    Touch,
    Programmer,
    Utility,
    Unknown(u8),
}

impl FwCategory {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FwCategory::Touch,
            0x01 => FwCategory::Programmer,
            0x02 => FwCategory::Utility,
            other => FwCategory::Unknown(other),
        }
    }
}

impl fmt::Display for FwCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FwCategory::Touch => write!(f, "Touch"),
            FwCategory::Programmer => write!(f, "Programmer"),
            FwCategory::Utility => write!(f, "Utility"),
            FwCategory::Unknown(v) => write!(f, "Unknown category 0x{:02X}", v),
        }
    }
}

/// Image selector for SWITCH_IMAGE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageId {
    Primary = 0x00,
    Secondary = 0x01,
    RomBootloader = 0x02,
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageId::Primary => write!(f, "Primary"),
            ImageId::Secondary => write!(f, "Secondary"),
            ImageId::RomBootloader => write!(f, "ROM Bootloader"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sys_mode_labels() {
        assert_eq!(SysMode::from_u8(1), SysMode::Scanning);
        assert_eq!(SysMode::Scanning.to_string(), "Scanning mode");
        assert_eq!(SysMode::from_u8(9), SysMode::Unknown(9));
        assert_eq!(SysMode::Unknown(9).as_u8(), 9);
    }

    #[test]
    fn test_exec_mode_bit() {
        assert_eq!(ExecMode::from_bit(0x03), ExecMode::Ram);
        assert_eq!(ExecMode::from_bit(0x02), ExecMode::Rom);
    }
}
