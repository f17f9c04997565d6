//! Firmware self-test identifiers and result decoding.

use std::fmt;

/// Self-tests the application firmware can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SelfTestId {
    Bist = 0x01,
    Shorts = 0x02,
    Opens = 0x03,
    ShortsNoMasks = 0x04,
    CmPanel = 0x05,
    CpPanel = 0x06,
    CmButtons = 0x07,
    CpButtons = 0x08,
    Force = 0x09,
    OpenHiz = 0x0A,
    OpenGnd = 0x0B,
    CpLftMode = 0x0C,
    NoiseSc = 0x0D,
    NoiseLft = 0x0E,
    CpChipRouting = 0x0F,
    NormRawCountsPanel = 0x10,
    NormRawCountsLftMode = 0x11,
    NoiseMc = 0x12,
    SensorCaNoise = 0x13,
    TouchPanelEnabled = 0x14,
}

impl SelfTestId {
    pub const ALL: [SelfTestId; 20] = [
        SelfTestId::Bist,
        SelfTestId::Shorts,
        SelfTestId::Opens,
        SelfTestId::ShortsNoMasks,
        SelfTestId::CmPanel,
        SelfTestId::CpPanel,
        SelfTestId::CmButtons,
        SelfTestId::CpButtons,
        SelfTestId::Force,
        SelfTestId::OpenHiz,
        SelfTestId::OpenGnd,
        SelfTestId::CpLftMode,
        SelfTestId::NoiseSc,
        SelfTestId::NoiseLft,
        SelfTestId::CpChipRouting,
        SelfTestId::NormRawCountsPanel,
        SelfTestId::NormRawCountsLftMode,
        SelfTestId::NoiseMc,
        SelfTestId::SensorCaNoise,
        SelfTestId::TouchPanelEnabled,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_u8() == value)
    }

    pub fn name(self) -> &'static str {
        match self {
            SelfTestId::Bist => "BIST (Built In Self-Test)",
            SelfTestId::Shorts => "Shorts",
            SelfTestId::Opens => "Opens",
            SelfTestId::ShortsNoMasks => "Shorts test no masks",
            SelfTestId::CmPanel => "CM panel (mutual cap)",
            SelfTestId::CpPanel => "CP panel (self cap)",
            SelfTestId::CmButtons => "CM buttons",
            SelfTestId::CpButtons => "CP buttons",
            SelfTestId::Force => "Force",
            SelfTestId::OpenHiz => "Open-HIZ test",
            SelfTestId::OpenGnd => "Open-GND test",
            SelfTestId::CpLftMode => "CP - LFT Mode",
            SelfTestId::NoiseSc => "Noise test for SC",
            SelfTestId::NoiseLft => "Noise test for LFT",
            SelfTestId::CpChipRouting => "CP - chip routing parasitic capacitance",
            SelfTestId::NormRawCountsPanel => "Normalized raw counts for panel",
            SelfTestId::NormRawCountsLftMode => "Normalized raw counts for LFT mode",
            SelfTestId::NoiseMc => "Noise test for MC",
            SelfTestId::SensorCaNoise => "Sensor CA noise",
            SelfTestId::TouchPanelEnabled => "Touch panel enabled",
        }
    }
}

impl fmt::Display for SelfTestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Layout of the values in a GET_SELF_TEST_RESULTS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    TwoByteUnsigned,
    /// Unsigned words followed by the average from the last calibration.
    TwoByteUnsignedPlusExtra,
    TwoByteSigned,
    Unknown(u8),
}

impl DataFormat {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => DataFormat::TwoByteUnsigned,
            0x1 => DataFormat::TwoByteUnsignedPlusExtra,
            0x2 => DataFormat::TwoByteSigned,
            other => DataFormat::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataUnit {
    Nanoamps,
    HundredthsOfPicofarad,
    Counts,
    PassOrFail,
    Unknown(u8),
}

impl DataUnit {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => DataUnit::Nanoamps,
            0x1 => DataUnit::HundredthsOfPicofarad,
            0x2 => DataUnit::Counts,
            0x3 => DataUnit::PassOrFail,
            other => DataUnit::Unknown(other),
        }
    }
}

impl fmt::Display for DataUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataUnit::Nanoamps => write!(f, "nA"),
            DataUnit::HundredthsOfPicofarad => write!(f, "0.01 pF"),
            DataUnit::Counts => write!(f, "counts"),
            DataUnit::PassOrFail => write!(f, "pass/fail"),
            DataUnit::Unknown(v) => write!(f, "unit 0x{:X}", v),
        }
    }
}

/// How the caller wants result bytes turned into values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// One byte per value.
    U8,
    /// One little-endian word per value.
    U16,
}

impl OutputFormat {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(OutputFormat::U8),
            2 => Some(OutputFormat::U16),
            _ => None,
        }
    }

    pub fn bytes_per_value(self) -> usize {
        match self {
            OutputFormat::U8 => 1,
            OutputFormat::U16 => 2,
        }
    }
}

/// Number of result bytes to expect for `values` values.
pub fn expected_byte_count(values: usize, output: OutputFormat, format: DataFormat) -> usize {
    let mut bytes = values * output.bytes_per_value();
    if format == DataFormat::TwoByteUnsignedPlusExtra {
        bytes += 2;
    }
    bytes
}

/// Decode raw result bytes into values.
///
/// Words are little-endian; with `signed` they are sign-extended from 16
/// bits. A trailing odd byte in word mode is ignored.
pub fn decode_values(data: &[u8], output: OutputFormat, signed: bool) -> Vec<i32> {
    match output {
        OutputFormat::U8 => data.iter().map(|&b| i32::from(b)).collect(),
        OutputFormat::U16 => data
            .chunks_exact(2)
            .map(|w| {
                let word = u16::from_le_bytes([w[0], w[1]]);
                if signed {
                    i32::from(word as i16)
                } else {
                    i32::from(word)
                }
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_test_ids() {
        assert_eq!(SelfTestId::from_u8(0x05), Some(SelfTestId::CmPanel));
        assert_eq!(SelfTestId::from_u8(0x00), None);
        assert_eq!(SelfTestId::Bist.to_string(), "BIST (Built In Self-Test)");
    }

    #[test]
    fn test_decode_signed_words() {
        let data = [0xFF, 0xFF, 0x10, 0x00];
        assert_eq!(decode_values(&data, OutputFormat::U16, true), vec![-1, 16]);
        assert_eq!(
            decode_values(&data, OutputFormat::U16, false),
            vec![0xFFFF, 16]
        );
        assert_eq!(decode_values(&data, OutputFormat::U8, false).len(), 4);
    }

    #[test]
    fn test_expected_byte_count() {
        assert_eq!(
            expected_byte_count(10, OutputFormat::U16, DataFormat::TwoByteUnsignedPlusExtra),
            22
        );
        assert_eq!(
            expected_byte_count(10, OutputFormat::U8, DataFormat::TwoByteSigned),
            10
        );
        assert_eq!(OutputFormat::from_id(3), None);
    }
}
