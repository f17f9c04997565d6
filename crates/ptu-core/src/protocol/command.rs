//! Command identifiers for both protocol generations.

use std::fmt;

/// Declare a command id enum together with its wire value and display name.
macro_rules! command_ids {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal => $label:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value,)+
        }

        impl $name {
            /// Wire value of the 7-bit command id.
            pub fn as_u8(self) -> u8 {
                self as u8
            }

            /// Decode a 7-bit command id.
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            /// Upper-case name used in logs and errors.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }

            /// Name for a raw id that may not be known.
            pub fn name_of(value: u8) -> &'static str {
                Self::from_u8(value).map_or("UNKNOWN", Self::name)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.name())
            }
        }
    };
}

command_ids! {
    /// PIP2 (boot loader) commands.
    Pip2CommandId {
        Ping = 0x00 => "PING",
        Status = 0x01 => "STATUS",
        Ctrl = 0x02 => "CTRL",
        Config = 0x03 => "CONFIG",
        Clear = 0x05 => "CLEAR",
        Reset = 0x06 => "RESET",
        Version = 0x07 => "VERSION",
        FileOpen = 0x10 => "FILE_OPEN",
        FileClose = 0x11 => "FILE_CLOSE",
        FileRead = 0x12 => "FILE_READ",
        FileWrite = 0x13 => "FILE_WRITE",
        FileIoctl = 0x14 => "FILE_IOCTL",
        FlashInfo = 0x15 => "FLASH_INFO",
        Execute = 0x16 => "EXECUTE",
        GetLastErrno = 0x17 => "GET_LAST_ERRNO",
        ExitHostMode = 0x18 => "EXIT_HOST_MODE",
        ReadGpio = 0x19 => "READ_GPIO",
        ExecuteScan = 0x21 => "EXECUTE_SCAN",
        SetParameter = 0x40 => "SET_PARAMETER",
        GetParameter = 0x41 => "GET_PARAMETER",
        SetDdiReg = 0x42 => "SET_DDI_REG",
        GetDdiReg = 0x43 => "GET_DDI_REG",
        NetTrans = 0x70 => "NET_TRANS",
        Extend = 0x7F => "EXTEND",
    }
}

command_ids! {
    /// PIP3 (application firmware) commands.
    Pip3CommandId {
        Ping = 0x00 => "PING",
        Status = 0x01 => "STATUS",
        Ctrl = 0x02 => "CTRL",
        Config = 0x03 => "CONFIG",
        SwitchImage = 0x04 => "SWITCH_IMAGE",
        SwitchActiveProcessor = 0x05 => "SWITCH_ACTIVE_PROCESSOR",
        Reset = 0x06 => "RESET",
        Version = 0x07 => "VERSION",
        FileOpen = 0x10 => "FILE_OPEN",
        FileClose = 0x11 => "FILE_CLOSE",
        FileRead = 0x12 => "FILE_READ",
        FileWrite = 0x13 => "FILE_WRITE",
        FileIoctl = 0x14 => "FILE_IOCTL",
        FlashInfo = 0x15 => "FLASH_INFO",
        Execute = 0x16 => "EXECUTE",
        GetLastErrno = 0x17 => "GET_LAST_ERRNO",
        ExitHostMode = 0x18 => "EXIT_HOST_MODE",
        ReadGpio = 0x19 => "READ_GPIO",
        VerifyDataBlockCrc = 0x20 => "VERIFY_DATA_BLOCK_CRC",
        GetDataRowSize = 0x21 => "GET_DATA_ROW_SIZE",
        ReadDataBlock = 0x22 => "READ_DATA_BLOCK",
        WriteDataBlock = 0x23 => "WRITE_DATA_BLOCK",
        GetDataStructure = 0x24 => "GET_DATA_STRUCTURE",
        LoadSelfTestParam = 0x25 => "LOAD_SELF_TEST_PARAM",
        RunSelfTest = 0x26 => "RUN_SELF_TEST",
        GetSelfTestResults = 0x27 => "GET_SELF_TEST_RESULTS",
        InitializeBaseline = 0x29 => "INITIALIZE_BASELINE",
        ExecuteScan = 0x2A => "EXECUTE_SCAN",
        RetrievePanelScan = 0x2B => "RETRIEVE_PANEL_SCAN",
        StartSensorDataMode = 0x2C => "START_SENSOR_DATA_MODE",
        StopAsyncDebugData = 0x2D => "STOP_ASYNC_DEBUG_DATA",
        StartTrackingHeatmap = 0x2E => "START_TRACKING_HEATMAP",
        Calibrate = 0x30 => "CALIBRATE",
        StartBootloader = 0x31 => "START_BOOTLOADER",
        GetSysinfo = 0x32 => "GET_SYSINFO",
        SuspendScan = 0x33 => "SUSPEND_SCAN",
        ResumeScan = 0x34 => "RESUME_SCAN",
        GetParam = 0x35 => "GET_PARAM",
        SetParam = 0x36 => "SET_PARAM",
        GetNoiseMetrics = 0x37 => "GET_NOISE_METRICS",
        EnterEasywakeState = 0x39 => "ENTER_EASYWAKE_STATE",
        SetDbgParameter = 0x3A => "SET_DBG_PARAMETER",
        GetDbgParameter = 0x3B => "GET_DBG_PARAMETER",
        SetDdiReg = 0x3C => "SET_DDI_REG",
        GetDdiReg = 0x3D => "GET_DDI_REG",
        RealtimeSignalDataMode = 0x3E => "REALTIME_SIGNAL_DATA_MODE",
    }
}

/// FILE_IOCTL sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileIoctl {
    Erase = 0x00,
    Seek = 0x01,
    Aes = 0x02,
    Stats = 0x03,
    Crc = 0x04,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_id_roundtrip() {
        let id = Pip3CommandId::from_u8(0x33).unwrap();
        assert_eq!(id, Pip3CommandId::SuspendScan);
        assert_eq!(id.name(), "SUSPEND_SCAN");
        assert_eq!(Pip2CommandId::FileIoctl.as_u8(), 0x14);
    }

    #[test]
    fn test_unknown_command_name() {
        assert_eq!(Pip2CommandId::name_of(0x60), "UNKNOWN");
        assert_eq!(Pip3CommandId::name_of(0x07), "VERSION");
    }
}
