//! Protocol module - PIP2/PIP3 wire definitions.

pub mod command;
pub mod constants;
pub mod crc;
pub mod header;
pub mod status;
pub mod types;

use std::fmt;

pub use command::{FileIoctl, Pip2CommandId, Pip3CommandId};
pub use constants::*;
pub use header::{CmdField, HeaderError, InputReportHeader, ResponseHeader, SeqField};
pub use status::{STATUS_SUCCESS, status_label};
pub use types::{ExecMode, FwCategory, ImageId, Processor, SysMode};

/// Protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// PIP2, spoken by the ROM boot loader.
    Gen2,
    /// PIP3, spoken by application firmware.
    Gen3,
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Gen2 => write!(f, "PIP2"),
            Generation::Gen3 => write!(f, "PIP3"),
        }
    }
}
