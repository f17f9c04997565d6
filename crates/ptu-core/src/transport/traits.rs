//! Transport layer abstraction.
//!
//! Defines the `Transport` trait shared by the hidraw report transport, the
//! i2c-dev raw bus and the scripted mock used in tests.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::ReportId;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{request} ioctl failed on {path}: {source}")]
    IoctlFailed {
        request: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Transport is not set up")]
    NotSetUp,

    #[error("Report reader was not started")]
    ReaderNotStarted,

    #[error("Report reader exited with an error: {0}")]
    ReaderFailed(String),

    #[error("Device description failed: {0}")]
    DescribeFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of physical channel behind a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Hidraw,
    I2cDev,
    Mock,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Hidraw => write!(f, "HIDRAW"),
            ChannelKind::I2cDev => write!(f, "I2C-DEV"),
            ChannelKind::Mock => write!(f, "MOCK"),
        }
    }
}

/// Report sizes and USB ids of the attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    /// Longest input report the device sends, report id included.
    pub max_input_len: usize,
    /// Longest output report the device accepts, report id included.
    pub max_output_len: usize,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Outcome of a receive that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Data(Vec<u8>),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The reader is gone and nothing is left to hand out.
    Skip,
}

/// Abstract device channel.
///
/// Implemented by:
/// - `HidrawTransport` (packetized reports with a background reader)
/// - `I2cTransport` (raw bus, one open/close per exchange)
/// - `MockTransport` (scripted replies for unit tests)
pub trait Transport: Send {
    fn kind(&self) -> ChannelKind;

    /// Prepare the channel; only reports whose id passes `filter` are delivered.
    fn setup(&mut self, filter: ReportId) -> Result<(), TransportError>;

    /// Report sizes and ids; cached after the first successful call.
    fn describe(&mut self) -> Result<DeviceDescriptor, TransportError>;

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Wait for one frame; `None` blocks until one arrives or the reader ends.
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Received, TransportError>;

    /// Release every resource. Safe to call repeatedly and after a failed setup.
    fn teardown(&mut self) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> ChannelKind {
        (**self).kind()
    }

    fn setup(&mut self, filter: ReportId) -> Result<(), TransportError> {
        (**self).setup(filter)
    }

    fn describe(&mut self) -> Result<DeviceDescriptor, TransportError> {
        (**self).describe()
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<Received, TransportError> {
        (**self).receive(timeout)
    }

    fn teardown(&mut self) -> Result<(), TransportError> {
        (**self).teardown()
    }
}
