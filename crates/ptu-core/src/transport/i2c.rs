//! Linux i2c-dev raw bus transport.
//!
//! Every exchange opens the bus node in `send` and closes it at the end of
//! the matching `receive`; nothing runs in the background.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, instrument};

use super::traits::{ChannelKind, DeviceDescriptor, Received, Transport, TransportError};
use crate::protocol::constants::{CMD_TO_RSP_DELAY, PIP2_MAX_CMD_LEN};
use crate::protocol::ReportId;

/// Use this slave address even if a kernel driver already claimed it.
const I2C_SLAVE_FORCE: libc::c_ulong = 0x0706;

/// Default 7-bit slave address of the touch controller.
pub const DEFAULT_I2C_ADDRESS: u8 = 0x24;

/// Raw bus transport over `/dev/i2c-N`.
pub struct I2cTransport {
    bus: u32,
    address: u8,
    /// Node opened by the last `send`, consumed by the next `receive`.
    pending: Option<File>,
}

impl I2cTransport {
    pub fn new(bus: u32, address: u8) -> Self {
        Self {
            bus,
            address,
            pending: None,
        }
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Open `/dev/i2c/<bus>`, falling back to `/dev/i2c-<bus>`.
    fn open_bus(&self) -> Result<(File, PathBuf), TransportError> {
        let primary = PathBuf::from(format!("/dev/i2c/{}", self.bus));
        let open = |path: &PathBuf| OpenOptions::new().read(true).write(true).open(path);

        match open(&primary) {
            Ok(file) => Ok((file, primary)),
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENOTDIR)) => {
                let fallback = PathBuf::from(format!("/dev/i2c-{}", self.bus));
                let file = open(&fallback).map_err(|source| TransportError::OpenFailed {
                    path: fallback.display().to_string(),
                    source,
                })?;
                Ok((file, fallback))
            }
            Err(source) => Err(TransportError::OpenFailed {
                path: primary.display().to_string(),
                source,
            }),
        }
    }

    fn set_slave_address(&self, file: &File, path: &Path) -> Result<(), TransportError> {
        // SAFETY: I2C_SLAVE_FORCE takes the address by value.
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                I2C_SLAVE_FORCE as _,
                libc::c_ulong::from(self.address),
            )
        };
        if rc < 0 {
            return Err(TransportError::IoctlFailed {
                request: "I2C_SLAVE_FORCE",
                path: path.display().to_string(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Transport for I2cTransport {
    fn kind(&self) -> ChannelKind {
        ChannelKind::I2cDev
    }

    fn setup(&mut self, _filter: ReportId) -> Result<(), TransportError> {
        Ok(())
    }

    /// The raw bus has no report descriptor; commands are bounded by the
    /// boot loader's maximum command length.
    fn describe(&mut self) -> Result<DeviceDescriptor, TransportError> {
        Ok(DeviceDescriptor {
            max_input_len: PIP2_MAX_CMD_LEN,
            max_output_len: PIP2_MAX_CMD_LEN,
            vendor_id: 0,
            product_id: 0,
        })
    }

    #[instrument(skip(self, frame), fields(bus = self.bus, len = frame.len()))]
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.pending = None;
        let (mut file, path) = self.open_bus()?;
        self.set_slave_address(&file, &path)?;

        let written = file
            .write(frame)
            .map_err(|e| TransportError::WriteFailed(format!("{}: {}", path.display(), e)))?;
        if written != frame.len() {
            return Err(TransportError::WriteFailed(format!(
                "wrote {} of {} bytes to {}",
                written,
                frame.len(),
                path.display()
            )));
        }
        self.pending = Some(file);
        Ok(())
    }

    /// Reads the LE16 length, then re-reads the whole packet of that length.
    /// The bus cannot be polled, so `timeout` is not applied.
    fn receive(&mut self, _timeout: Option<Duration>) -> Result<Received, TransportError> {
        let mut file = self.pending.take().ok_or(TransportError::NotSetUp)?;

        let mut len_bytes = [0u8; 2];
        file.read_exact(&mut len_bytes)
            .map_err(|e| TransportError::ReadFailed(format!("report length: {e}")))?;
        let len = usize::from(u16::from_le_bytes(len_bytes));

        thread::sleep(CMD_TO_RSP_DELAY);

        let mut report = vec![0u8; len];
        file.read_exact(&mut report)
            .map_err(|e| TransportError::ReadFailed(format!("full report of {len} bytes: {e}")))?;
        debug!(len, "Read report from the bus");
        Ok(Received::Data(report))
    }

    fn teardown(&mut self) -> Result<(), TransportError> {
        self.pending = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_without_send_fails() {
        let mut transport = I2cTransport::new(99, DEFAULT_I2C_ADDRESS);
        assert!(matches!(
            transport.receive(None),
            Err(TransportError::NotSetUp)
        ));
    }

    #[test]
    fn test_missing_bus_reports_fallback_path() {
        let mut transport = I2cTransport::new(4242, DEFAULT_I2C_ADDRESS);
        match transport.send(&[0x01, 0x01]) {
            Err(TransportError::OpenFailed { path, .. }) => assert_eq!(path, "/dev/i2c-4242"),
            other => panic!("unexpected result: {other:?}"),
        }
        transport.teardown().unwrap();
    }

    #[test]
    fn test_describe_is_fixed() {
        let mut transport = I2cTransport::new(1, 0x24);
        let descriptor = transport.describe().unwrap();
        assert_eq!(descriptor.max_output_len, 255);
        assert_eq!(transport.kind(), ChannelKind::I2cDev);
    }
}
