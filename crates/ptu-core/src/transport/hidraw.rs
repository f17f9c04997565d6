//! Linux hidraw report transport.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::report_buffer::{FrameSource, ReaderStatus, ReportReader};
use super::traits::{ChannelKind, DeviceDescriptor, Received, Transport, TransportError};
use crate::protocol::constants::{
    CMD_TO_RSP_DELAY, HID_MAX_REPORT_SIZE, PIP3_RSP_TIMEOUT, PROBE_PING, PROBE_SUSPEND_SCAN,
    REPORT_BUFFER_CAPACITY,
};
use crate::protocol::ReportId;

/// `_IOR('H', 0x03, struct hidraw_devinfo)`
const HIDIOCGRAWINFO: libc::c_ulong = 0x8008_4803;

#[repr(C)]
#[derive(Default)]
struct HidrawDevinfo {
    #[allow(dead_code)]
    bustype: u32,
    vendor: i16,
    product: i16,
}

/// Wait until `fd` is readable. Returns `false` on timeout.
fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    loop {
        // SAFETY: one valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0 && pfd.revents & libc::POLLIN != 0);
    }
}

/// Frame source for the reader thread: the hidraw fd plus a cancellation socket.
struct HidrawSource {
    device: File,
    cancel: UnixStream,
    buf: Vec<u8>,
}

impl FrameSource for HidrawSource {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut fds = [
            libc::pollfd {
                fd: self.device.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.cancel.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        loop {
            // SAFETY: `fds` outlives the call and its length is passed along.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(TransportError::ReadFailed(err.to_string()));
            }

            if fds[1].revents != 0 {
                return Ok(None);
            }
            if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                return Err(TransportError::Disconnected);
            }
            if fds[0].revents & libc::POLLIN != 0 {
                let n = self
                    .device
                    .read(&mut self.buf)
                    .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
                return Ok(Some(self.buf[..n].to_vec()));
            }
        }
    }
}

/// Report transport over a `/dev/hidrawN` node.
pub struct HidrawTransport {
    path: PathBuf,
    device: Option<File>,
    descriptor: Option<DeviceDescriptor>,
    reader: ReportReader,
}

impl HidrawTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            device: None,
            descriptor: None,
            reader: ReportReader::new(REPORT_BUFFER_CAPACITY),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn device(&mut self) -> Result<&mut File, TransportError> {
        if self.device.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.path)
                .map_err(|source| TransportError::OpenFailed {
                    path: self.path.display().to_string(),
                    source,
                })?;
            debug!(path = %self.path.display(), "Opened hidraw node");
            self.device = Some(file);
        }
        self.device.as_mut().ok_or(TransportError::NotSetUp)
    }

    fn probe_max_input_len(&mut self) -> Result<usize, TransportError> {
        let device = self.device()?;
        device
            .write(&PROBE_SUSPEND_SCAN)
            .map_err(|e| TransportError::WriteFailed(format!("SUSPEND_SCAN probe: {e}")))?;
        thread::sleep(CMD_TO_RSP_DELAY);
        device
            .write(&PROBE_PING)
            .map_err(|e| TransportError::WriteFailed(format!("PING probe: {e}")))?;
        thread::sleep(CMD_TO_RSP_DELAY);

        if !poll_readable(device.as_raw_fd(), PIP3_RSP_TIMEOUT)? {
            return Err(TransportError::DescribeFailed(
                "no reply to the PING probe".into(),
            ));
        }
        let mut buf = vec![0u8; HID_MAX_REPORT_SIZE];
        let n = device
            .read(&mut buf)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        if n == 0 {
            return Err(TransportError::DescribeFailed(
                "zero bytes read while probing the input report size".into(),
            ));
        }
        let max_input_len = n + 2;
        debug!(max_input_len, "Probed HID input report length");
        Ok(max_input_len)
    }

    /// Binary search the longest write of a PING buffer the node accepts.
    fn probe_max_output_len(&mut self) -> Result<usize, TransportError> {
        let device = self.device()?;
        let mut ping = vec![0u8; HID_MAX_REPORT_SIZE];
        ping[..PROBE_PING.len()].copy_from_slice(&PROBE_PING);

        let mut lower = 0usize;
        let mut upper = HID_MAX_REPORT_SIZE;
        let mut largest = None;
        while lower <= upper {
            let mid = (lower + upper) / 2;
            match device.write(&ping[..mid]) {
                Ok(written) => {
                    largest = Some(written);
                    lower = written + 1;
                }
                Err(_) if mid == 0 => break,
                Err(_) => upper = mid - 1,
            }
            thread::sleep(CMD_TO_RSP_DELAY);
        }

        let largest = largest.ok_or_else(|| {
            TransportError::DescribeFailed("no output report size was accepted".into())
        })?;
        let max_output_len = largest + 2;
        debug!(max_output_len, "Probed HID output report length");
        Ok(max_output_len)
    }

    /// Discard replies the probes left pending on the node.
    fn drain_pending(&mut self) -> Result<(), TransportError> {
        let device = self.device()?;
        let mut buf = vec![0u8; HID_MAX_REPORT_SIZE];
        let mut drained = 0usize;
        while poll_readable(device.as_raw_fd(), Duration::ZERO)? {
            if device.read(&mut buf)? == 0 {
                break;
            }
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "Drained stale probe replies");
        }
        Ok(())
    }

    fn raw_info(&mut self) -> Result<HidrawDevinfo, TransportError> {
        let path = self.path.display().to_string();
        let device = self.device()?;
        let mut info = HidrawDevinfo::default();
        // SAFETY: HIDIOCGRAWINFO fills a `struct hidraw_devinfo`, which `info` mirrors.
        let rc = unsafe { libc::ioctl(device.as_raw_fd(), HIDIOCGRAWINFO as _, &mut info) };
        if rc < 0 {
            return Err(TransportError::IoctlFailed {
                request: "HIDIOCGRAWINFO",
                path,
                source: io::Error::last_os_error(),
            });
        }
        Ok(info)
    }
}

impl Transport for HidrawTransport {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Hidraw
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn setup(&mut self, filter: ReportId) -> Result<(), TransportError> {
        let result = (|| -> Result<(), TransportError> {
            let device = self.device()?.try_clone()?;
            let (cancel_tx, cancel_rx) = UnixStream::pair()?;
            let buf_len = self
                .descriptor
                .map_or(HID_MAX_REPORT_SIZE, |d| d.max_input_len.max(1));
            let source = HidrawSource {
                device,
                cancel: cancel_rx,
                buf: vec![0u8; buf_len],
            };
            self.reader.start(
                source,
                filter,
                Box::new(move || {
                    let _ = (&cancel_tx).write_all(&[0]);
                }),
            )
        })();

        if let Err(e) = result {
            let _ = self.teardown();
            return Err(e);
        }
        info!(filter = ?filter, "Report reader started");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn describe(&mut self) -> Result<DeviceDescriptor, TransportError> {
        if let Some(descriptor) = self.descriptor {
            return Ok(descriptor);
        }
        if self.reader.status() != ReaderStatus::NotStarted {
            return Err(TransportError::DescribeFailed(
                "cannot probe while the report reader is running".into(),
            ));
        }

        let max_input_len = self.probe_max_input_len()?;
        let max_output_len = self.probe_max_output_len()?;
        self.drain_pending()?;
        let info = self.raw_info()?;

        let descriptor = DeviceDescriptor {
            max_input_len,
            max_output_len,
            vendor_id: info.vendor as u16,
            product_id: info.product as u16,
        };
        info!(
            vendor_id = %format!("{:04X}", descriptor.vendor_id),
            product_id = %format!("{:04X}", descriptor.product_id),
            max_input_len,
            max_output_len,
            "Described hidraw device"
        );
        self.descriptor = Some(descriptor);
        Ok(descriptor)
    }

    #[instrument(skip(self, frame), fields(len = frame.len()))]
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let device = self.device.as_mut().ok_or(TransportError::NotSetUp)?;
        let written = device
            .write(frame)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        if written != frame.len() {
            return Err(TransportError::WriteFailed(format!(
                "short write: {} of {} bytes",
                written,
                frame.len()
            )));
        }
        Ok(())
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<Received, TransportError> {
        self.reader.receive(timeout)
    }

    fn teardown(&mut self) -> Result<(), TransportError> {
        self.reader.stop();
        if self.device.take().is_some() {
            debug!(path = %self.path.display(), "Closed hidraw node");
        }
        self.descriptor = None;
        Ok(())
    }
}

impl Drop for HidrawTransport {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(error = %e, "hidraw teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_node_fails() {
        let mut transport = HidrawTransport::new("/nonexistent/hidraw-test");
        let err = transport.describe().unwrap_err();
        assert!(matches!(err, TransportError::OpenFailed { .. }));
        // Teardown after a failed setup is harmless.
        assert!(transport.setup(ReportId::SolicitedResponse).is_err());
        transport.teardown().unwrap();
        transport.teardown().unwrap();
    }

    #[test]
    fn test_send_requires_open_node() {
        let mut transport = HidrawTransport::new("/nonexistent/hidraw-test");
        assert!(matches!(
            transport.send(&PROBE_PING),
            Err(TransportError::NotSetUp)
        ));
        assert_eq!(transport.kind(), ChannelKind::Hidraw);
    }

    #[test]
    fn test_hidraw_source_stops_on_cancel() {
        let (device_end, _peer) = UnixStream::pair().unwrap();
        let device: File = std::os::fd::OwnedFd::from(device_end).into();
        let (cancel_tx, cancel_rx) = UnixStream::pair().unwrap();
        let mut source = HidrawSource {
            device,
            cancel: cancel_rx,
            buf: vec![0u8; 64],
        };
        (&cancel_tx).write_all(&[0]).unwrap();
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_hidraw_source_reads_one_report() {
        let (device_end, peer) = UnixStream::pair().unwrap();
        let device: File = std::os::fd::OwnedFd::from(device_end).into();
        let (_cancel_tx, cancel_rx) = UnixStream::pair().unwrap();
        let mut source = HidrawSource {
            device,
            cancel: cancel_rx,
            buf: vec![0u8; 64],
        };
        (&peer).write_all(&[0x44, 0x02, 0x07]).unwrap();
        assert_eq!(source.next_frame().unwrap(), Some(vec![0x44, 0x02, 0x07]));
    }
}
