//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{ChannelKind, DeviceDescriptor, Received, Transport, TransportError};
use crate::protocol::constants::{HID_INPUT_PACKET_START, ReportId};
use crate::protocol::crc::append_crc;
use crate::protocol::header::{CmdField, InputReportHeader, ResponseHeader, SeqField};

/// Build a response packet: `[len, seq, cmd|resp, status, payload.., crc]`.
pub fn response_packet(cmd_id: u8, response: bool, status: u8, payload: &[u8]) -> Vec<u8> {
    let len = ResponseHeader::SIZE + payload.len() + 2;
    let mut packet = Vec::with_capacity(len);
    packet.extend_from_slice(&(len as u16).to_le_bytes());
    packet.push(
        SeqField {
            seq: 0,
            tag: true,
            more_data: false,
        }
        .to_byte(),
    );
    packet.push(
        CmdField {
            id: cmd_id,
            response,
        }
        .to_byte(),
    );
    packet.push(status);
    packet.extend_from_slice(payload);
    append_crc(&mut packet, 0);
    packet
}

/// Split a packet into HID input reports no longer than `max_input_len`.
pub fn split_into_reports(report_id: ReportId, packet: &[u8], max_input_len: usize) -> Vec<Vec<u8>> {
    let segment = max_input_len.saturating_sub(HID_INPUT_PACKET_START).max(1);
    let chunks: Vec<&[u8]> = packet.chunks(segment).collect();
    let last = chunks.len().saturating_sub(1);
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut report = vec![
                report_id.as_u8(),
                InputReportHeader::flags_byte(i < last, i == 0),
            ];
            report.extend_from_slice(chunk);
            report
        })
        .collect()
}

/// Mock transport for unit testing engines and the state machine.
///
/// Clones share their queues, so a test can keep a handle after moving the
/// transport into an engine.
#[derive(Clone)]
pub struct MockTransport {
    kind: ChannelKind,
    /// Queued replies returned on receive.
    replies: Arc<Mutex<VecDeque<Result<Received, String>>>>,
    /// Captured sends.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    descriptor: Arc<Mutex<DeviceDescriptor>>,
    filter: Arc<Mutex<Option<ReportId>>>,
    teardowns: Arc<Mutex<usize>>,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_kind(ChannelKind::Mock)
    }

    /// A mock that reports itself as the given channel kind.
    pub fn with_kind(kind: ChannelKind) -> Self {
        Self {
            kind,
            replies: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            descriptor: Arc::new(Mutex::new(DeviceDescriptor {
                max_input_len: 64,
                max_output_len: 64,
                vendor_id: 0x04B4,
                product_id: 0xC101,
            })),
            filter: Arc::new(Mutex::new(None)),
            teardowns: Arc::new(Mutex::new(0)),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    pub fn set_descriptor(&self, descriptor: DeviceDescriptor) {
        *self.descriptor.lock().unwrap() = descriptor;
    }

    /// Queue a raw frame to be returned on next receive.
    pub fn queue_frame(&self, frame: &[u8]) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Ok(Received::Data(frame.to_vec())));
    }

    pub fn queue_timeout(&self) {
        self.replies.lock().unwrap().push_back(Ok(Received::Timeout));
    }

    pub fn queue_skip(&self) {
        self.replies.lock().unwrap().push_back(Ok(Received::Skip));
    }

    pub fn queue_read_error(&self, message: &str) {
        self.replies.lock().unwrap().push_back(Err(message.to_string()));
    }

    /// Queue a PIP2 response as a single raw-bus frame.
    pub fn queue_pip2_response(&self, cmd_id: u8, status: u8, payload: &[u8]) {
        self.queue_frame(&response_packet(cmd_id, true, status, payload));
    }

    /// Queue a solicited PIP3 response split over as many input reports as
    /// the descriptor's input length requires.
    pub fn queue_pip3_response(&self, cmd_id: u8, status: u8, payload: &[u8]) {
        let packet = response_packet(cmd_id, true, status, payload);
        self.queue_pip3_packet(ReportId::SolicitedResponse, &packet);
    }

    /// Queue an unsolicited (async debug data) PIP3 packet.
    pub fn queue_pip3_unsolicited(&self, cmd_id: u8, payload: &[u8]) {
        let packet = response_packet(cmd_id, false, 0, payload);
        self.queue_pip3_packet(ReportId::UnsolicitedResponse, &packet);
    }

    pub fn queue_pip3_packet(&self, report_id: ReportId, packet: &[u8]) {
        let max_input_len = self.descriptor.lock().unwrap().max_input_len;
        for report in split_into_reports(report_id, packet, max_input_len) {
            self.queue_frame(&report);
        }
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Command ids of every captured write, decoded for the given header layout.
    pub fn sent_command_ids(&self) -> Vec<u8> {
        self.get_writes()
            .iter()
            .filter_map(|frame| match frame.first() {
                Some(0x04) => frame.get(4),
                Some(0x01) => frame.get(5),
                _ => None,
            })
            .map(|b| CmdField::from_byte(*b).id)
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Number of replies not yet consumed.
    pub fn pending_replies(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    pub fn setup_filter(&self) -> Option<ReportId> {
        *self.filter.lock().unwrap()
    }

    pub fn teardown_count(&self) -> usize {
        *self.teardowns.lock().unwrap()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if *self.connected.lock().unwrap() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn setup(&mut self, filter: ReportId) -> Result<(), TransportError> {
        self.check_connected()?;
        *self.filter.lock().unwrap() = Some(filter);
        Ok(())
    }

    fn describe(&mut self) -> Result<DeviceDescriptor, TransportError> {
        self.check_connected()?;
        Ok(*self.descriptor.lock().unwrap())
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.check_connected()?;
        self.write_log.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self, _timeout: Option<Duration>) -> Result<Received, TransportError> {
        self.check_connected()?;
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(received)) => Ok(received),
            Some(Err(message)) => Err(TransportError::ReadFailed(message)),
            None => Ok(Received::Timeout),
        }
    }

    fn teardown(&mut self) -> Result<(), TransportError> {
        *self.filter.lock().unwrap() = None;
        *self.teardowns.lock().unwrap() += 1;
        Ok(())
    }
}
