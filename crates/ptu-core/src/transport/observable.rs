//! Transport wrapper that reports every frame to an observer.

use std::sync::Arc;
use std::time::Duration;

use super::traits::{ChannelKind, DeviceDescriptor, Received, Transport, TransportError};
use crate::events::{PacketDirection, PtuEvent, PtuObserver};
use crate::protocol::ReportId;

/// Bytes of each frame copied into a packet event.
const PACKET_PREVIEW_LEN: usize = 32;

pub struct ObservableTransport<T: Transport, O: PtuObserver> {
    inner: T,
    observer: Arc<O>,
}

impl<T: Transport, O: PtuObserver> ObservableTransport<T, O> {
    pub fn new(inner: T, observer: Arc<O>) -> Self {
        Self { inner, observer }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn emit(&self, direction: PacketDirection, packet_type: &str, frame: &[u8]) {
        self.observer.on_event(&PtuEvent::Packet {
            direction,
            packet_type: packet_type.to_string(),
            length: frame.len(),
            data: Some(frame.iter().take(PACKET_PREVIEW_LEN).copied().collect()),
        });
    }
}

impl<T: Transport, O: PtuObserver> Transport for ObservableTransport<T, O> {
    fn kind(&self) -> ChannelKind {
        self.inner.kind()
    }

    fn setup(&mut self, filter: ReportId) -> Result<(), TransportError> {
        self.inner.setup(filter)
    }

    fn describe(&mut self) -> Result<DeviceDescriptor, TransportError> {
        self.inner.describe()
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.send(frame);
        if res.is_ok() {
            self.emit(PacketDirection::Tx, "Command", frame);
        }
        res
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<Received, TransportError> {
        let res = self.inner.receive(timeout);
        if let Ok(Received::Data(frame)) = &res
            && !frame.is_empty()
        {
            let packet_type = if self.inner.kind() == ChannelKind::I2cDev
                || frame[0] == ReportId::SolicitedResponse.as_u8()
            {
                "Response"
            } else if frame[0] == ReportId::UnsolicitedResponse.as_u8() {
                "Async"
            } else {
                "Report"
            };
            self.emit(PacketDirection::Rx, packet_type, frame);
        }
        res
    }

    fn teardown(&mut self) -> Result<(), TransportError> {
        self.inner.teardown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<PtuEvent>>);

    impl PtuObserver for Collect {
        fn on_event(&self, event: &PtuEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_packet_events_for_both_directions() {
        let mock = MockTransport::new();
        mock.queue_frame(&[0x44, 0x02, 0x07, 0x00]);
        let observer = Arc::new(Collect::default());
        let mut transport = ObservableTransport::new(mock, Arc::clone(&observer));

        transport.send(&[0x04, 0x06, 0x00]).unwrap();
        transport.receive(None).unwrap();
        // Timeouts are not packets.
        transport.receive(None).unwrap();

        let events = observer.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            PtuEvent::Packet { direction: PacketDirection::Tx, length: 3, .. }
        ));
        assert!(matches!(
            &events[1],
            PtuEvent::Packet { direction: PacketDirection::Rx, packet_type, .. } if packet_type == "Response"
        ));
    }
}
