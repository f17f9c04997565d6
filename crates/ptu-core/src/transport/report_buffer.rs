//! Bounded report buffer fed by a background reader thread.
//!
//! The reader pulls raw frames from a [`FrameSource`], drops the ones whose
//! leading report id does not pass the filter and queues the rest. Consumers
//! block on a condition variable until the head slot is ready or their
//! timeout expires.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::traits::{Received, TransportError};
use crate::protocol::ReportId;

struct Slot {
    frame: Vec<u8>,
    ready: bool,
}

/// Fixed-capacity circular FIFO of frames.
///
/// Pushing into a full buffer evicts the oldest unread frame.
pub struct RingBuffer {
    slots: Vec<Slot>,
    read: usize,
    write: usize,
    count: usize,
}

impl RingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| Slot {
                frame: Vec::new(),
                ready: false,
            })
            .collect();
        Self {
            slots,
            read: 0,
            write: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Queue a frame, returning the evicted one when the buffer was full.
    pub fn push(&mut self, frame: Vec<u8>) -> Option<Vec<u8>> {
        let evicted = if self.count == self.capacity() {
            self.pop()
        } else {
            None
        };

        let slot = &mut self.slots[self.write];
        slot.frame = frame;
        slot.ready = true;
        self.write = (self.write + 1) % self.slots.len();
        self.count += 1;
        evicted
    }

    /// Dequeue the head frame if it is ready.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let slot = &mut self.slots[self.read];
        if self.count == 0 || !slot.ready {
            return None;
        }
        slot.ready = false;
        let frame = std::mem::take(&mut slot.frame);
        self.read = (self.read + 1) % self.slots.len();
        self.count -= 1;
        Some(frame)
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
        self.read = 0;
        self.write = 0;
    }
}

/// Something the reader thread can pull frames from.
pub trait FrameSource: Send + 'static {
    /// Block for the next frame. `Ok(None)` means the reader was cancelled.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// How the reader thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    Clean,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderStatus {
    NotStarted,
    Active,
    Exited(ReaderExit),
}

struct Shared {
    buffer: RingBuffer,
    status: ReaderStatus,
}

type SharedState = Arc<(Mutex<Shared>, Condvar)>;

fn lock(state: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background reader plus the buffer it fills.
pub struct ReportReader {
    state: SharedState,
    handle: Option<JoinHandle<()>>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ReportReader {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new((
                Mutex::new(Shared {
                    buffer: RingBuffer::with_capacity(capacity),
                    status: ReaderStatus::NotStarted,
                }),
                Condvar::new(),
            )),
            handle: None,
            cancel: None,
        }
    }

    pub fn status(&self) -> ReaderStatus {
        lock(&self.state.0).status.clone()
    }

    /// Spawn the reader thread. `cancel` must make `source` return `Ok(None)`.
    pub fn start<S: FrameSource>(
        &mut self,
        mut source: S,
        filter: ReportId,
        cancel: Box<dyn FnOnce() + Send>,
    ) -> Result<(), TransportError> {
        self.stop();

        {
            let mut shared = lock(&self.state.0);
            shared.buffer.clear();
            shared.status = ReaderStatus::Active;
        }

        let state = Arc::clone(&self.state);
        let handle = thread::Builder::new()
            .name("ptu-report-reader".into())
            .spawn(move || {
                let exit = loop {
                    match source.next_frame() {
                        Ok(Some(frame)) => {
                            let Some(&id) = frame.first() else { continue };
                            if !filter.accepts(id) {
                                tracing::trace!(report_id = %format!("0x{:02X}", id), "Skipping filtered report");
                                continue;
                            }
                            let (mutex, cvar) = &*state;
                            let mut shared = lock(mutex);
                            if shared.buffer.push(frame).is_some() {
                                tracing::warn!("Report buffer full, dropped the oldest report");
                            }
                            cvar.notify_all();
                        }
                        Ok(None) => {
                            tracing::debug!("Report reader cancelled");
                            break ReaderExit::Clean;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Report reader failed");
                            break ReaderExit::Failed(e.to_string());
                        }
                    }
                };

                let (mutex, cvar) = &*state;
                lock(mutex).status = ReaderStatus::Exited(exit);
                cvar.notify_all();
            })
            .map_err(|e| {
                lock(&self.state.0).status = ReaderStatus::NotStarted;
                TransportError::Io(e)
            })?;

        self.handle = Some(handle);
        self.cancel = Some(cancel);
        Ok(())
    }

    /// Wait for the next buffered frame.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Received, TransportError> {
        let (mutex, cvar) = &*self.state;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut shared = lock(mutex);

        match &shared.status {
            ReaderStatus::NotStarted => return Err(TransportError::ReaderNotStarted),
            ReaderStatus::Exited(_) if shared.buffer.is_empty() => return Ok(Received::Skip),
            _ => {}
        }

        loop {
            if let Some(frame) = shared.buffer.pop() {
                return Ok(Received::Data(frame));
            }
            match &shared.status {
                ReaderStatus::Exited(ReaderExit::Clean) => return Ok(Received::Timeout),
                ReaderStatus::Exited(ReaderExit::Failed(msg)) => {
                    return Err(TransportError::ReaderFailed(msg.clone()));
                }
                _ => {}
            }

            shared = match deadline {
                None => cvar.wait(shared).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Received::Timeout);
                    }
                    cvar.wait_timeout(shared, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Cancel and join the reader, then drop anything still buffered.
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Report reader thread panicked");
            }
        }
        let mut shared = lock(&self.state.0);
        shared.buffer.clear();
        shared.status = ReaderStatus::NotStarted;
    }
}

impl Drop for ReportReader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, Receiver, Sender};

    /// `None` on the channel stands for a cancellation.
    struct ChannelSource(Receiver<Option<Vec<u8>>>);

    impl FrameSource for ChannelSource {
        fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(self.0.recv().ok().flatten())
        }
    }

    struct FailingSource;

    impl FrameSource for FailingSource {
        fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            Err(TransportError::Disconnected)
        }
    }

    fn started(filter: ReportId) -> (ReportReader, Sender<Option<Vec<u8>>>) {
        let (tx, rx) = mpsc::channel();
        let cancel_tx = tx.clone();
        let mut reader = ReportReader::new(8);
        reader
            .start(
                ChannelSource(rx),
                filter,
                Box::new(move || {
                    let _ = cancel_tx.send(None);
                }),
            )
            .unwrap();
        (reader, tx)
    }

    const WAIT: Option<Duration> = Some(Duration::from_secs(2));

    #[test]
    fn test_ring_fifo_and_eviction() {
        let mut ring = RingBuffer::with_capacity(4);
        for i in 0..=4u8 {
            ring.push(vec![i]);
        }
        assert_eq!(ring.len(), 4);
        let drained: Vec<u8> = std::iter::from_fn(|| ring.pop()).map(|f| f[0]).collect();
        assert_eq!(drained, [1, 2, 3, 4]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_ring_push_reports_evicted_frame() {
        let mut ring = RingBuffer::with_capacity(2);
        assert!(ring.push(vec![1]).is_none());
        assert!(ring.push(vec![2]).is_none());
        assert_eq!(ring.push(vec![3]), Some(vec![1]));
    }

    #[test]
    fn test_receive_before_start_fails() {
        let reader = ReportReader::new(4);
        assert!(matches!(
            reader.receive(WAIT),
            Err(TransportError::ReaderNotStarted)
        ));
    }

    #[test]
    fn test_reader_filters_by_report_id() {
        let (reader, tx) = started(ReportId::SolicitedResponse);
        tx.send(Some(vec![0x01, 0xAA])).unwrap();
        tx.send(Some(vec![0x44, 0x02, 0x07])).unwrap();

        assert_eq!(
            reader.receive(WAIT).unwrap(),
            Received::Data(vec![0x44, 0x02, 0x07])
        );
        assert_eq!(
            reader.receive(Some(Duration::from_millis(20))).unwrap(),
            Received::Timeout
        );
    }

    #[test]
    fn test_any_filter_passes_everything() {
        let (reader, tx) = started(ReportId::Any);
        tx.send(Some(vec![0x01])).unwrap();
        tx.send(Some(vec![0x45])).unwrap();
        assert_eq!(reader.receive(WAIT).unwrap(), Received::Data(vec![0x01]));
        assert_eq!(reader.receive(WAIT).unwrap(), Received::Data(vec![0x45]));
    }

    #[test]
    fn test_exited_reader_with_empty_buffer_skips() {
        let (mut reader, tx) = started(ReportId::Any);
        tx.send(None).unwrap();
        reader.handle.take().unwrap().join().unwrap();
        assert_eq!(
            reader.status(),
            ReaderStatus::Exited(ReaderExit::Clean)
        );
        assert_eq!(reader.receive(WAIT).unwrap(), Received::Skip);
    }

    #[test]
    fn test_buffered_frames_survive_reader_exit() {
        let (mut reader, tx) = started(ReportId::Any);
        tx.send(Some(vec![0x44])).unwrap();
        tx.send(None).unwrap();
        reader.handle.take().unwrap().join().unwrap();
        assert_eq!(reader.receive(WAIT).unwrap(), Received::Data(vec![0x44]));
        assert_eq!(reader.receive(WAIT).unwrap(), Received::Skip);
    }

    #[test]
    fn test_reader_exit_while_waiting_times_out() {
        let (reader, tx) = started(ReportId::Any);
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            tx.send(None).unwrap();
        });
        assert_eq!(reader.receive(None).unwrap(), Received::Timeout);
        closer.join().unwrap();
    }

    #[test]
    fn test_failed_reader_reports_error() {
        let mut reader = ReportReader::new(4);
        reader
            .start(FailingSource, ReportId::Any, Box::new(|| {}))
            .unwrap();
        reader.handle.take().unwrap().join().unwrap();
        assert!(matches!(
            reader.status(),
            ReaderStatus::Exited(ReaderExit::Failed(_))
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut reader, _tx) = started(ReportId::Any);
        reader.stop();
        reader.stop();
        assert_eq!(reader.status(), ReaderStatus::NotStarted);
    }
}
