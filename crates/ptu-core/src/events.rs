//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow state transitions, flash
//! progress and raw packets without the core knowing how they are shown.

use std::fmt;

use crate::protocol::Generation;
use crate::state::{DeviceState, FlashLoader};
use crate::transport::ChannelKind;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by a session.
#[derive(Debug, Clone)]
pub enum PtuEvent {
    /// A protocol engine was attached to a channel.
    ChannelAttached {
        generation: Generation,
        channel: ChannelKind,
        vid: u16,
        pid: u16,
    },
    /// A protocol engine released its channel.
    ChannelDetached { generation: Generation },
    /// Device state changed.
    StateChanged { from: DeviceState, to: DeviceState },
    /// Active flash loader changed.
    LoaderChanged { from: FlashLoader, to: FlashLoader },
    /// Progress update for the current operation.
    Progress {
        operation: String,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Error occurred.
    Error { message: String },
    /// Frame sent/received.
    Packet {
        direction: PacketDirection,
        packet_type: String,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Operation completed successfully.
    Complete,
}

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait PtuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &PtuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl PtuObserver for NullObserver {
    fn on_event(&self, _event: &PtuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl PtuObserver for TracingObserver {
    fn on_event(&self, event: &PtuEvent) {
        match event {
            PtuEvent::ChannelAttached {
                generation,
                channel,
                vid,
                pid,
            } => {
                tracing::debug!(
                    generation = %generation,
                    channel = %channel,
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    "Channel attached"
                );
            }
            PtuEvent::ChannelDetached { generation } => {
                tracing::debug!(generation = %generation, "Channel detached");
            }
            PtuEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Device state changed");
            }
            PtuEvent::LoaderChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Flash loader changed");
            }
            PtuEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            PtuEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            PtuEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            PtuEvent::Packet {
                direction,
                packet_type,
                length,
                ..
            } => {
                tracing::trace!(
                    dir = %direction,
                    type_ = %packet_type,
                    len = length,
                    "Packet"
                );
            }
            PtuEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Observer that records every event it sees.
    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<PtuEvent>>,
    }

    impl PtuObserver for RecordingObserver {
        fn on_event(&self, event: &PtuEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_recording_observer() {
        let observer = RecordingObserver::default();
        observer.on_event(&PtuEvent::StateChanged {
            from: DeviceState::Default,
            to: DeviceState::FwScanning,
        });
        observer.on_event(&PtuEvent::Complete);
        assert_eq!(observer.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_tracing_observer_handles_every_event() {
        let observer = TracingObserver;
        observer.on_event(&PtuEvent::Progress {
            operation: "write".into(),
            current: 0,
            total: 0,
        });
        observer.on_event(&PtuEvent::Packet {
            direction: PacketDirection::Rx,
            packet_type: "Response".into(),
            length: 7,
            data: None,
        });
        assert_eq!(PacketDirection::Tx.to_string(), "TX");
    }
}
