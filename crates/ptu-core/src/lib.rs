//! PTU-Core: touch controller diagnose and reflash client.
//!
//! Talks to a touch controller ASIC through its two command protocols:
//! PIP2, spoken by the ROM boot loader over a raw I2C bus, and PIP3, spoken
//! by the application firmware over HID reports.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Command ids, status codes, frame headers, CRC
//! - **Transport**: hidraw (with a background report reader) and i2c-dev channels, mock
//! - **Engines**: PIP2 and PIP3 command execution on top of a transport
//! - **State**: Device state machine and transition handlers
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator (flashing, self-tests, versions)
//! - **Firmware**: Bin header and version numbers
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use ptu_core::session::{Session, SessionConfig};
//! use ptu_core::state::DeviceState;
//!
//! let config = SessionConfig {
//!     i2c_bus: Some(1),
//!     ..Default::default()
//! };
//!
//! let mut session = Session::new(&config);
//! session.open_hidraw(Path::new("/dev/hidraw0")).expect("no hidraw node");
//! session.set_state(DeviceState::FwScanning).expect("not scanning");
//! if let Some(version) = session.active_firmware_version().expect("version") {
//!     println!("Active Version: {version}");
//! }
//! session.teardown().expect("teardown");
//! ```

pub mod engine;
pub mod events;
pub mod firmware;
pub mod pip2;
pub mod pip3;
pub mod protocol;
pub mod self_test;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use engine::{CommandError, FlashEngine, Timing};
pub use events::{LogLevel, NullObserver, PtuEvent, PtuObserver, TracingObserver};
pub use firmware::{FirmwareError, FwBinHeader, FwVersion};
pub use pip2::{Pip2Engine, Pip2Status};
pub use pip3::{Pip3Engine, Pip3Status, Pip3Version, SelfTestResults, Sysinfo};
pub use protocol::Generation;
pub use self_test::{DataFormat, DataUnit, OutputFormat, SelfTestId};
pub use session::{SelfTestReport, Session, SessionConfig, SessionError};
pub use state::{DeviceState, FlashLoader};
pub use transport::{
    ChannelKind, HidrawTransport, I2cTransport, MockTransport, Transport, TransportError,
};
