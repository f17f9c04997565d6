//! Transport layer module.

pub mod hidraw;
pub mod i2c;
pub mod mock;
pub mod observable;
pub mod report_buffer;
pub mod traits;

pub use hidraw::HidrawTransport;
pub use i2c::{DEFAULT_I2C_ADDRESS, I2cTransport};
pub use mock::MockTransport;
pub use observable::ObservableTransport;
pub use report_buffer::{ReportReader, RingBuffer};
pub use traits::{ChannelKind, DeviceDescriptor, Received, Transport, TransportError};
