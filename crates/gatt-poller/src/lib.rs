//! gatt-poller: polled acquisition for connection-oriented BLE sensors
//!
//! [`Acquisition`] is the blocking per-device state machine (discover, enable, read,
//! disable with bounded retries). [`spawn_poller`] drives it from a tokio interval and
//! keeps at most one cycle in flight per device.

mod error;
pub use error::AcquisitionError;

mod acquisition;
pub use acquisition::{Acquisition, AcquisitionConfig, CancelToken, CycleReport, CycleState};

mod scheduler;
pub use scheduler::{spawn_poller, DevicePoller, PollerHandle};
