//! ble-transport: BLE advertisement and GATT transport abstractions
//!
//! This crate provides the types and traits the gateway uses to talk to short-range
//! wireless sensors: passive advertisement frames and connection-oriented GATT reads.
//! The default build enables a scripted `mock` backend so that binaries and tests run
//! on any host without a radio.

mod types;
pub use types::{
    to_hex_string, AdvertisementFrame, BleAddress, ChannelId, DataSection, ServiceId, Timestamp,
    WriteMode,
};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::GattLink;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockGattLink, WriteRecord};
