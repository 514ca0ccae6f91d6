use crate::{BleAddress, ChannelId, Result, ServiceId, WriteMode};

/// A minimal blocking GATT link to one connected device.
///
/// Implementations own the connection; callers serialize access per device.
pub trait GattLink: Send {
    /// Address of the remote device.
    fn address(&self) -> BleAddress;

    /// Ask the platform for permission to talk to the device.
    fn request_access(&mut self) -> Result<()>;

    /// Enumerate the services the device currently exposes (uncached).
    fn discover_services(&mut self) -> Result<Vec<ServiceId>>;

    /// Read the current value of a channel. An empty vector means "no data yet".
    fn read(&mut self, service: ServiceId, channel: ChannelId) -> Result<Vec<u8>>;

    /// Write a value to a channel.
    fn write(
        &mut self,
        service: ServiceId,
        channel: ChannelId,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()>;
}
