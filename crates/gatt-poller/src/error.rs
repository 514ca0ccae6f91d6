use ble_transport::BleAddress;
use thiserror::Error;

/// Reasons an acquisition cycle stopped early. All of them are retried on the next
/// trigger.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("access to {address} denied: {reason}")]
    AccessDenied { address: BleAddress, reason: String },
    #[error("no service of interest on {address} after {attempts} attempts")]
    ServiceUnavailable { address: BleAddress, attempts: u32 },
    #[error("acquisition cancelled")]
    Cancelled,
    #[error("acquisition already in progress for {0}")]
    Busy(BleAddress),
}
