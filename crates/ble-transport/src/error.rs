use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device access denied: {0}")]
    AccessDenied(String),
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
}
