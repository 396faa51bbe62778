//! Engine error taxonomy translated to D-Bus error names.

use bluealsa_core::Error;

/// Errors surfaced to D-Bus callers under `org.bluealsa.Error.*`.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.bluealsa.Error")]
pub enum DbusError {
    #[zbus(error)]
    ZBus(zbus::Error),
    InvalidArguments(String),
    NotSupported(String),
    NotConnected(String),
    Failed(String),
}

impl From<Error> for DbusError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidArguments(msg) => DbusError::InvalidArguments(msg),
            Error::NotSupported(msg) => DbusError::NotSupported(msg),
            Error::NotConnected => DbusError::NotConnected("transport is not connected".into()),
            other => DbusError::Failed(other.to_string()),
        }
    }
}
