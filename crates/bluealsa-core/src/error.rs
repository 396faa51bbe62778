//! The daemon-wide error taxonomy.

use thiserror::Error;

/// Primary error type shared by the engine crates.
///
/// Semantic errors propagate to the RPC caller translated into the
/// matching `org.bluealsa.Error.*` name; transient I/O conditions are
/// absorbed inside the I/O threads and never reach this type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("HCI error: {0}")]
    Hci(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The D-Bus error name this kind translates to.
    pub fn dbus_name(&self) -> &'static str {
        match self {
            Error::InvalidArguments(_) => "org.bluealsa.Error.InvalidArguments",
            Error::NotSupported(_) => "org.bluealsa.Error.NotSupported",
            Error::NotConnected => "org.bluealsa.Error.NotConnected",
            Error::Codec(_) | Error::Hci(_) | Error::Io(_) => "org.bluealsa.Error.Failed",
        }
    }
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dbus_names() {
        assert_eq!(
            Error::InvalidArguments("x".into()).dbus_name(),
            "org.bluealsa.Error.InvalidArguments"
        );
        assert_eq!(Error::NotConnected.dbus_name(), "org.bluealsa.Error.NotConnected");
        assert_eq!(
            Error::NotSupported("aptX".into()).dbus_name(),
            "org.bluealsa.Error.NotSupported"
        );
    }

    #[test]
    fn io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.dbus_name(), "org.bluealsa.Error.Failed");
    }
}
