//! # bluealsa-dbus
//!
//! The `org.bluealsa` D-Bus service: the manager object, one object per
//! transport PCM and per RFCOMM link, and the BlueZ side of the house,
//! profile and media-endpoint registration plus transport acquisition.

pub mod bluez;
pub mod error;
pub mod service;

pub use error::DbusError;
pub use service::BluealsaService;

/// Well-known bus name; a suffix yields `org.bluealsa.<suffix>`.
pub fn service_name(suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) => format!("org.bluealsa.{suffix}"),
        None => "org.bluealsa".to_string(),
    }
}

/// Root object path of the service.
pub const ROOT_PATH: &str = "/org/bluealsa";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_with_suffix() {
        assert_eq!(service_name(None), "org.bluealsa");
        assert_eq!(service_name(Some("a4a5")), "org.bluealsa.a4a5");
    }
}
