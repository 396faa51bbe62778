//! Bluetooth device addressing.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A Bluetooth device address (BD_ADDR), stored in display order.
///
/// The kernel's `bdaddr_t` carries the six octets in little-endian order;
/// use [`BdAddr::from_le_bytes`] when reading from a socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    /// The all-zero address, used by adapters before bring-up.
    pub const ANY: BdAddr = BdAddr([0; 6]);

    /// Construct from the little-endian octet order used by `sockaddr_sco`
    /// and friends.
    pub fn from_le_bytes(bytes: [u8; 6]) -> Self {
        let mut addr = bytes;
        addr.reverse();
        BdAddr(addr)
    }

    /// Octets in the little-endian order expected by kernel socket
    /// address structures.
    pub fn to_le_bytes(self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    /// The `dev_XX_XX_XX_XX_XX_XX` fragment used in both the BlueZ and
    /// the daemon's own D-Bus object paths.
    pub fn path_fragment(&self) -> String {
        format!(
            "dev_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for BdAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr = [0u8; 6];
        let mut parts = s.split(':');
        for octet in addr.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::InvalidArguments(format!("invalid address: {s}")))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidArguments(format!("invalid address: {s}")))?;
        }
        if parts.next().is_some() {
            return Err(Error::InvalidArguments(format!("invalid address: {s}")));
        }
        Ok(BdAddr(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_roundtrip() {
        let addr: BdAddr = "AB:90:78:56:34:12".parse().unwrap();
        assert_eq!(addr.0, [0xAB, 0x90, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(addr.to_string(), "AB:90:78:56:34:12");
    }

    #[test]
    fn le_bytes_reverse_octets() {
        // The kernel hands out 0x12 0x34 0x56 0x78 0x90 0xAB for the
        // device known as AB:90:78:56:34:12.
        let addr = BdAddr::from_le_bytes([0x12, 0x34, 0x56, 0x78, 0x90, 0xAB]);
        assert_eq!(addr.to_string(), "AB:90:78:56:34:12");
        assert_eq!(addr.to_le_bytes(), [0x12, 0x34, 0x56, 0x78, 0x90, 0xAB]);
    }

    #[test]
    fn path_fragment_uses_underscores() {
        let addr = BdAddr::from_le_bytes([0x12, 0x34, 0x56, 0x78, 0x90, 0xAB]);
        assert_eq!(addr.path_fragment(), "dev_AB_90_78_56_34_12");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("AB:90:78:56:34".parse::<BdAddr>().is_err());
        assert!("AB:90:78:56:34:12:00".parse::<BdAddr>().is_err());
        assert!("ZZ:90:78:56:34:12".parse::<BdAddr>().is_err());
    }
}
