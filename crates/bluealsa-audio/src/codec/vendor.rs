//! Vendor codec capability elements.
//!
//! aptX and LDAC ride on the A2DP vendor codec id; this build only
//! identifies them so the engine can answer with a precise
//! not-supported error instead of a parse failure.

use super::CodecError;

pub const VENDOR_APTX: (u32, u16) = (0x0000004f, 0x0001);
pub const VENDOR_LDAC: (u32, u16) = (0x0000012d, 0x00aa);

/// The 6-byte header every vendor codec element starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorInfo {
    pub vendor_id: u32,
    pub codec_id: u16,
}

impl VendorInfo {
    pub fn parse(blob: &[u8]) -> Result<Self, CodecError> {
        if blob.len() < 6 {
            return Err(CodecError::InvalidConfiguration("vendor element too short".into()));
        }
        Ok(VendorInfo {
            vendor_id: u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]),
            codec_id: u16::from_le_bytes([blob[4], blob[5]]),
        })
    }

    /// Human name of the codec, when this build knows of it.
    pub fn name(&self) -> Option<&'static str> {
        match (self.vendor_id, self.codec_id) {
            VENDOR_APTX => Some("aptX"),
            VENDOR_LDAC => Some("LDAC"),
            _ => None,
        }
    }
}
