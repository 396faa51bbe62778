//! Transport profile and codec identification.

use std::fmt;

use crate::error::Error;

/// Bluetooth audio profile and role of the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// A2DP source: we encode and send high-quality audio.
    A2dpSource,
    /// A2DP sink: we receive and decode high-quality audio.
    A2dpSink,
    /// HFP audio gateway.
    HfpAg,
    /// HFP hands-free unit.
    HfpHf,
    /// HSP audio gateway.
    HspAg,
    /// HSP headset.
    HspHs,
}

impl Profile {
    /// True for the A2DP profiles.
    pub fn is_a2dp(self) -> bool {
        matches!(self, Profile::A2dpSource | Profile::A2dpSink)
    }

    /// True for the profiles carried over SCO.
    pub fn is_sco(self) -> bool {
        !self.is_a2dp()
    }

    /// True when the local side acts as an audio gateway. The AG owns the
    /// SCO bandwidth decision, which drives the linger behavior.
    pub fn is_ag(self) -> bool {
        matches!(self, Profile::HfpAg | Profile::HspAg)
    }

    /// Object-path fragment for transports of this profile.
    pub fn path_fragment(self) -> &'static str {
        match self {
            Profile::A2dpSource => "a2dpsrc",
            Profile::A2dpSink => "a2dpsnk",
            Profile::HfpAg | Profile::HfpHf => "hfp",
            Profile::HspAg | Profile::HspHs => "hsp",
        }
    }

    /// Value of the D-Bus `Transport` property.
    pub fn transport_name(self) -> &'static str {
        match self {
            Profile::A2dpSource => "A2DP-source",
            Profile::A2dpSink => "A2DP-sink",
            Profile::HfpAg => "HFP-AG",
            Profile::HfpHf => "HFP-HF",
            Profile::HspAg => "HSP-AG",
            Profile::HspHs => "HSP-HS",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.transport_name())
    }
}

/// A2DP codec identifiers as used in the AVDTP media codec capability
/// element and surfaced verbatim in the D-Bus `Codec` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum A2dpCodec {
    Sbc = 0x0000,
    Mpeg12 = 0x0001,
    Mpeg24 = 0x0002,
    AptX = 0x00ff,
    Ldac = 0x01ff,
}

/// HFP codec identifiers as negotiated with `AT+BCS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum HfpCodec {
    Cvsd = 0x0001,
    Msbc = 0x0002,
}

/// The codec currently configured on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportCodec {
    A2dp(A2dpCodec),
    Hfp(HfpCodec),
}

impl TransportCodec {
    /// Canonical codec name used by `GetCodecs` and `SelectCodec`.
    pub fn name(self) -> &'static str {
        match self {
            TransportCodec::A2dp(A2dpCodec::Sbc) => "SBC",
            TransportCodec::A2dp(A2dpCodec::Mpeg12) => "MP3",
            TransportCodec::A2dp(A2dpCodec::Mpeg24) => "AAC",
            TransportCodec::A2dp(A2dpCodec::AptX) => "aptX",
            TransportCodec::A2dp(A2dpCodec::Ldac) => "LDAC",
            TransportCodec::Hfp(HfpCodec::Cvsd) => "CVSD",
            TransportCodec::Hfp(HfpCodec::Msbc) => "mSBC",
        }
    }

    /// Value of the D-Bus `Codec` property.
    pub fn id(self) -> u16 {
        match self {
            TransportCodec::A2dp(c) => c as u16,
            TransportCodec::Hfp(c) => c as u16,
        }
    }

    /// Resolve a canonical A2DP codec name.
    pub fn a2dp_from_name(name: &str) -> Result<Self, Error> {
        let codec = match name {
            "SBC" => A2dpCodec::Sbc,
            "MP3" => A2dpCodec::Mpeg12,
            "AAC" => A2dpCodec::Mpeg24,
            "aptX" => A2dpCodec::AptX,
            "LDAC" => A2dpCodec::Ldac,
            _ => return Err(Error::InvalidArguments(format!("unknown codec: {name}"))),
        };
        Ok(TransportCodec::A2dp(codec))
    }

    /// Resolve a canonical HFP codec name.
    pub fn hfp_from_name(name: &str) -> Result<Self, Error> {
        let codec = match name {
            "CVSD" => HfpCodec::Cvsd,
            "mSBC" => HfpCodec::Msbc,
            _ => return Err(Error::InvalidArguments(format!("unknown codec: {name}"))),
        };
        Ok(TransportCodec::Hfp(codec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbc_is_codec_zero() {
        assert_eq!(TransportCodec::A2dp(A2dpCodec::Sbc).id(), 0x0000);
    }

    #[test]
    fn hfp_codec_ids() {
        assert_eq!(TransportCodec::Hfp(HfpCodec::Cvsd).id(), 0x0001);
        assert_eq!(TransportCodec::Hfp(HfpCodec::Msbc).id(), 0x0002);
    }

    #[test]
    fn ag_profiles_linger() {
        assert!(Profile::HfpAg.is_ag());
        assert!(Profile::HspAg.is_ag());
        assert!(!Profile::HfpHf.is_ag());
        assert!(!Profile::A2dpSource.is_ag());
    }

    #[test]
    fn path_fragments() {
        assert_eq!(Profile::A2dpSink.path_fragment(), "a2dpsnk");
        assert_eq!(Profile::A2dpSource.path_fragment(), "a2dpsrc");
        assert_eq!(Profile::HfpAg.path_fragment(), "hfp");
    }

    #[test]
    fn codec_names_resolve() {
        assert_eq!(
            TransportCodec::a2dp_from_name("SBC").unwrap(),
            TransportCodec::A2dp(A2dpCodec::Sbc)
        );
        assert_eq!(
            TransportCodec::hfp_from_name("mSBC").unwrap(),
            TransportCodec::Hfp(HfpCodec::Msbc)
        );
        assert!(TransportCodec::a2dp_from_name("FLAC").is_err());
    }
}
