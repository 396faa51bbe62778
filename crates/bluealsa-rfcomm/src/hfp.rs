//! HFP protocol constants.

/// Audio gateway feature bits (`+BRSF` from the AG side).
pub mod ag_features {
    pub const THREE_WAY_CALLING: u32 = 1 << 0;
    pub const EC_NR: u32 = 1 << 1;
    pub const VOICE_RECOGNITION: u32 = 1 << 2;
    pub const INBAND_RING_TONE: u32 = 1 << 3;
    pub const ATTACH_VOICE_TAG: u32 = 1 << 4;
    pub const REJECT_CALL: u32 = 1 << 5;
    pub const ENHANCED_CALL_STATUS: u32 = 1 << 6;
    pub const ENHANCED_CALL_CONTROL: u32 = 1 << 7;
    pub const EXTENDED_ERROR_CODES: u32 = 1 << 8;
    pub const CODEC_NEGOTIATION: u32 = 1 << 9;
    pub const HF_INDICATORS: u32 = 1 << 10;
    pub const ESCO_S4: u32 = 1 << 11;
}

/// Hands-free feature bits (`AT+BRSF` from the HF side).
pub mod hf_features {
    pub const EC_NR: u32 = 1 << 0;
    pub const THREE_WAY_CALLING: u32 = 1 << 1;
    pub const CLI_PRESENTATION: u32 = 1 << 2;
    pub const VOICE_RECOGNITION: u32 = 1 << 3;
    pub const REMOTE_VOLUME_CONTROL: u32 = 1 << 4;
    pub const ENHANCED_CALL_STATUS: u32 = 1 << 5;
    pub const ENHANCED_CALL_CONTROL: u32 = 1 << 6;
    pub const CODEC_NEGOTIATION: u32 = 1 << 7;
    pub const HF_INDICATORS: u32 = 1 << 8;
    pub const ESCO_S4: u32 = 1 << 9;
}

/// Codec identifiers exchanged with `AT+BAC` and `+BCS`.
pub const CODEC_CVSD: u8 = 1;
pub const CODEC_MSBC: u8 = 2;

/// Indicator list advertised with `+CIND`; order defines the indicator
/// indices used by `+CIEV`.
pub const INDICATORS: [(&str, &str); 7] = [
    ("service", "(0,1)"),
    ("call", "(0,1)"),
    ("callsetup", "(0-3)"),
    ("callheld", "(0-2)"),
    ("signal", "(0-5)"),
    ("roam", "(0,1)"),
    ("battchg", "(0-5)"),
];

/// Index (1-based) of the battery-charge indicator.
pub const IND_BATTCHG: usize = 7;

/// The `+CIND=?` capability string.
pub fn cind_capabilities() -> String {
    INDICATORS
        .iter()
        .map(|(name, range)| format!("(\"{name}\",{range})"))
        .collect::<Vec<_>>()
        .join(",")
}

/// The `+CIND?` current-state string; no call is ever in progress.
pub fn cind_state() -> String {
    INDICATORS
        .iter()
        .map(|(name, _)| match *name {
            "service" => "1",
            "signal" => "5",
            "battchg" => "5",
            _ => "0",
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cind_capability_format() {
        let caps = cind_capabilities();
        assert!(caps.starts_with("(\"service\",(0,1))"));
        assert!(caps.contains("(\"battchg\",(0-5))"));
    }

    #[test]
    fn cind_state_matches_indicator_count() {
        assert_eq!(cind_state().split(',').count(), INDICATORS.len());
    }

    #[test]
    fn battchg_index_points_at_battery() {
        assert_eq!(INDICATORS[IND_BATTCHG - 1].0, "battchg");
    }
}
