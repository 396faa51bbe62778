//! Immutable runtime configuration.
//!
//! Built once from the command line and passed to each component
//! constructor; nothing in here changes after start-up.

use crate::profile::Profile;

/// Which side of HFP/HSP the daemon plays for SCO transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HfRole {
    AudioGateway,
    HandsFree,
}

/// Runtime configuration record.
#[derive(Debug, Clone)]
pub struct Config {
    /// D-Bus service name suffix; the bus name becomes
    /// `org.bluealsa.<suffix>` when set.
    pub service_suffix: Option<String>,
    /// HCI adapters to serve; empty means all.
    pub adapters: Vec<String>,
    /// Profiles enabled at start-up.
    pub profiles: Vec<Profile>,
    /// Whether mSBC may be negotiated over HFP.
    pub enable_msbc: bool,
    /// Default for the PCM `SoftVolume` property.
    pub soft_volume: bool,
    /// Initial A2DP volume level, 0–127.
    pub initial_volume: u8,
    /// Keep A2DP transports alive this many seconds after the last
    /// client closes; zero releases immediately.
    pub keep_alive: u64,
}

impl Config {
    /// True when the given profile was enabled on the command line.
    pub fn profile_enabled(&self, profile: Profile) -> bool {
        self.profiles.contains(&profile)
    }

    /// True when the given adapter should be served.
    pub fn adapter_enabled(&self, name: &str) -> bool {
        self.adapters.is_empty() || self.adapters.iter().any(|a| a == name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service_suffix: None,
            adapters: Vec::new(),
            profiles: vec![Profile::A2dpSource, Profile::A2dpSink, Profile::HfpAg, Profile::HspAg],
            enable_msbc: true,
            soft_volume: true,
            initial_volume: 127,
            keep_alive: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profiles() {
        let config = Config::default();
        assert!(config.profile_enabled(Profile::A2dpSink));
        assert!(config.profile_enabled(Profile::HfpAg));
        assert!(!config.profile_enabled(Profile::HfpHf));
    }

    #[test]
    fn empty_adapter_filter_matches_all() {
        let config = Config::default();
        assert!(config.adapter_enabled("hci0"));
        assert!(config.adapter_enabled("hci9"));
    }

    #[test]
    fn adapter_filter_restricts() {
        let config = Config { adapters: vec!["hci1".into()], ..Config::default() };
        assert!(!config.adapter_enabled("hci0"));
        assert!(config.adapter_enabled("hci1"));
    }
}
