//! bluealsad, the Bluetooth audio daemon.
//!
//! Bridges A2DP and HFP/HSP transports of remote Bluetooth devices to
//! local PCM clients over the `org.bluealsa` D-Bus service.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bluealsa_core::{Config, Profile};
use bluealsa_dbus::{bluez, BluealsaService};
use bluealsa_engine::Engine;

#[derive(Parser, Debug)]
#[command(name = "bluealsad", version, about = "Bluetooth audio daemon")]
struct Cli {
    /// D-Bus service name suffix (org.bluealsa.SUFFIX).
    #[arg(short = 'B', long = "dbus")]
    dbus_suffix: Option<String>,

    /// HCI adapter to serve; may be given multiple times. Default: all.
    #[arg(short = 'i', long = "device")]
    adapters: Vec<String>,

    /// Profile to enable; may be given multiple times.
    /// One of: a2dp-source, a2dp-sink, hfp-ag, hfp-hf, hsp-ag, hsp-hs.
    #[arg(short = 'p', long = "profile")]
    profiles: Vec<String>,

    /// Disable mSBC codec negotiation over HFP.
    #[arg(long)]
    no_msbc: bool,

    /// Disable client-side software volume scaling by default.
    #[arg(long)]
    no_soft_volume: bool,

    /// Initial A2DP volume level (0-127).
    #[arg(long, default_value_t = 127)]
    initial_volume: u8,

    /// Seconds to keep an idle A2DP transport acquired after the last
    /// client closes.
    #[arg(long, default_value_t = 0)]
    keep_alive: u64,
}

fn parse_profile(name: &str) -> Option<Profile> {
    Some(match name {
        "a2dp-source" => Profile::A2dpSource,
        "a2dp-sink" => Profile::A2dpSink,
        "hfp-ag" => Profile::HfpAg,
        "hfp-hf" => Profile::HfpHf,
        "hsp-ag" => Profile::HspAg,
        "hsp-hs" => Profile::HspHs,
        _ => return None,
    })
}

fn build_config(cli: &Cli) -> Result<Config, String> {
    let mut config = Config {
        service_suffix: cli.dbus_suffix.clone(),
        adapters: cli.adapters.clone(),
        enable_msbc: !cli.no_msbc,
        soft_volume: !cli.no_soft_volume,
        initial_volume: cli.initial_volume.min(127),
        keep_alive: cli.keep_alive,
        ..Config::default()
    };
    if !cli.profiles.is_empty() {
        let mut profiles = Vec::new();
        for name in &cli.profiles {
            let profile =
                parse_profile(name).ok_or_else(|| format!("unknown profile: {name}"))?;
            profiles.push(profile);
        }
        config.profiles = profiles;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("bluealsad=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = match build_config(&cli) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!("Configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let (listener, events) = BluealsaService::listener();
    let engine = Engine::new(config.clone(), listener);

    // Create the adapter objects for everything we can see up front, so
    // the Adapters property is populated before the first connection.
    match bluealsa_engine::hci::enumerate() {
        Ok(devices) => {
            for dev in devices {
                if config.adapter_enabled(&dev.name) {
                    let _ = engine.adapter_get_or_create(dev.dev_id);
                    info!("Serving adapter: {} ({})", dev.name, dev.address);
                }
            }
        }
        Err(err) => info!("No adapters enumerated yet: {err}"),
    }

    let service = BluealsaService::start(engine.clone(), config.clone(), events)
        .await
        .context("couldn't register D-Bus service")?;
    bluez::register(&service.connection, &engine, &config)
        .await
        .context("couldn't register with the Bluetooth daemon")?;

    info!("bluealsad {} up", env!("CARGO_PKG_VERSION"));
    wait_for_shutdown().await;

    info!("Shutting down");
    engine.shutdown();
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("SIGINT handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_parse() {
        assert_eq!(parse_profile("a2dp-sink"), Some(Profile::A2dpSink));
        assert_eq!(parse_profile("hfp-ag"), Some(Profile::HfpAg));
        assert_eq!(parse_profile("bogus"), None);
    }

    #[test]
    fn config_from_cli() {
        let cli = Cli::parse_from(["bluealsad", "-i", "hci0", "-p", "a2dp-sink", "--no-msbc"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.adapters, vec!["hci0"]);
        assert_eq!(config.profiles, vec![Profile::A2dpSink]);
        assert!(!config.enable_msbc);
        assert!(config.soft_volume);
    }

    #[test]
    fn bad_profile_is_a_config_error() {
        let cli = Cli::parse_from(["bluealsad", "-p", "nope"]);
        assert!(build_config(&cli).is_err());
    }
}
