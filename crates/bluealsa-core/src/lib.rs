//! # bluealsa-core
//!
//! Core types shared across the Bluetooth audio daemon crates.
//!
//! This crate provides:
//! - Bluetooth device addressing and D-Bus path construction
//! - Transport profile and codec identification
//! - The 16-bit PCM format word and the packed volume word
//! - The daemon-wide error taxonomy
//! - The immutable runtime configuration record

pub mod address;
pub mod config;
pub mod error;
pub mod format;
pub mod profile;
pub mod volume;

pub use address::BdAddr;
pub use config::Config;
pub use error::{Error, Result};
pub use format::PcmFormat;
pub use profile::{A2dpCodec, HfpCodec, Profile, TransportCodec};
pub use volume::Volume;
