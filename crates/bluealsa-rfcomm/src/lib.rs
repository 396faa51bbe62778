//! # bluealsa-rfcomm
//!
//! Line-oriented AT command traffic over the RFCOMM channel: parsing,
//! the HFP/HSP service-level-connection handshake and the steady-state
//! event handling (volume, codec selection, battery reporting).

pub mod at;
pub mod hfp;
pub mod session;

pub use at::{AtKind, AtMessage};
pub use session::RfcommSession;
