//! # bluealsa-audio
//!
//! Audio plumbing shared by the transport I/O threads:
//! - the fixed-byte staging buffer every I/O loop works against
//! - the rate-sync clock that paces encoders at wall-clock speed
//! - sample-format conversion and soft-volume scaling
//! - RTP packet framing and the sink-side reorder window
//! - codec adapters satisfying one encode/decode contract

pub mod codec;
pub mod convert;
pub mod ffb;
pub mod rate;
pub mod rtp;

pub use codec::{Codec, CodecError};
pub use ffb::Ffb;
pub use rate::AsrSync;
pub use rtp::{ReorderBuffer, ReorderEvent, RtpHeader};
