//! Codec adapters.
//!
//! Every codec the engine can place on a transport satisfies one
//! contract: whole frames are consumed from one staging buffer and
//! produced into the other, the call never blocks, and returning zero
//! frames means "more input needed". Transports hold a boxed [`Codec`]
//! and the I/O loops dispatch through it.

use bluealsa_core::TransportCodec;
use thiserror::Error;

use crate::ffb::Ffb;

pub mod aac;
pub mod cvsd;
pub mod mpeg;
pub mod msbc;
pub mod sbc;
pub mod vendor;

pub use aac::AacDecoder;
pub use cvsd::CvsdCodec;
pub use mpeg::MpegDecoder;
pub use msbc::MsbcCodec;
pub use sbc::{SbcCodec, SbcParams};

/// Errors raised by codec adapters.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid codec configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Corrupted bitstream: {0}")]
    Bitstream(String),

    #[error("Codec not supported by this build: {0}")]
    NotSupported(&'static str),
}

impl From<CodecError> for bluealsa_core::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::NotSupported(name) => bluealsa_core::Error::NotSupported(name.into()),
            other => bluealsa_core::Error::Codec(other.to_string()),
        }
    }
}

/// The uniform encode/decode contract.
pub trait Codec: Send {
    /// Identity of this codec, as surfaced on the bus.
    fn codec(&self) -> TransportCodec;

    /// Consume whole frames of PCM from `pcm` and append wire bytes to
    /// `wire`. Returns the number of frames produced; zero means more
    /// input is needed. Never blocks.
    fn encode(&mut self, pcm: &mut Ffb<i16>, wire: &mut Ffb<u8>) -> Result<usize, CodecError>;

    /// Consume whole frames of wire data from `wire` and append PCM to
    /// `pcm`. Returns the number of frames produced. Never blocks.
    fn decode(&mut self, wire: &mut Ffb<u8>, pcm: &mut Ffb<i16>) -> Result<usize, CodecError>;

    /// Drop all internal state; called when the transport loses its
    /// Bluetooth socket.
    fn reset(&mut self);

    /// PCM samples (all channels) consumed per encoded frame.
    fn frame_pcm_samples(&self) -> usize;

    /// Wire bytes per frame; zero for variable-rate codecs.
    fn frame_wire_bytes(&self) -> usize;
}
