//! MPEG-1/2 audio (MP3) adapter.
//!
//! Decode-only, like AAC: incoming access units go to a symphonia MP3
//! decoder, encoding is reported as unsupported. The capability helpers
//! cover the 4-byte A2DP MPEG element.

use bluealsa_core::{A2dpCodec, TransportCodec};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_MP3};
use symphonia::core::formats::Packet;

use super::{Codec, CodecError};
use crate::ffb::Ffb;

/// MPEG audio layers in the capability byte.
pub const LAYER_1: u8 = 1 << 7;
pub const LAYER_2: u8 = 1 << 6;
pub const LAYER_3: u8 = 1 << 5;

/// Parsed A2DP MPEG configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpegConfig {
    pub layer: u8,
    pub crc: bool,
    pub channels: u8,
    pub sampling: u32,
    pub vbr: bool,
    pub bitrate_mask: u16,
}

impl MpegConfig {
    /// Parse a configured (single-choice) 4-byte MPEG element.
    pub fn parse(blob: &[u8]) -> Result<Self, CodecError> {
        if blob.len() != 4 {
            return Err(CodecError::InvalidConfiguration(format!(
                "MPEG configuration must be 4 bytes, got {}",
                blob.len()
            )));
        }
        let layer = match blob[0] & 0xe0 {
            LAYER_1 => 1,
            LAYER_2 => 2,
            LAYER_3 => 3,
            _ => return Err(CodecError::InvalidConfiguration("ambiguous MPEG layer".into())),
        };
        let crc = blob[0] & 0x10 != 0;
        let channels = match blob[0] & 0x0f {
            0x08 => 1,
            0x04 | 0x02 | 0x01 => 2,
            _ => return Err(CodecError::InvalidConfiguration("ambiguous MPEG channel mode".into())),
        };
        let sampling = match blob[1] & 0x3f {
            0x20 => 16000,
            0x10 => 22050,
            0x08 => 24000,
            0x04 => 32000,
            0x02 => 44100,
            0x01 => 48000,
            _ => return Err(CodecError::InvalidConfiguration("ambiguous MPEG sampling rate".into())),
        };
        let vbr = blob[2] & 0x80 != 0;
        let bitrate_mask = ((blob[2] & 0x7f) as u16) << 8 | blob[3] as u16;
        Ok(MpegConfig { layer, crc, channels, sampling, vbr, bitrate_mask })
    }
}

/// Decode-only MP3 codec adapter.
pub struct MpegDecoder {
    config: MpegConfig,
    decoder: Box<dyn Decoder>,
}

impl MpegDecoder {
    pub fn new(config: MpegConfig) -> Result<Self, CodecError> {
        if config.layer != 3 {
            return Err(CodecError::NotSupported("MPEG layers other than 3"));
        }
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_MP3);
        params.with_sample_rate(config.sampling);
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| CodecError::InvalidConfiguration(format!("MP3 decoder: {e}")))?;
        Ok(MpegDecoder { config, decoder })
    }

    pub fn config(&self) -> &MpegConfig {
        &self.config
    }
}

impl Codec for MpegDecoder {
    fn codec(&self) -> TransportCodec {
        TransportCodec::A2dp(A2dpCodec::Mpeg12)
    }

    fn encode(&mut self, _pcm: &mut Ffb<i16>, _wire: &mut Ffb<u8>) -> Result<usize, CodecError> {
        Err(CodecError::NotSupported("MP3 encoding"))
    }

    fn decode(&mut self, wire: &mut Ffb<u8>, pcm: &mut Ffb<i16>) -> Result<usize, CodecError> {
        if wire.len_out() == 0 {
            return Ok(0);
        }
        let au = wire.data().to_vec().into_boxed_slice();
        wire.rewind();
        let packet = Packet::new_from_boxed_slice(0, 0, 0, au);
        match self.decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let mut buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                pcm.append(buf.samples());
                Ok(1)
            }
            Err(err) => {
                tracing::warn!("MP3 decode error: {err}");
                Ok(0)
            }
        }
    }

    fn reset(&mut self) {
        self.decoder.reset();
    }

    fn frame_pcm_samples(&self) -> usize {
        1152 * self.config.channels as usize
    }

    fn frame_wire_bytes(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_44100_blob() -> [u8; 4] {
        // Layer 3, CRC, joint stereo, 44100 Hz, VBR.
        [LAYER_3 | 0x10 | 0x01, 0x02, 0x80, 0x00]
    }

    #[test]
    fn parse_stereo_44100() {
        let config = MpegConfig::parse(&stereo_44100_blob()).unwrap();
        assert_eq!(config.layer, 3);
        assert!(config.crc);
        assert_eq!(config.channels, 2);
        assert_eq!(config.sampling, 44100);
        assert!(config.vbr);
    }

    #[test]
    fn parse_rejects_bad_length() {
        assert!(MpegConfig::parse(&[0u8; 6]).is_err());
    }

    #[test]
    fn parse_rejects_multiple_layers() {
        let mut blob = stereo_44100_blob();
        blob[0] |= LAYER_2;
        assert!(MpegConfig::parse(&blob).is_err());
    }

    #[test]
    fn only_layer_3_is_decodable() {
        let blob = [LAYER_2 | 0x01, 0x02, 0x00, 0x00];
        let config = MpegConfig::parse(&blob).unwrap();
        assert!(matches!(MpegDecoder::new(config), Err(CodecError::NotSupported(_))));
    }
}
