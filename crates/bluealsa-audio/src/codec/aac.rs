//! AAC adapter.
//!
//! Decode-only: sink transports hand incoming access units to a
//! symphonia AAC decoder. Encoding is reported as unsupported by this
//! build. The capability helpers parse and build the 6-byte A2DP AAC
//! element and the matching AudioSpecificConfig.

use bluealsa_core::{A2dpCodec, TransportCodec};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_AAC};
use symphonia::core::formats::Packet;

use super::{Codec, CodecError};
use crate::ffb::Ffb;

/// AAC object types advertised in the capability element.
pub const OBJECT_MPEG2_LC: u8 = 0x80;
pub const OBJECT_MPEG4_LC: u8 = 0x40;

/// Parsed A2DP AAC configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AacConfig {
    pub object_type: u8,
    pub sampling: u32,
    pub channels: u8,
    pub bitrate: u32,
    pub vbr: bool,
}

const SAMPLING_RATES: [(u32, u16); 12] = [
    (8000, 0x0800),
    (11025, 0x0400),
    (12000, 0x0200),
    (16000, 0x0100),
    (22050, 0x0080),
    (24000, 0x0040),
    (32000, 0x0020),
    (44100, 0x0010),
    (48000, 0x0008),
    (64000, 0x0004),
    (88200, 0x0002),
    (96000, 0x0001),
];

impl AacConfig {
    /// Parse a configured (single-choice) 6-byte AAC element.
    pub fn parse(blob: &[u8]) -> Result<Self, CodecError> {
        if blob.len() != 6 {
            return Err(CodecError::InvalidConfiguration(format!(
                "AAC configuration must be 6 bytes, got {}",
                blob.len()
            )));
        }
        let object_type = match blob[0] {
            OBJECT_MPEG2_LC | OBJECT_MPEG4_LC => blob[0],
            other => {
                return Err(CodecError::InvalidConfiguration(format!(
                    "unsupported AAC object type {other:#04x}"
                )))
            }
        };
        let mask = (blob[1] as u16) << 4 | (blob[2] >> 4) as u16;
        let sampling = SAMPLING_RATES
            .iter()
            .find(|(_, bit)| mask == *bit)
            .map(|(hz, _)| *hz)
            .ok_or_else(|| CodecError::InvalidConfiguration("ambiguous AAC sampling rate".into()))?;
        let channels = match blob[2] & 0x0c {
            0x08 => 1,
            0x04 => 2,
            _ => return Err(CodecError::InvalidConfiguration("ambiguous AAC channels".into())),
        };
        let vbr = blob[3] & 0x80 != 0;
        let bitrate =
            ((blob[3] & 0x7f) as u32) << 16 | (blob[4] as u32) << 8 | blob[5] as u32;
        Ok(AacConfig { object_type, sampling, channels, bitrate, vbr })
    }

    /// MPEG-4 sampling frequency index for the AudioSpecificConfig.
    fn frequency_index(&self) -> Result<u8, CodecError> {
        const TABLE: [u32; 12] =
            [96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000];
        TABLE
            .iter()
            .position(|hz| *hz == self.sampling)
            .map(|i| i as u8)
            .ok_or_else(|| CodecError::InvalidConfiguration("no frequency index".into()))
    }

    /// The 2-byte AudioSpecificConfig the decoder is primed with.
    pub fn audio_specific_config(&self) -> Result<[u8; 2], CodecError> {
        // 5 bits object type (AAC-LC = 2), 4 bits frequency index,
        // 4 bits channel configuration, 3 bits zero.
        let aot = 2u16;
        let freq = self.frequency_index()? as u16;
        let ch = self.channels as u16;
        let word = aot << 11 | freq << 7 | ch << 3;
        Ok(word.to_be_bytes())
    }
}

/// Decode-only AAC codec adapter.
pub struct AacDecoder {
    config: AacConfig,
    decoder: Box<dyn Decoder>,
}

impl AacDecoder {
    pub fn new(config: AacConfig) -> Result<Self, CodecError> {
        let asc = config.audio_specific_config()?;
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_AAC);
        params.with_sample_rate(config.sampling);
        params.with_extra_data(asc.to_vec().into_boxed_slice());
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| CodecError::InvalidConfiguration(format!("AAC decoder: {e}")))?;
        Ok(AacDecoder { config, decoder })
    }

    pub fn config(&self) -> &AacConfig {
        &self.config
    }
}

impl Codec for AacDecoder {
    fn codec(&self) -> TransportCodec {
        TransportCodec::A2dp(A2dpCodec::Mpeg24)
    }

    fn encode(&mut self, _pcm: &mut Ffb<i16>, _wire: &mut Ffb<u8>) -> Result<usize, CodecError> {
        Err(CodecError::NotSupported("AAC encoding"))
    }

    fn decode(&mut self, wire: &mut Ffb<u8>, pcm: &mut Ffb<i16>) -> Result<usize, CodecError> {
        if wire.len_out() == 0 {
            return Ok(0);
        }
        // One access unit per call; the RTP layer reassembles fragments.
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
                // A corrupted unit costs one frame of audio, nothing more.
                tracing::warn!("AAC decode error: {err}");
                Ok(0)
            }
        }
    }

    fn reset(&mut self) {
        self.decoder.reset();
    }

    fn frame_pcm_samples(&self) -> usize {
        1024 * self.config.channels as usize
    }

    fn frame_wire_bytes(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_44100_blob() -> [u8; 6] {
        // MPEG4 LC, 44100 Hz, 2 channels, VBR, 320 kbit.
        [OBJECT_MPEG4_LC, 0x01, 0x04, 0x84, 0xe2, 0x00]
    }

    #[test]
    fn parse_stereo_44100() {
        let config = AacConfig::parse(&stereo_44100_blob()).unwrap();
        assert_eq!(config.object_type, OBJECT_MPEG4_LC);
        assert_eq!(config.sampling, 44100);
        assert_eq!(config.channels, 2);
        assert!(config.vbr);
        assert_eq!(config.bitrate, 0x04e200);
    }

    #[test]
    fn parse_rejects_bad_length() {
        assert!(AacConfig::parse(&[0u8; 4]).is_err());
    }

    #[test]
    fn parse_rejects_multiple_rates() {
        let mut blob = stereo_44100_blob();
        blob[2] |= 0x80; // both 44100 and 48000 set
        assert!(AacConfig::parse(&blob).is_err());
    }

    #[test]
    fn audio_specific_config_layout() {
        let config = AacConfig::parse(&stereo_44100_blob()).unwrap();
        let asc = config.audio_specific_config().unwrap();
        // AAC-LC (2), index 4 (44100), 2 channels:
        // 00010 0100 0010 000 -> 0x12 0x10
        assert_eq!(asc, [0x12, 0x10]);
    }

    #[test]
    fn encode_is_not_supported() {
        let config = AacConfig::parse(&stereo_44100_blob()).unwrap();
        if let Ok(mut codec) = AacDecoder::new(config) {
            let mut pcm: Ffb<i16> = Ffb::new(64);
            let mut wire: Ffb<u8> = Ffb::new(64);
            assert!(matches!(
                codec.encode(&mut pcm, &mut wire),
                Err(CodecError::NotSupported(_))
            ));
        }
    }

    #[test]
    fn garbage_unit_is_absorbed() {
        let config = AacConfig::parse(&stereo_44100_blob()).unwrap();
        if let Ok(mut codec) = AacDecoder::new(config) {
            let mut pcm: Ffb<i16> = Ffb::new(8192);
            let mut wire: Ffb<u8> = Ffb::new(64);
            wire.append(&[0xde, 0xad, 0xbe, 0xef]);
            assert_eq!(codec.decode(&mut wire, &mut pcm).unwrap(), 0);
            assert_eq!(wire.len_out(), 0);
        }
    }
}
