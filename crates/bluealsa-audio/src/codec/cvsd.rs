//! CVSD adapter.
//!
//! CVSD itself lives in the controller; the host side carries raw
//! signed 16-bit PCM over the SCO socket, so the adapter is a
//! byte-for-byte passthrough chunked to the link MTU.

use bluealsa_core::{HfpCodec, TransportCodec};

use super::{Codec, CodecError};
use crate::convert;
use crate::ffb::Ffb;

/// Passthrough adapter for narrow-band SCO audio.
pub struct CvsdCodec {
    /// Wire bytes per SCO packet; one frame equals one packet.
    mtu: usize,
}

impl CvsdCodec {
    pub fn new(mtu: usize) -> Self {
        CvsdCodec { mtu: mtu.max(2) & !1 }
    }
}

impl Codec for CvsdCodec {
    fn codec(&self) -> TransportCodec {
        TransportCodec::Hfp(HfpCodec::Cvsd)
    }

    fn encode(&mut self, pcm: &mut Ffb<i16>, wire: &mut Ffb<u8>) -> Result<usize, CodecError> {
        let samples_per_frame = self.mtu / 2;
        let mut frames = 0;
        let mut bytes = Vec::new();
        while pcm.len_out() >= samples_per_frame && wire.len_in() >= self.mtu {
            convert::s16_to_bytes(&pcm.data()[..samples_per_frame], &mut bytes);
            wire.append(&bytes);
            pcm.shift(samples_per_frame);
            frames += 1;
        }
        Ok(frames)
    }

    fn decode(&mut self, wire: &mut Ffb<u8>, pcm: &mut Ffb<i16>) -> Result<usize, CodecError> {
        let mut frames = 0;
        let mut samples = Vec::new();
        while wire.len_out() >= self.mtu && pcm.len_in() >= self.mtu / 2 {
            convert::bytes_to_s16(&wire.data()[..self.mtu], &mut samples);
            pcm.append(&samples);
            wire.shift(self.mtu);
            frames += 1;
        }
        Ok(frames)
    }

    fn reset(&mut self) {}

    fn frame_pcm_samples(&self) -> usize {
        self.mtu / 2
    }

    fn frame_wire_bytes(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_is_bit_identical() {
        let mut codec = CvsdCodec::new(48);
        let mut pcm: Ffb<i16> = Ffb::new(256);
        let mut wire: Ffb<u8> = Ffb::new(512);
        let input: Vec<i16> = (0..96).map(|i| (i * 257 - 12000) as i16).collect();
        pcm.append(&input);

        let frames = codec.encode(&mut pcm, &mut wire).unwrap();
        assert_eq!(frames, 4);
        assert_eq!(pcm.len_out(), 0);
        assert_eq!(wire.len_out(), 192);

        let mut out: Ffb<i16> = Ffb::new(256);
        let frames = codec.decode(&mut wire, &mut out).unwrap();
        assert_eq!(frames, 4);
        assert_eq!(out.data(), &input[..]);
    }

    #[test]
    fn partial_frame_waits_for_input() {
        let mut codec = CvsdCodec::new(48);
        let mut pcm: Ffb<i16> = Ffb::new(256);
        let mut wire: Ffb<u8> = Ffb::new(512);
        pcm.append(&[1i16; 10]);
        assert_eq!(codec.encode(&mut pcm, &mut wire).unwrap(), 0);
        assert_eq!(pcm.len_out(), 10);
    }

    #[test]
    fn odd_mtu_rounded_down() {
        let codec = CvsdCodec::new(49);
        assert_eq!(codec.frame_wire_bytes(), 48);
    }
}
