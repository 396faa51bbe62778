//! mSBC adapter: wide-band speech frames over eSCO.
//!
//! Every 7.5 ms block of 120 samples becomes one 57-byte mSBC frame
//! wrapped in the 2-byte H2 synchronization header, 60 bytes with the
//! trailing pad. The decoder scans for the H2 pattern so it survives
//! arbitrary SCO packetization.

use bluealsa_core::{HfpCodec, TransportCodec};

use super::sbc::{SbcCodec, SbcParams};
use super::{Codec, CodecError};
use crate::ffb::Ffb;

/// H2 header: first byte is fixed, the second carries a 2-bit sequence
/// number spread over four bit positions.
pub const H2_HEADER_0: u8 = 0x01;
pub const H2_SEQUENCES: [u8; 4] = [0x08, 0x38, 0xc8, 0xf8];

/// mSBC frame length without the H2 header.
pub const FRAME_LEN: usize = 57;
/// H2 header plus frame.
pub const H2_FRAME_LEN: usize = 2 + FRAME_LEN;
/// PCM samples per frame.
pub const FRAME_SAMPLES: usize = 120;

pub struct MsbcCodec {
    sbc: SbcCodec,
    /// Encoder-side H2 sequence counter.
    sequence: usize,
}

impl MsbcCodec {
    pub fn new() -> Self {
        MsbcCodec { sbc: SbcCodec::new(SbcParams::msbc()), sequence: 0 }
    }
}

impl Default for MsbcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for MsbcCodec {
    fn codec(&self) -> TransportCodec {
        TransportCodec::Hfp(HfpCodec::Msbc)
    }

    fn encode(&mut self, pcm: &mut Ffb<i16>, wire: &mut Ffb<u8>) -> Result<usize, CodecError> {
        let mut frames = 0;
        let mut frame = Vec::with_capacity(H2_FRAME_LEN);
        while pcm.len_out() >= FRAME_SAMPLES && wire.len_in() >= H2_FRAME_LEN {
            frame.clear();
            frame.push(H2_HEADER_0);
            frame.push(H2_SEQUENCES[self.sequence]);
            self.sequence = (self.sequence + 1) % 4;

            let block: Vec<i16> = pcm.data()[..FRAME_SAMPLES].to_vec();
            self.sbc.encode_frame(&block, &mut frame)?;
            debug_assert_eq!(frame.len(), H2_FRAME_LEN);

            wire.append(&frame);
            pcm.shift(FRAME_SAMPLES);
            frames += 1;
        }
        Ok(frames)
    }

    fn decode(&mut self, wire: &mut Ffb<u8>, pcm: &mut Ffb<i16>) -> Result<usize, CodecError> {
        let mut frames = 0;
        while wire.len_out() >= H2_FRAME_LEN && pcm.len_in() >= FRAME_SAMPLES {
            let data = wire.data();
            if data[0] != H2_HEADER_0 || !H2_SEQUENCES.contains(&data[1]) {
                wire.shift(1);
                continue;
            }
            let mut out = Vec::with_capacity(FRAME_SAMPLES);
            match self.sbc.decode_frame(&data[2..], &mut out) {
                Ok(consumed) => {
                    debug_assert_eq!(consumed, FRAME_LEN);
                    pcm.append(&out);
                    wire.shift(2 + consumed);
                    frames += 1;
                }
                Err(err) => {
                    tracing::warn!("mSBC decode error: {err}");
                    wire.shift(1);
                }
            }
        }
        Ok(frames)
    }

    fn reset(&mut self) {
        self.sequence = 0;
    }

    fn frame_pcm_samples(&self) -> usize {
        FRAME_SAMPLES
    }

    fn frame_wire_bytes(&self) -> usize {
        H2_FRAME_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speech_like(frames: usize) -> Vec<i16> {
        (0..frames * FRAME_SAMPLES)
            .map(|i| {
                let t = i as f32 / 16000.0;
                ((2.0 * std::f32::consts::PI * 300.0 * t).sin() * 9000.0
                    + (2.0 * std::f32::consts::PI * 1100.0 * t).sin() * 3000.0) as i16
            })
            .collect()
    }

    #[test]
    fn h2_sequence_cycles() {
        let mut codec = MsbcCodec::new();
        let mut pcm: Ffb<i16> = Ffb::new(FRAME_SAMPLES * 8);
        let mut wire: Ffb<u8> = Ffb::new(H2_FRAME_LEN * 8);
        pcm.append(&speech_like(5));
        assert_eq!(codec.encode(&mut pcm, &mut wire).unwrap(), 5);
        for (i, frame) in wire.data().chunks_exact(H2_FRAME_LEN).enumerate() {
            assert_eq!(frame[0], H2_HEADER_0);
            assert_eq!(frame[1], H2_SEQUENCES[i % 4]);
            assert_eq!(frame[2], super::super::sbc::SYNCWORD_MSBC);
        }
    }

    #[test]
    fn roundtrip_over_odd_packetization() {
        let mut codec = MsbcCodec::new();
        let input = speech_like(8);
        let mut pcm: Ffb<i16> = Ffb::new(input.len());
        let mut wire: Ffb<u8> = Ffb::new(H2_FRAME_LEN * 8);
        pcm.append(&input);
        codec.encode(&mut pcm, &mut wire).unwrap();

        // Feed the decoder in 24-byte chunks, the size many controllers
        // actually deliver, regardless of the 57+2 byte frame.
        let stream: Vec<u8> = wire.data().to_vec();
        let mut inbox: Ffb<u8> = Ffb::new(H2_FRAME_LEN * 2);
        let mut out: Ffb<i16> = Ffb::new(input.len());
        let mut decoded = 0;
        for chunk in stream.chunks(24) {
            inbox.append(chunk);
            decoded += codec.decode(&mut inbox, &mut out).unwrap();
        }
        assert_eq!(decoded, 8);
        assert_eq!(out.len_out(), input.len());
    }

    #[test]
    fn garbage_between_frames_skipped() {
        let mut codec = MsbcCodec::new();
        let mut pcm: Ffb<i16> = Ffb::new(FRAME_SAMPLES * 2);
        let mut wire: Ffb<u8> = Ffb::new(H2_FRAME_LEN * 4);
        pcm.append(&speech_like(1));
        codec.encode(&mut pcm, &mut wire).unwrap();

        let frame: Vec<u8> = wire.data().to_vec();
        let mut noisy: Ffb<u8> = Ffb::new(256);
        noisy.append(&[0x55, 0xaa, 0x00]);
        noisy.append(&frame);
        let mut out: Ffb<i16> = Ffb::new(FRAME_SAMPLES * 2);
        assert_eq!(codec.decode(&mut noisy, &mut out).unwrap(), 1);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut codec = MsbcCodec::new();
        let mut pcm: Ffb<i16> = Ffb::new(FRAME_SAMPLES * 2);
        let mut wire: Ffb<u8> = Ffb::new(H2_FRAME_LEN * 2);
        pcm.append(&speech_like(1));
        codec.encode(&mut pcm, &mut wire).unwrap();
        codec.reset();
        wire.rewind();
        pcm.append(&speech_like(1));
        codec.encode(&mut pcm, &mut wire).unwrap();
        assert_eq!(wire.data()[1], H2_SEQUENCES[0]);
    }
}
