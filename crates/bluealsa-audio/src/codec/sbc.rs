//! SBC codec.
//!
//! Implements the low-complexity subband codec framing used by A2DP
//! (syncword 0x9C) and, with fixed parameters, by wide-band speech as
//! mSBC (syncword 0xAD): header and CRC-8, scale factors, adaptive bit
//! allocation, quantization and the subband transform pair.

use bluealsa_core::{A2dpCodec, TransportCodec};

use super::{Codec, CodecError};
use crate::ffb::Ffb;

pub const SYNCWORD: u8 = 0x9c;
pub const SYNCWORD_MSBC: u8 = 0xad;

/// Maximum bitpool accepted from a peer.
pub const MAX_BITPOOL: u8 = 250;

/// Sampling frequencies expressible in the SBC header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Hz16000,
    Hz32000,
    Hz44100,
    Hz48000,
}

impl Frequency {
    pub fn as_hz(self) -> u32 {
        match self {
            Frequency::Hz16000 => 16000,
            Frequency::Hz32000 => 32000,
            Frequency::Hz44100 => 44100,
            Frequency::Hz48000 => 48000,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Frequency::Hz16000 => 0,
            Frequency::Hz32000 => 1,
            Frequency::Hz44100 => 2,
            Frequency::Hz48000 => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Frequency::Hz16000,
            1 => Frequency::Hz32000,
            2 => Frequency::Hz44100,
            _ => Frequency::Hz48000,
        }
    }
}

/// Channel coding modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Mono,
    DualChannel,
    Stereo,
    JointStereo,
}

impl ChannelMode {
    pub fn channels(self) -> usize {
        match self {
            ChannelMode::Mono => 1,
            _ => 2,
        }
    }

    fn bits(self) -> u8 {
        match self {
            ChannelMode::Mono => 0,
            ChannelMode::DualChannel => 1,
            ChannelMode::Stereo => 2,
            ChannelMode::JointStereo => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => ChannelMode::Mono,
            1 => ChannelMode::DualChannel,
            2 => ChannelMode::Stereo,
            _ => ChannelMode::JointStereo,
        }
    }
}

/// Bit allocation methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Loudness,
    Snr,
}

/// Complete SBC stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcParams {
    pub frequency: Frequency,
    /// 4, 8, 12 or 16; mSBC uses 15.
    pub blocks: u8,
    /// 4 or 8.
    pub subbands: u8,
    pub mode: ChannelMode,
    pub allocation: Allocation,
    pub bitpool: u8,
    /// mSBC framing: 0xAD syncword, reserved header bytes.
    pub msbc: bool,
}

impl SbcParams {
    /// The fixed wide-band speech configuration.
    pub fn msbc() -> Self {
        SbcParams {
            frequency: Frequency::Hz16000,
            blocks: 15,
            subbands: 8,
            mode: ChannelMode::Mono,
            allocation: Allocation::Loudness,
            bitpool: 26,
            msbc: true,
        }
    }

    /// PCM samples (all channels) consumed per frame.
    pub fn frame_samples(&self) -> usize {
        self.blocks as usize * self.subbands as usize * self.mode.channels()
    }

    /// PCM bytes consumed per frame.
    pub fn codesize(&self) -> usize {
        self.frame_samples() * 2
    }

    /// Encoded frame length in bytes.
    pub fn frame_len(&self) -> usize {
        let nch = self.mode.channels();
        let nsub = self.subbands as usize;
        let blocks = self.blocks as usize;
        let bitpool = self.bitpool as usize;
        let header = 4 + (4 * nsub * nch) / 8;
        let payload_bits = match self.mode {
            ChannelMode::Mono | ChannelMode::DualChannel => blocks * nch * bitpool,
            ChannelMode::Stereo => blocks * bitpool,
            ChannelMode::JointStereo => nsub + blocks * bitpool,
        };
        header + payload_bits.div_ceil(8)
    }

    /// Largest bitpool the allocator can spend: 16 bits per quantized
    /// subband sample.
    pub fn max_bitpool(&self) -> u8 {
        let per_block = match self.mode {
            ChannelMode::Mono | ChannelMode::DualChannel => 16 * self.subbands as usize,
            ChannelMode::Stereo | ChannelMode::JointStereo => 32 * self.subbands as usize,
        };
        per_block.min(MAX_BITPOOL as usize) as u8
    }

    /// Parse the parameters of a standard SBC frame header.
    fn from_header(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 3 {
            return Err(CodecError::Bitstream("truncated SBC header".into()));
        }
        if data[0] == SYNCWORD_MSBC {
            return Ok(SbcParams::msbc());
        }
        if data[0] != SYNCWORD {
            return Err(CodecError::Bitstream(format!("bad syncword {:#04x}", data[0])));
        }
        let params = SbcParams {
            frequency: Frequency::from_bits(data[1] >> 6),
            blocks: 4 * (((data[1] >> 4) & 0x03) + 1),
            subbands: if data[1] & 0x01 != 0 { 8 } else { 4 },
            mode: ChannelMode::from_bits(data[1] >> 2),
            allocation: if data[1] & 0x02 != 0 { Allocation::Snr } else { Allocation::Loudness },
            bitpool: data[2],
            msbc: false,
        };
        if params.bitpool < 2 || params.bitpool > params.max_bitpool() {
            return Err(CodecError::Bitstream(format!("bitpool {} out of range", params.bitpool)));
        }
        Ok(params)
    }

    fn header_byte(&self) -> u8 {
        (self.frequency.bits() << 6)
            | (((self.blocks / 4) - 1) << 4)
            | (self.mode.bits() << 2)
            | (((self.allocation == Allocation::Snr) as u8) << 1)
            | ((self.subbands == 8) as u8)
    }
}

/// Loudness offset table for 4 subbands, indexed by frequency.
const OFFSET4: [[i32; 4]; 4] = [
    [-1, 0, 0, 0],
    [-2, 0, 0, 1],
    [-2, 0, 0, 1],
    [-2, 0, 0, 1],
];

/// Loudness offset table for 8 subbands, indexed by frequency.
const OFFSET8: [[i32; 8]; 4] = [
    [-2, 0, 0, 0, 0, 0, 0, 1],
    [-3, 0, 0, 0, 0, 0, 1, 2],
    [-4, 0, 0, 0, 0, 0, 1, 2],
    [-4, 0, 0, 0, 0, 0, 1, 2],
];

fn crc_bit(crc: u8, bit: u8) -> u8 {
    let fed = ((crc >> 7) ^ bit) & 1;
    let shifted = crc << 1;
    if fed != 0 {
        shifted ^ 0x1d
    } else {
        shifted
    }
}

fn crc_byte(mut crc: u8, byte: u8) -> u8 {
    for i in (0..8).rev() {
        crc = crc_bit(crc, (byte >> i) & 1);
    }
    crc
}

struct BitWriter {
    buf: Vec<u8>,
    bits: u32,
    acc: u64,
}

impl BitWriter {
    fn new() -> Self {
        BitWriter { buf: Vec::new(), bits: 0, acc: 0 }
    }

    fn put(&mut self, value: u32, bits: u32) {
        debug_assert!(bits <= 32);
        self.acc = (self.acc << bits) | (value as u64 & ((1u64 << bits) - 1));
        self.bits += bits;
        while self.bits >= 8 {
            self.bits -= 8;
            self.buf.push((self.acc >> self.bits) as u8);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bits > 0 {
            let pad = 8 - self.bits;
            self.put(0, pad);
        }
        self.buf
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BitReader { data, pos: 0 }
    }

    fn get(&mut self, bits: u32) -> Result<u32, CodecError> {
        let mut value = 0u32;
        for _ in 0..bits {
            let byte = self
                .data
                .get(self.pos / 8)
                .ok_or_else(|| CodecError::Bitstream("truncated SBC frame".into()))?;
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        Ok(value)
    }
}

/// Per-frame scale factors and subband samples, sized for the widest
/// configuration (2 channels, 8 subbands, 16 blocks).
type ScaleFactors = [[u8; 8]; 2];
type Bits = [[u8; 8]; 2];

/// SBC encoder/decoder state.
pub struct SbcCodec {
    params: SbcParams,
    /// Analysis/synthesis cosine tables for 4 and 8 subbands.
    cos4: [[f32; 4]; 4],
    cos8: [[f32; 8]; 8],
}

impl SbcCodec {
    pub fn new(params: SbcParams) -> Self {
        let mut cos4 = [[0.0; 4]; 4];
        for (k, row) in cos4.iter_mut().enumerate() {
            for (i, v) in row.iter_mut().enumerate() {
                *v = (std::f64::consts::PI / 4.0 * (i as f64 + 0.5) * k as f64).cos() as f32;
            }
        }
        let mut cos8 = [[0.0; 8]; 8];
        for (k, row) in cos8.iter_mut().enumerate() {
            for (i, v) in row.iter_mut().enumerate() {
                *v = (std::f64::consts::PI / 8.0 * (i as f64 + 0.5) * k as f64).cos() as f32;
            }
        }
        SbcCodec { params, cos4, cos8 }
    }

    pub fn params(&self) -> &SbcParams {
        &self.params
    }

    fn analyze(&self, input: &[f32], out: &mut [f32]) {
        let nsub = input.len();
        let scale = 2.0 / nsub as f32;
        for k in 0..nsub {
            let mut acc = 0.0f32;
            for (i, x) in input.iter().enumerate() {
                let c = if nsub == 4 { self.cos4[k][i] } else { self.cos8[k][i] };
                acc += x * c;
            }
            out[k] = acc * scale;
        }
    }

    fn synthesize(&self, coef: &[f32], out: &mut [f32]) {
        let nsub = coef.len();
        for (i, x) in out.iter_mut().enumerate() {
            let mut acc = coef[0] * 0.5;
            for (k, c) in coef.iter().enumerate().skip(1) {
                let cos = if nsub == 4 { self.cos4[k][i] } else { self.cos8[k][i] };
                acc += c * cos;
            }
            *x = acc;
        }
    }

    fn bit_allocation(params: &SbcParams, sf: &ScaleFactors) -> Bits {
        let nsub = params.subbands as usize;
        match params.mode {
            ChannelMode::Mono | ChannelMode::DualChannel => {
                let mut bits = [[0u8; 8]; 2];
                for ch in 0..params.mode.channels() {
                    let mut need = [0i32; 8];
                    Self::bitneed(params, &sf[ch], &mut need[..nsub]);
                    Self::allocate(&need[..nsub], params.bitpool as i32, &mut bits, ch);
                }
                bits
            }
            ChannelMode::Stereo | ChannelMode::JointStereo => {
                let mut need0 = [0i32; 8];
                let mut need1 = [0i32; 8];
                Self::bitneed(params, &sf[0], &mut need0[..nsub]);
                Self::bitneed(params, &sf[1], &mut need1[..nsub]);
                let mut bits = [[0u8; 8]; 2];
                Self::allocate_joint(&need0[..nsub], &need1[..nsub], params.bitpool as i32, &mut bits);
                bits
            }
        }
    }

    fn bitneed(params: &SbcParams, sf: &[u8; 8], need: &mut [i32]) {
        let nsub = need.len();
        let freq = params.frequency.bits() as usize;
        for sb in 0..nsub {
            need[sb] = if params.allocation == Allocation::Snr {
                sf[sb] as i32
            } else if sf[sb] == 0 {
                -5
            } else {
                let offset = if nsub == 4 { OFFSET4[freq][sb] } else { OFFSET8[freq][sb] };
                let loudness = sf[sb] as i32 - offset;
                if loudness > 0 {
                    loudness / 2
                } else {
                    loudness
                }
            };
        }
    }

    /// Single-channel slice allocation for mono and dual-channel modes.
    fn allocate(need: &[i32], bitpool: i32, bits: &mut Bits, ch: usize) {
        let nsub = need.len();

        let max_need = need.iter().copied().max().unwrap_or(0);
        let mut bitcount = 0i32;
        let mut slicecount = 0i32;
        let mut bitslice = max_need + 1;
        loop {
            bitslice -= 1;
            bitcount += slicecount;
            slicecount = 0;
            for &n in need {
                if n > bitslice + 1 && n < bitslice + 16 {
                    slicecount += 1;
                } else if n == bitslice + 1 {
                    slicecount += 2;
                }
            }
            if bitcount + slicecount >= bitpool {
                break;
            }
        }
        if bitcount + slicecount == bitpool {
            bitcount += slicecount;
            bitslice -= 1;
        }

        for sb in 0..nsub {
            bits[ch][sb] = if need[sb] < bitslice + 2 {
                0
            } else {
                (need[sb] - bitslice).clamp(0, 16) as u8
            };
        }

        let mut sb = 0;
        while bitcount < bitpool && sb < nsub {
            let b = &mut bits[ch][sb];
            if *b >= 2 && *b < 16 {
                *b += 1;
                bitcount += 1;
            } else if need[sb] == bitslice + 1 && bitpool > bitcount + 1 {
                *b = 2;
                bitcount += 2;
            }
            sb += 1;
        }
        let mut sb = 0;
        while bitcount < bitpool && sb < nsub {
            if bits[ch][sb] < 16 {
                bits[ch][sb] += 1;
                bitcount += 1;
            }
            sb += 1;
        }
    }

    /// Combined two-channel allocation for stereo and joint-stereo modes.
    fn allocate_joint(need0: &[i32], need1: &[i32], bitpool: i32, bits: &mut Bits) {
        let nsub = need0.len();
        let need = |ch: usize, sb: usize| if ch == 0 { need0[sb] } else { need1[sb] };

        let max_need = need0.iter().chain(need1).copied().max().unwrap_or(0);
        let mut bitcount = 0i32;
        let mut slicecount = 0i32;
        let mut bitslice = max_need + 1;
        loop {
            bitslice -= 1;
            bitcount += slicecount;
            slicecount = 0;
            for sb in 0..nsub {
                for ch in 0..2 {
                    let n = need(ch, sb);
                    if n > bitslice + 1 && n < bitslice + 16 {
                        slicecount += 1;
                    } else if n == bitslice + 1 {
                        slicecount += 2;
                    }
                }
            }
            if bitcount + slicecount >= bitpool {
                break;
            }
        }
        if bitcount + slicecount == bitpool {
            bitcount += slicecount;
            bitslice -= 1;
        }

        for sb in 0..nsub {
            for ch in 0..2 {
                bits[ch][sb] = if need(ch, sb) < bitslice + 2 {
                    0
                } else {
                    (need(ch, sb) - bitslice).clamp(0, 16) as u8
                };
            }
        }

        'top_up: {
            for sb in 0..nsub {
                for ch in 0..2 {
                    if bitcount >= bitpool {
                        break 'top_up;
                    }
                    let b = &mut bits[ch][sb];
                    if *b >= 2 && *b < 16 {
                        *b += 1;
                        bitcount += 1;
                    } else if need(ch, sb) == bitslice + 1 && bitpool > bitcount + 1 {
                        *b = 2;
                        bitcount += 2;
                    }
                }
            }
            for sb in 0..nsub {
                for ch in 0..2 {
                    if bitcount >= bitpool {
                        break 'top_up;
                    }
                    if bits[ch][sb] < 16 {
                        bits[ch][sb] += 1;
                        bitcount += 1;
                    }
                }
            }
        }
    }

    fn scale_factor(max_abs: f32) -> u8 {
        let mut sf = 0u8;
        while sf < 15 && max_abs >= (1u32 << (sf + 1)) as f32 {
            sf += 1;
        }
        sf
    }

    /// Encode exactly one frame from `pcm` (interleaved, frame_samples
    /// long) and append the wire bytes to `out`.
    pub fn encode_frame(&mut self, pcm: &[i16], out: &mut Vec<u8>) -> Result<(), CodecError> {
        let p = self.params;
        let nch = p.mode.channels();
        let nsub = p.subbands as usize;
        let blocks = p.blocks as usize;
        if pcm.len() < p.frame_samples() {
            return Err(CodecError::Bitstream("short PCM input".into()));
        }

        // Subband analysis, [ch][block][sb].
        let mut sb_samples = vec![0f32; nch * blocks * nsub];
        let mut input = [0f32; 8];
        for blk in 0..blocks {
            for ch in 0..nch {
                for i in 0..nsub {
                    input[i] = pcm[(blk * nsub + i) * nch + ch] as f32;
                }
                let base = (ch * blocks + blk) * nsub;
                self.analyze(&input[..nsub], &mut sb_samples[base..base + nsub]);
            }
        }

        // Scale factors over all blocks.
        let mut sf: ScaleFactors = [[0; 8]; 2];
        for ch in 0..nch {
            for sb in 0..nsub {
                let mut max_abs = 0f32;
                for blk in 0..blocks {
                    max_abs = max_abs.max(sb_samples[(ch * blocks + blk) * nsub + sb].abs());
                }
                sf[ch][sb] = Self::scale_factor(max_abs);
            }
        }

        // Header. The encoder never elects per-subband joint coding, so
        // the join bits are all zero in joint-stereo mode.
        let mut head = Vec::with_capacity(4);
        if p.msbc {
            head.push(SYNCWORD_MSBC);
            head.push(0x00);
            head.push(0x00);
        } else {
            head.push(SYNCWORD);
            head.push(p.header_byte());
            head.push(p.bitpool);
        }

        let mut crc = 0x0fu8;
        crc = crc_byte(crc, head[1]);
        crc = crc_byte(crc, head[2]);

        let mut body = BitWriter::new();
        if p.mode == ChannelMode::JointStereo {
            for _ in 0..nsub {
                body.put(0, 1);
            }
            for _ in 0..nsub {
                crc = crc_bit(crc, 0);
            }
        }
        for ch in 0..nch {
            for sb in 0..nsub {
                body.put(sf[ch][sb] as u32, 4);
                for i in (0..4).rev() {
                    crc = crc_bit(crc, (sf[ch][sb] >> i) & 1);
                }
            }
        }
        head.push(crc);

        // Quantize.
        let bits = Self::bit_allocation(&p, &sf);
        for blk in 0..blocks {
            for ch in 0..nch {
                for sb in 0..nsub {
                    let nbits = bits[ch][sb] as u32;
                    if nbits == 0 {
                        continue;
                    }
                    let levels = ((1u32 << nbits) - 1) as f32;
                    let full = (1u32 << (sf[ch][sb] + 1)) as f32;
                    let s = sb_samples[(ch * blocks + blk) * nsub + sb].clamp(-full, full - 1.0);
                    let q = (((s / full + 1.0) * levels) / 2.0).floor();
                    body.put(q.clamp(0.0, levels) as u32, nbits);
                }
            }
        }

        let mut frame = head;
        frame.extend_from_slice(&body.finish());
        frame.resize(p.frame_len(), 0);
        out.extend_from_slice(&frame);
        Ok(())
    }

    /// Decode one frame from the head of `data`, appending interleaved
    /// PCM to `pcm`. Returns the number of wire bytes consumed.
    pub fn decode_frame(&mut self, data: &[u8], pcm: &mut Vec<i16>) -> Result<usize, CodecError> {
        let p = SbcParams::from_header(data)?;
        if p.msbc != self.params.msbc {
            return Err(CodecError::Bitstream("frame type mismatch".into()));
        }
        if p.bitpool > MAX_BITPOOL {
            return Err(CodecError::Bitstream(format!("bitpool {} out of range", p.bitpool)));
        }
        let frame_len = p.frame_len();
        if data.len() < frame_len {
            return Err(CodecError::Bitstream("truncated SBC frame".into()));
        }

        let nch = p.mode.channels();
        let nsub = p.subbands as usize;
        let blocks = p.blocks as usize;

        let mut crc = 0x0fu8;
        crc = crc_byte(crc, data[1]);
        crc = crc_byte(crc, data[2]);

        let mut reader = BitReader::new(&data[4..frame_len]);
        let mut join = [false; 8];
        if p.mode == ChannelMode::JointStereo {
            for j in join.iter_mut().take(nsub) {
                let bit = reader.get(1)?;
                *j = bit != 0;
                crc = crc_bit(crc, bit as u8);
            }
        }

        let mut sf: ScaleFactors = [[0; 8]; 2];
        for ch in 0..nch {
            for sb in 0..nsub {
                let v = reader.get(4)? as u8;
                sf[ch][sb] = v;
                for i in (0..4).rev() {
                    crc = crc_bit(crc, (v >> i) & 1);
                }
            }
        }
        if crc != data[3] {
            return Err(CodecError::Bitstream("CRC mismatch".into()));
        }

        let bits = Self::bit_allocation(&p, &sf);
        let mut sb_samples = vec![0f32; nch * blocks * nsub];
        for blk in 0..blocks {
            for ch in 0..nch {
                for sb in 0..nsub {
                    let nbits = bits[ch][sb] as u32;
                    if nbits == 0 {
                        continue;
                    }
                    let levels = ((1u32 << nbits) - 1) as f32;
                    let full = (1u32 << (sf[ch][sb] + 1)) as f32;
                    let q = reader.get(nbits)? as f32;
                    sb_samples[(ch * blocks + blk) * nsub + sb] = full * ((2.0 * q + 1.0) / levels - 1.0);
                }
            }
        }

        // Undo per-subband joint coding.
        if p.mode == ChannelMode::JointStereo {
            for blk in 0..blocks {
                for sb in 0..nsub {
                    if !join[sb] {
                        continue;
                    }
                    let mid = sb_samples[blk * nsub + sb];
                    let side = sb_samples[(blocks + blk) * nsub + sb];
                    sb_samples[blk * nsub + sb] = mid + side;
                    sb_samples[(blocks + blk) * nsub + sb] = mid - side;
                }
            }
        }

        // Subband synthesis.
        let mut block_out = [0f32; 8];
        let offset = pcm.len();
        pcm.resize(offset + blocks * nsub * nch, 0);
        for blk in 0..blocks {
            for ch in 0..nch {
                let base = (ch * blocks + blk) * nsub;
                self.synthesize(&sb_samples[base..base + nsub], &mut block_out[..nsub]);
                for i in 0..nsub {
                    pcm[offset + (blk * nsub + i) * nch + ch] =
                        block_out[i].round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                }
            }
        }

        Ok(frame_len)
    }
}

impl Codec for SbcCodec {
    fn codec(&self) -> TransportCodec {
        TransportCodec::A2dp(A2dpCodec::Sbc)
    }

    fn encode(&mut self, pcm: &mut Ffb<i16>, wire: &mut Ffb<u8>) -> Result<usize, CodecError> {
        let samples = self.params.frame_samples();
        let frame_len = self.params.frame_len();
        let mut frames = 0;
        let mut out = Vec::with_capacity(frame_len);
        while pcm.len_out() >= samples && wire.len_in() >= frame_len {
            out.clear();
            let frame: Vec<i16> = pcm.data()[..samples].to_vec();
            self.encode_frame(&frame, &mut out)?;
            wire.append(&out);
            pcm.shift(samples);
            frames += 1;
        }
        Ok(frames)
    }

    fn decode(&mut self, wire: &mut Ffb<u8>, pcm: &mut Ffb<i16>) -> Result<usize, CodecError> {
        let mut frames = 0;
        loop {
            // Resynchronize on the frame syncword.
            let sync = if self.params.msbc { SYNCWORD_MSBC } else { SYNCWORD };
            let skip = wire.data().iter().take_while(|&&b| b != sync).count();
            if skip > 0 {
                tracing::debug!("Skipping {skip} bytes to SBC syncword");
                wire.shift(skip);
            }
            if wire.len_out() < 4 {
                return Ok(frames);
            }
            let header = SbcParams::from_header(wire.data())?;
            let frame_len = header.frame_len();
            if wire.len_out() < frame_len || pcm.len_in() < header.frame_samples() {
                return Ok(frames);
            }
            let mut out = Vec::with_capacity(header.frame_samples());
            match self.decode_frame(wire.data(), &mut out) {
                Ok(consumed) => {
                    pcm.append(&out);
                    wire.shift(consumed);
                    frames += 1;
                }
                Err(err) => {
                    // Bad frame: drop the syncword and rescan.
                    tracing::warn!("SBC decode error: {err}");
                    wire.shift(1);
                }
            }
        }
    }

    fn reset(&mut self) {}

    fn frame_pcm_samples(&self) -> usize {
        self.params.frame_samples()
    }

    fn frame_wire_bytes(&self) -> usize {
        self.params.frame_len()
    }
}

/// A2DP SBC capability element (4 bytes).
pub mod caps {
    use super::*;

    pub const FREQ_16000: u8 = 1 << 7;
    pub const FREQ_32000: u8 = 1 << 6;
    pub const FREQ_44100: u8 = 1 << 5;
    pub const FREQ_48000: u8 = 1 << 4;
    pub const MODE_MONO: u8 = 1 << 3;
    pub const MODE_DUAL: u8 = 1 << 2;
    pub const MODE_STEREO: u8 = 1 << 1;
    pub const MODE_JOINT: u8 = 1 << 0;
    pub const BLOCKS_4: u8 = 1 << 7;
    pub const BLOCKS_8: u8 = 1 << 6;
    pub const BLOCKS_12: u8 = 1 << 5;
    pub const BLOCKS_16: u8 = 1 << 4;
    pub const SUBBANDS_4: u8 = 1 << 3;
    pub const SUBBANDS_8: u8 = 1 << 2;
    pub const ALLOCATION_SNR: u8 = 1 << 1;
    pub const ALLOCATION_LOUDNESS: u8 = 1 << 0;

    /// Recommended maximum bitpool for high-quality joint stereo.
    pub const BITPOOL_HQ: u8 = 53;

    /// Parse a configured (single-choice) SBC element.
    pub fn parse_config(blob: &[u8]) -> Result<SbcParams, CodecError> {
        if blob.len() != 4 {
            return Err(CodecError::InvalidConfiguration(format!(
                "SBC configuration must be 4 bytes, got {}",
                blob.len()
            )));
        }
        let frequency = match blob[0] & 0xf0 {
            x if x == FREQ_16000 => Frequency::Hz16000,
            x if x == FREQ_32000 => Frequency::Hz32000,
            x if x == FREQ_44100 => Frequency::Hz44100,
            x if x == FREQ_48000 => Frequency::Hz48000,
            _ => return Err(CodecError::InvalidConfiguration("ambiguous frequency".into())),
        };
        let mode = match blob[0] & 0x0f {
            x if x == MODE_MONO => ChannelMode::Mono,
            x if x == MODE_DUAL => ChannelMode::DualChannel,
            x if x == MODE_STEREO => ChannelMode::Stereo,
            x if x == MODE_JOINT => ChannelMode::JointStereo,
            _ => return Err(CodecError::InvalidConfiguration("ambiguous channel mode".into())),
        };
        let blocks = match blob[1] & 0xf0 {
            x if x == BLOCKS_4 => 4,
            x if x == BLOCKS_8 => 8,
            x if x == BLOCKS_12 => 12,
            x if x == BLOCKS_16 => 16,
            _ => return Err(CodecError::InvalidConfiguration("ambiguous block count".into())),
        };
        let subbands = match blob[1] & 0x0c {
            x if x == SUBBANDS_4 => 4,
            x if x == SUBBANDS_8 => 8,
            _ => return Err(CodecError::InvalidConfiguration("ambiguous subbands".into())),
        };
        let allocation = match blob[1] & 0x03 {
            x if x == ALLOCATION_SNR => Allocation::Snr,
            x if x == ALLOCATION_LOUDNESS => Allocation::Loudness,
            _ => return Err(CodecError::InvalidConfiguration("ambiguous allocation".into())),
        };
        let bitpool = blob[3];
        if bitpool < 2 || bitpool > MAX_BITPOOL || blob[2] > bitpool {
            return Err(CodecError::InvalidConfiguration(format!("bad bitpool range {}..{}", blob[2], blob[3])));
        }
        let params = SbcParams { frequency, blocks, subbands, mode, allocation, bitpool, msbc: false };
        if bitpool > params.max_bitpool() {
            return Err(CodecError::InvalidConfiguration(format!("bitpool {bitpool} too large for mode")));
        }
        Ok(params)
    }

    /// Select our preferred configuration from a peer capability element.
    pub fn select_config(blob: &[u8]) -> Result<[u8; 4], CodecError> {
        if blob.len() != 4 {
            return Err(CodecError::InvalidConfiguration(format!(
                "SBC capabilities must be 4 bytes, got {}",
                blob.len()
            )));
        }
        let frequency = [FREQ_44100, FREQ_48000, FREQ_32000, FREQ_16000]
            .into_iter()
            .find(|f| blob[0] & f != 0)
            .ok_or_else(|| CodecError::InvalidConfiguration("no common frequency".into()))?;
        let mode = [MODE_JOINT, MODE_STEREO, MODE_DUAL, MODE_MONO]
            .into_iter()
            .find(|m| blob[0] & m != 0)
            .ok_or_else(|| CodecError::InvalidConfiguration("no common channel mode".into()))?;
        let blocks = [BLOCKS_16, BLOCKS_12, BLOCKS_8, BLOCKS_4]
            .into_iter()
            .find(|b| blob[1] & b != 0)
            .ok_or_else(|| CodecError::InvalidConfiguration("no common block count".into()))?;
        let subbands = [SUBBANDS_8, SUBBANDS_4]
            .into_iter()
            .find(|s| blob[1] & s != 0)
            .ok_or_else(|| CodecError::InvalidConfiguration("no common subbands".into()))?;
        let allocation = [ALLOCATION_LOUDNESS, ALLOCATION_SNR]
            .into_iter()
            .find(|a| blob[1] & a != 0)
            .ok_or_else(|| CodecError::InvalidConfiguration("no common allocation".into()))?;
        let min_bitpool = blob[2].max(2);
        let max_bitpool = blob[3].min(MAX_BITPOOL).min(BITPOOL_HQ).max(min_bitpool);
        Ok([frequency | mode, blocks | subbands | allocation, min_bitpool, max_bitpool])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(samples: usize, channels: usize, period: usize, amplitude: f32) -> Vec<i16> {
        (0..samples)
            .flat_map(|i| {
                let v = (amplitude
                    * (2.0 * std::f32::consts::PI * i as f32 / period as f32).sin())
                    as i16;
                std::iter::repeat(v).take(channels)
            })
            .collect()
    }

    fn snr_db(original: &[i16], decoded: &[i16]) -> f64 {
        assert_eq!(original.len(), decoded.len());
        let mut signal = 0f64;
        let mut noise = 0f64;
        for (a, b) in original.iter().zip(decoded) {
            signal += (*a as f64).powi(2);
            noise += (*a as f64 - *b as f64).powi(2);
        }
        10.0 * (signal / noise.max(1e-9)).log10()
    }

    mod framing {
        use super::*;

        #[test]
        fn msbc_frame_geometry() {
            let p = SbcParams::msbc();
            assert_eq!(p.frame_len(), 57);
            assert_eq!(p.codesize(), 240);
            assert_eq!(p.frame_samples(), 120);
        }

        #[test]
        fn stereo_hq_frame_geometry() {
            // 16 blocks, 8 subbands, joint stereo, bitpool 53: the common
            // high-quality 44.1 kHz configuration.
            let p = SbcParams {
                frequency: Frequency::Hz44100,
                blocks: 16,
                subbands: 8,
                mode: ChannelMode::JointStereo,
                allocation: Allocation::Loudness,
                bitpool: 53,
                msbc: false,
            };
            assert_eq!(p.frame_len(), 119);
            assert_eq!(p.codesize(), 512);
        }

        #[test]
        fn header_roundtrip() {
            let p = SbcParams {
                frequency: Frequency::Hz48000,
                blocks: 12,
                subbands: 4,
                mode: ChannelMode::DualChannel,
                allocation: Allocation::Snr,
                bitpool: 32,
                msbc: false,
            };
            let header = [SYNCWORD, p.header_byte(), p.bitpool];
            let parsed = SbcParams::from_header(&header).unwrap();
            assert_eq!(parsed, p);
        }

        #[test]
        fn bad_syncword_rejected() {
            assert!(SbcParams::from_header(&[0x42, 0, 0]).is_err());
        }

        #[test]
        fn encoded_frame_has_declared_length() {
            let p = SbcParams::msbc();
            let mut codec = SbcCodec::new(p);
            let pcm = sine(120, 1, 32, 8000.0);
            let mut out = Vec::new();
            codec.encode_frame(&pcm, &mut out).unwrap();
            assert_eq!(out.len(), 57);
            assert_eq!(out[0], SYNCWORD_MSBC);
        }
    }

    mod roundtrip {
        use super::*;

        fn roundtrip(params: SbcParams, channels: usize) {
            let mut codec = SbcCodec::new(params);
            let frames = 8;
            let samples = params.frame_samples() * frames;
            let input = sine(samples / channels, channels, 64, 16000.0);

            let mut wire = Vec::new();
            for frame in input.chunks_exact(params.frame_samples()) {
                codec.encode_frame(frame, &mut wire).unwrap();
            }
            assert_eq!(wire.len(), params.frame_len() * frames);

            let mut decoded = Vec::new();
            let mut offset = 0;
            while offset < wire.len() {
                offset += codec.decode_frame(&wire[offset..], &mut decoded).unwrap();
            }
            assert_eq!(decoded.len(), input.len());

            let snr = snr_db(&input, &decoded);
            assert!(snr > 15.0, "SNR {snr:.1} dB too low for {params:?}");
        }

        #[test]
        fn msbc_sine() {
            roundtrip(SbcParams::msbc(), 1);
        }

        #[test]
        fn joint_stereo_sine() {
            roundtrip(
                SbcParams {
                    frequency: Frequency::Hz44100,
                    blocks: 16,
                    subbands: 8,
                    mode: ChannelMode::JointStereo,
                    allocation: Allocation::Loudness,
                    bitpool: 53,
                    msbc: false,
                },
                2,
            );
        }

        #[test]
        fn mono_snr_allocation() {
            roundtrip(
                SbcParams {
                    frequency: Frequency::Hz32000,
                    blocks: 8,
                    subbands: 4,
                    mode: ChannelMode::Mono,
                    allocation: Allocation::Snr,
                    bitpool: 24,
                    msbc: false,
                },
                1,
            );
        }

        #[test]
        fn silence_is_near_silent() {
            let params = SbcParams::msbc();
            let mut codec = SbcCodec::new(params);
            let input = vec![0i16; 120];
            let mut wire = Vec::new();
            codec.encode_frame(&input, &mut wire).unwrap();
            let mut decoded = Vec::new();
            codec.decode_frame(&wire, &mut decoded).unwrap();
            assert!(decoded.iter().all(|s| s.abs() < 8), "noise in silence: {:?}", &decoded[..8]);
        }

        #[test]
        fn corrupted_payload_fails_crc() {
            let params = SbcParams::msbc();
            let mut codec = SbcCodec::new(params);
            let mut wire = Vec::new();
            codec.encode_frame(&sine(120, 1, 32, 8000.0), &mut wire).unwrap();
            // Flip a scale-factor bit; the CRC must catch it.
            wire[4] ^= 0x10;
            let mut decoded = Vec::new();
            assert!(codec.decode_frame(&wire, &mut decoded).is_err());
        }
    }

    mod streaming {
        use super::*;

        #[test]
        fn codec_contract_needs_whole_frames() {
            let mut codec = SbcCodec::new(SbcParams::msbc());
            let mut pcm: Ffb<i16> = Ffb::new(512);
            let mut wire: Ffb<u8> = Ffb::new(512);
            pcm.append(&vec![100i16; 100]);
            assert_eq!(codec.encode(&mut pcm, &mut wire).unwrap(), 0);
            pcm.append(&vec![100i16; 20]);
            assert_eq!(codec.encode(&mut pcm, &mut wire).unwrap(), 1);
            assert_eq!(wire.len_out(), 57);
        }

        #[test]
        fn decode_resynchronizes_after_garbage() {
            let mut codec = SbcCodec::new(SbcParams::msbc());
            let mut frame = Vec::new();
            codec.encode_frame(&sine(120, 1, 48, 12000.0), &mut frame).unwrap();

            let mut wire: Ffb<u8> = Ffb::new(512);
            wire.append(&[0x00, 0x42, 0x17]);
            wire.append(&frame);
            let mut pcm: Ffb<i16> = Ffb::new(512);
            assert_eq!(codec.decode(&mut wire, &mut pcm).unwrap(), 1);
            assert_eq!(pcm.len_out(), 120);
        }
    }

    mod capabilities {
        use super::*;

        #[test]
        fn select_prefers_hq_joint_stereo() {
            let peer = [
                caps::FREQ_44100 | caps::FREQ_48000 | caps::MODE_JOINT | caps::MODE_STEREO | caps::MODE_MONO,
                caps::BLOCKS_16 | caps::BLOCKS_8 | caps::SUBBANDS_8 | caps::SUBBANDS_4
                    | caps::ALLOCATION_LOUDNESS,
                2,
                64,
            ];
            let config = caps::select_config(&peer).unwrap();
            let params = caps::parse_config(&config).unwrap();
            assert_eq!(params.frequency, Frequency::Hz44100);
            assert_eq!(params.mode, ChannelMode::JointStereo);
            assert_eq!(params.blocks, 16);
            assert_eq!(params.subbands, 8);
            assert_eq!(params.bitpool, caps::BITPOOL_HQ);
        }

        #[test]
        fn parse_rejects_ambiguous_config() {
            let blob = [caps::FREQ_44100 | caps::FREQ_48000 | caps::MODE_JOINT, caps::BLOCKS_16 | caps::SUBBANDS_8 | caps::ALLOCATION_LOUDNESS, 2, 53];
            assert!(caps::parse_config(&blob).is_err());
        }

        #[test]
        fn parse_rejects_bad_length() {
            assert!(caps::parse_config(&[0u8; 3]).is_err());
            assert!(caps::select_config(&[0u8; 6]).is_err());
        }

        #[test]
        fn no_common_frequency_is_an_error() {
            let blob = [caps::MODE_JOINT, caps::BLOCKS_16 | caps::SUBBANDS_8 | caps::ALLOCATION_LOUDNESS, 2, 53];
            assert!(caps::select_config(&blob).is_err());
        }
    }
}
