//! Sample-format conversion and soft-volume scaling.
//!
//! The transport pipeline is S16_2LE throughout; clients may ask for a
//! different physical layout, converted at the PCM boundary.

use bluealsa_core::format::PcmFormat;
use bluealsa_core::volume::Volume;
use bluealsa_core::{Error, Result};

/// Reinterpret little-endian sample bytes as i16 samples.
pub fn bytes_to_s16(bytes: &[u8], out: &mut Vec<i16>) {
    out.clear();
    for pair in bytes.chunks_exact(2) {
        out.push(i16::from_le_bytes([pair[0], pair[1]]));
    }
}

/// Serialize i16 samples as little-endian bytes.
pub fn s16_to_bytes(samples: &[i16], out: &mut Vec<u8>) {
    out.clear();
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
}

/// Convert S16 samples into the client's physical sample layout.
pub fn s16_to_client(samples: &[i16], format: PcmFormat, out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    match format {
        PcmFormat::S16_2LE => {
            for s in samples {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
        PcmFormat::U8 => {
            for s in samples {
                out.push(((*s >> 8) as i8 as u8).wrapping_add(0x80));
            }
        }
        PcmFormat::S24_4LE => {
            for s in samples {
                out.extend_from_slice(&((*s as i32) << 8).to_le_bytes());
            }
        }
        PcmFormat::S32_4LE => {
            for s in samples {
                out.extend_from_slice(&((*s as i32) << 16).to_le_bytes());
            }
        }
        other => return Err(Error::NotSupported(format!("PCM format {:#06x}", other.0))),
    }
    Ok(())
}

/// Convert bytes in the client's physical sample layout into S16 samples.
pub fn client_to_s16(bytes: &[u8], format: PcmFormat, out: &mut Vec<i16>) -> Result<()> {
    out.clear();
    match format {
        PcmFormat::S16_2LE => {
            for pair in bytes.chunks_exact(2) {
                out.push(i16::from_le_bytes([pair[0], pair[1]]));
            }
        }
        PcmFormat::U8 => {
            for b in bytes {
                out.push(((b.wrapping_sub(0x80)) as i8 as i16) << 8);
            }
        }
        PcmFormat::S24_4LE => {
            for quad in bytes.chunks_exact(4) {
                let v = i32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
                out.push((v >> 8) as i16);
            }
        }
        PcmFormat::S32_4LE => {
            for quad in bytes.chunks_exact(4) {
                let v = i32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
                out.push((v >> 16) as i16);
            }
        }
        other => return Err(Error::NotSupported(format!("PCM format {:#06x}", other.0))),
    }
    Ok(())
}

/// Amplitude scale for a Bluetooth volume level.
///
/// Perceived loudness follows a cube law of amplitude, so the scale is
/// the cube root of the loudness fraction the level selects; level
/// 64/127 lands at about -6 dB.
pub fn level_to_scale(level: u8, max: u8) -> f32 {
    if max == 0 {
        return 0.0;
    }
    let loudness = (level.min(max) as f32 / max as f32).powi(3);
    loudness.cbrt()
}

/// Per-channel volume scaler with a short mute ramp to keep transitions
/// click-free.
pub struct SoftVolume {
    channels: usize,
    max_level: u8,
    gain: [f32; 2],
    target: [f32; 2],
}

/// Gain step per sample while ramping; about 3 ms from full scale to
/// silence at 44.1 kHz.
const RAMP_STEP: f32 = 1.0 / 128.0;

impl SoftVolume {
    pub fn new(channels: usize, max_level: u8) -> Self {
        SoftVolume { channels: channels.clamp(1, 2), max_level, gain: [1.0; 2], target: [1.0; 2] }
    }

    /// Update the target gains from the packed volume word.
    pub fn set_volume(&mut self, volume: Volume) {
        for ch in 0..self.channels {
            self.target[ch] = if volume.muted(ch) {
                0.0
            } else {
                level_to_scale(volume.level(ch), self.max_level)
            };
        }
        if self.channels == 1 {
            self.target[1] = self.target[0];
        }
    }

    /// Scale interleaved samples in place.
    pub fn apply(&mut self, samples: &mut [i16]) {
        for frame in samples.chunks_exact_mut(self.channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let gain = &mut self.gain[ch];
                let target = self.target[ch];
                if (*gain - target).abs() > RAMP_STEP {
                    *gain += if target > *gain { RAMP_STEP } else { -RAMP_STEP };
                } else {
                    *gain = target;
                }
                if *gain < 1.0 {
                    *sample = (*sample as f32 * *gain) as i16;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod formats {
        use super::*;

        #[test]
        fn s16_roundtrip() {
            let samples = [i16::MIN, -1, 0, 1, i16::MAX];
            let mut bytes = Vec::new();
            s16_to_client(&samples, PcmFormat::S16_2LE, &mut bytes).unwrap();
            let mut back = Vec::new();
            client_to_s16(&bytes, PcmFormat::S16_2LE, &mut back).unwrap();
            assert_eq!(back, samples);
        }

        #[test]
        fn s32_roundtrip_is_exact() {
            let samples = [i16::MIN, -12345, 0, 12345, i16::MAX];
            let mut bytes = Vec::new();
            s16_to_client(&samples, PcmFormat::S32_4LE, &mut bytes).unwrap();
            assert_eq!(bytes.len(), samples.len() * 4);
            let mut back = Vec::new();
            client_to_s16(&bytes, PcmFormat::S32_4LE, &mut back).unwrap();
            assert_eq!(back, samples);
        }

        #[test]
        fn s24_roundtrip_is_exact() {
            let samples = [-2048, 0, 2047, i16::MAX];
            let mut bytes = Vec::new();
            s16_to_client(&samples, PcmFormat::S24_4LE, &mut bytes).unwrap();
            let mut back = Vec::new();
            client_to_s16(&bytes, PcmFormat::S24_4LE, &mut back).unwrap();
            assert_eq!(back, samples);
        }

        #[test]
        fn u8_loses_only_low_bits() {
            let samples = [-32768, -256, 0, 256, 32512];
            let mut bytes = Vec::new();
            s16_to_client(&samples, PcmFormat::U8, &mut bytes).unwrap();
            let mut back = Vec::new();
            client_to_s16(&bytes, PcmFormat::U8, &mut back).unwrap();
            for (a, b) in samples.iter().zip(&back) {
                assert!((a - b).abs() < 256, "{a} vs {b}");
            }
        }

        #[test]
        fn unsupported_format_rejected() {
            let mut bytes = Vec::new();
            assert!(s16_to_client(&[0], PcmFormat::U16_2BE, &mut bytes).is_err());
        }
    }

    mod volume {
        use super::*;

        #[test]
        fn full_level_is_unity() {
            assert!((level_to_scale(127, 127) - 1.0).abs() < 1e-6);
            assert!((level_to_scale(15, 15) - 1.0).abs() < 1e-6);
        }

        #[test]
        fn level_zero_is_silence() {
            assert_eq!(level_to_scale(0, 127), 0.0);
        }

        #[test]
        fn midpoint_is_about_minus_6_db() {
            let db = 20.0 * level_to_scale(64, 127).log10();
            assert!((-7.0..=-5.0).contains(&db), "got {db} dB");
        }

        #[test]
        fn mute_ramps_to_silence() {
            let mut sv = SoftVolume::new(2, 127);
            sv.set_volume(Volume::from_level(127).with_muted(0, true).with_muted(1, true));
            let mut samples = vec![i16::MAX; 2048];
            sv.apply(&mut samples);
            // Early samples are ramping, the tail must be silent.
            assert_ne!(samples[0], 0);
            assert_eq!(samples[2046], 0);
            assert_eq!(samples[2047], 0);
        }

        #[test]
        fn unity_gain_leaves_samples_untouched() {
            let mut sv = SoftVolume::new(2, 127);
            sv.set_volume(Volume::from_level(127));
            let mut samples = vec![1234i16, -1234, 999, -999];
            sv.apply(&mut samples);
            assert_eq!(samples, vec![1234, -1234, 999, -999]);
        }

        #[test]
        fn per_channel_gains_differ() {
            let mut sv = SoftVolume::new(2, 127);
            sv.set_volume(Volume::from_level(127).with_level(1, 0));
            let mut samples: Vec<i16> = std::iter::repeat([1000i16, 1000]).take(1024).flatten().collect();
            sv.apply(&mut samples);
            let tail = &samples[samples.len() - 2..];
            assert_eq!(tail[0], 1000);
            assert_eq!(tail[1], 0);
        }
    }
}
