//! PCM conversion between device float samples and the session wire format.
//!
//! Wire format: mono, signed 16-bit little-endian, carried as base64 text.
//! Downsampling is nearest-neighbour decimation without an anti-aliasing filter.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Rate the agent expects for microphone audio.
pub const AGENT_INPUT_RATE: u32 = 16000;
/// Rate of the agent's spoken replies.
pub const AGENT_OUTPUT_RATE: u32 = 24000;

/// Decimate `block` from `input_rate` to `output_rate` by nearest-neighbour selection.
///
/// Returns the block unchanged when no downsampling is needed.
pub fn downsample_nearest(block: &[f32], input_rate: u32, output_rate: u32) -> Vec<f32> {
    if output_rate >= input_rate || block.is_empty() {
        return block.to_vec();
    }
    let ratio = input_rate as f64 / output_rate as f64;
    let out_len = (block.len() as f64 / ratio).round() as usize;
    let last = block.len() - 1;
    (0..out_len)
        .map(|i| block[((i as f64 * ratio).floor() as usize).min(last)])
        .collect()
}

/// Clamp to [-1, 1] and scale asymmetrically onto the i16 range.
#[inline]
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Inverse of [`f32_to_pcm16`].
#[inline]
pub fn pcm16_to_f32(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

/// Pack float samples as 16-bit little-endian PCM bytes.
pub fn encode_pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&f32_to_pcm16(s).to_le_bytes());
    }
    bytes
}

/// Unpack 16-bit little-endian PCM bytes. A trailing odd byte is ignored.
pub fn decode_pcm16_le(bytes: &[u8]) -> Vec<f32> {
    if bytes.len() % 2 != 0 {
        log::warn!("PCM chunk has odd length {}, dropping last byte", bytes.len());
    }
    bytes
        .chunks_exact(2)
        .map(|pair| pcm16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

/// Transport-safe text form of PCM bytes.
pub fn to_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Microphone loudness for visualisation: RMS scaled by 400, clamped to 0..=100.
pub fn input_level(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let sum: f32 = block.iter().map(|s| s * s).sum();
    let rms = (sum / block.len() as f32).sqrt();
    (rms * 400.0).min(100.0)
}

/// Coarse loudness of a decoded reply chunk: mean |x| of every 10th sample, scaled by 500.
pub fn output_level(samples: &[f32]) -> f32 {
    let picked: Vec<f32> = samples.iter().step_by(10).map(|s| s.abs()).collect();
    if picked.is_empty() {
        return 0.0;
    }
    let mean = picked.iter().sum::<f32>() / picked.len() as f32;
    (mean * 500.0).min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn identity_at_agent_rate() {
        let block = vec![0.1, -0.2, 0.3, 0.4];
        assert_eq!(downsample_nearest(&block, 16000, 16000), block);
    }

    #[test]
    fn decimates_48k_by_three() {
        let block: Vec<f32> = (0..9).map(|i| i as f32).collect();
        assert_eq!(downsample_nearest(&block, 48000, 16000), vec![0.0, 3.0, 6.0]);
    }

    #[test]
    fn scaling_is_asymmetric_and_clamped() {
        assert_eq!(f32_to_pcm16(1.0), 32767);
        assert_eq!(f32_to_pcm16(-1.0), -32768);
        assert_eq!(f32_to_pcm16(3.5), 32767);
        assert_eq!(f32_to_pcm16(-7.0), -32768);
        assert_eq!(f32_to_pcm16(0.0), 0);
    }

    #[test]
    fn pcm_bytes_are_little_endian() {
        assert_eq!(encode_pcm16_le(&[1.0, -1.0]), vec![0xff, 0x7f, 0x00, 0x80]);
        assert_eq!(decode_pcm16_le(&[0xff, 0x7f, 0x00, 0x80, 0x01]), vec![1.0, -1.0]);
    }

    #[test]
    fn levels_are_bounded() {
        assert_eq!(input_level(&[]), 0.0);
        assert_eq!(input_level(&[1.0; 64]), 100.0);
        assert!((input_level(&[0.1; 64]) - 40.0).abs() < 1e-3);
        assert_eq!(output_level(&[]), 0.0);
        assert_eq!(output_level(&[-1.0; 30]), 100.0);
    }

    proptest! {
        #[test]
        fn downsampled_length_matches_ratio(len in 1usize..4096, rate in prop::sample::select(vec![22050u32, 32000, 44100, 48000, 96000])) {
            let block = vec![0.25f32; len];
            let out = downsample_nearest(&block, rate, AGENT_INPUT_RATE);
            let expected = (len as f64 / (rate as f64 / AGENT_INPUT_RATE as f64)).round() as usize;
            prop_assert_eq!(out.len(), expected);
        }

        #[test]
        fn quantisation_round_trip(s in -1.0f32..=1.0f32) {
            let back = pcm16_to_f32(f32_to_pcm16(s));
            prop_assert!((back - s).abs() <= 1.0 / 32767.0 + 1e-6);
        }
    }
}
