//! Microphone block → wire frame conversion.

use super::codec::{downsample_nearest, encode_pcm16_le, input_level, to_base64};

/// One microphone block in wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    /// base64 of 16-bit LE mono PCM at the target rate
    pub data: String,
    /// Number of samples after resampling
    pub samples: usize,
    /// Pre-resample loudness 0..=100, when metering is enabled
    pub level: Option<f32>,
}

/// Resample → clamp → quantise → pack → base64, one block at a time.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    device_rate: u32,
    target_rate: u32,
    meter: bool,
}

impl FrameEncoder {
    pub fn new(device_rate: u32, target_rate: u32) -> Self {
        if device_rate < target_rate {
            log::warn!(
                "Capture rate {}Hz is below {}Hz, sending unresampled audio",
                device_rate,
                target_rate
            );
        }
        Self {
            device_rate,
            target_rate,
            meter: false,
        }
    }

    pub fn with_level_meter(mut self, enabled: bool) -> Self {
        self.meter = enabled;
        self
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    pub fn encode(&self, block: &[f32]) -> EncodedFrame {
        let level = self.meter.then(|| input_level(block));
        let resampled = if self.device_rate == self.target_rate {
            block.to_vec()
        } else {
            downsample_nearest(block, self.device_rate, self.target_rate)
        };
        let bytes = encode_pcm16_le(&resampled);
        EncodedFrame {
            data: to_base64(&bytes),
            samples: resampled.len(),
            level,
        }
    }
}
