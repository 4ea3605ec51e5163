//! The AudioSystem that owns the microphone and speaker for one session.
//!
//! Device I/O stays on std threads inside the [`AudioIo`] backend; this type only
//! holds the stream handles, so stopping is a matter of dropping them.

use super::audio_io::{AudioIo, CaptureStream};
use super::capture::{EncodedFrame, FrameEncoder};
use super::playback::{PlaybackScheduler, ScheduledChunk};
use crate::error::Result;

/// Audio system configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Rate requested from the microphone (the device may settle elsewhere)
    pub capture_sample_rate: u32,
    /// Rate the agent expects for microphone audio
    pub input_sample_rate: u32,
    /// Rate of the agent's reply audio; the renderer runs at this rate
    pub output_sample_rate: u32,
    /// Compute input levels for the UI
    pub meter_input: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 48000,
            input_sample_rate: super::codec::AGENT_INPUT_RATE,
            output_sample_rate: super::codec::AGENT_OUTPUT_RATE,
            meter_input: true,
        }
    }
}

pub struct AudioSystem {
    config: AudioConfig,
    io: Box<dyn AudioIo>,
    capture: Option<(CaptureStream, FrameEncoder)>,
    playback: Option<PlaybackScheduler>,
}

impl AudioSystem {
    pub fn new(config: AudioConfig, io: Box<dyn AudioIo>) -> Self {
        Self {
            config,
            io,
            capture: None,
            playback: None,
        }
    }

    /// Open the speaker at the agent's output rate. Already open is a no-op.
    pub fn start_playback(&mut self) -> Result<()> {
        if self.playback.is_some() {
            return Ok(());
        }
        let sink = self.io.open_renderer(self.config.output_sample_rate)?;
        log::info!("Renderer opened at {}Hz", sink.sample_rate());
        self.playback = Some(PlaybackScheduler::new(sink));
        Ok(())
    }

    /// Acquire the microphone. Already open is a no-op.
    pub fn start_capture(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        let stream = self.io.open_capture(self.config.capture_sample_rate)?;
        log::info!(
            "Microphone opened at {}Hz, sending {}Hz",
            stream.sample_rate,
            self.config.input_sample_rate
        );
        let encoder = FrameEncoder::new(stream.sample_rate, self.config.input_sample_rate)
            .with_level_meter(self.config.meter_input);
        self.capture = Some((stream, encoder));
        Ok(())
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.is_some()
    }

    /// Next encoded microphone frame.
    ///
    /// Pends forever while no microphone is open. Returns `None` once an open
    /// stream ends, which means the device went away.
    pub async fn next_frame(&mut self) -> Option<EncodedFrame> {
        let Some((stream, encoder)) = self.capture.as_mut() else {
            return std::future::pending().await;
        };
        let block = stream.blocks.recv().await?;
        Some(encoder.encode(&block))
    }

    /// Book one chunk of agent audio. Dropped when no renderer is open.
    pub fn enqueue_playback(&mut self, pcm: &[u8]) -> Option<ScheduledChunk> {
        match self.playback.as_mut() {
            Some(scheduler) => scheduler.enqueue(pcm),
            None => {
                log::warn!("No renderer open, dropping {} bytes of audio", pcm.len());
                None
            }
        }
    }

    /// Release the microphone and the speaker. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.capture.take().is_some() {
            log::info!("Microphone released");
        }
        if self.playback.take().is_some() {
            log::info!("Renderer released");
        }
        self.io.close();
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        self.stop();
    }
}
