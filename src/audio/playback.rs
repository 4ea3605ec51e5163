//! Gapless scheduling of the agent's reply audio.
//!
//! Each decoded chunk starts at `max(now, cursor)` on the render clock, and the cursor
//! then moves to the end of that chunk. Chunks are therefore concatenated back to back,
//! never overlap and never start in the past, whatever the network arrival jitter.
//! Callers must enqueue chunks in transmission order from a single thread.

use std::collections::VecDeque;

use super::audio_io::RenderSink;
use super::codec::{decode_pcm16_le, output_level};

/// Placement of one chunk on the render timeline, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSlot {
    pub start: f64,
    pub duration: f64,
}

impl PlaybackSlot {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub slot: PlaybackSlot,
    /// Loudness 0..=100 for visualisation only.
    pub level: f32,
}

pub struct PlaybackScheduler {
    sink: Box<dyn RenderSink>,
    cursor: f64,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn RenderSink>) -> Self {
        Self { sink, cursor: 0.0 }
    }

    /// Decode a 16-bit LE PCM chunk and book it right after the previous one.
    ///
    /// Returns `None` for an empty chunk, which leaves the cursor untouched.
    pub fn enqueue(&mut self, pcm: &[u8]) -> Option<ScheduledChunk> {
        let samples = decode_pcm16_le(pcm);
        if samples.is_empty() {
            return None;
        }

        let duration = samples.len() as f64 / self.sink.sample_rate() as f64;
        let start = self.sink.now().max(self.cursor);
        self.cursor = start + duration;

        let level = output_level(&samples);
        self.sink.submit(start, samples);

        Some(ScheduledChunk {
            slot: PlaybackSlot { start, duration },
            level,
        })
    }

    /// End of the last booked chunk.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }
}

// ======================== Render side ========================

/// A chunk waiting on the render thread, positioned in frames.
#[derive(Debug)]
pub(crate) struct Booking {
    start_frame: u64,
    samples: Vec<f32>,
    offset: usize,
}

impl Booking {
    pub(crate) fn new(start_frame: u64, samples: Vec<f32>) -> Self {
        Self {
            start_frame,
            samples,
            offset: 0,
        }
    }
}

/// Fill one device period starting at frame `pos`.
///
/// Bookings play strictly in FIFO order. A booking whose start lies ahead leaves
/// silence until it is due; a late one starts immediately.
pub(crate) fn render_period(out: &mut [f32], pos: u64, pending: &mut VecDeque<Booking>) {
    out.fill(0.0);
    let mut filled = 0;
    while filled < out.len() {
        let Some(booking) = pending.front_mut() else {
            break;
        };
        let at = pos + filled as u64;
        if booking.start_frame > at {
            let gap = (booking.start_frame - at).min((out.len() - filled) as u64) as usize;
            filled += gap;
            continue;
        }
        let n = (booking.samples.len() - booking.offset).min(out.len() - filled);
        out[filled..filled + n]
            .copy_from_slice(&booking.samples[booking.offset..booking.offset + n]);
        booking.offset += n;
        filled += n;
        if booking.offset == booking.samples.len() {
            pending.pop_front();
        }
    }
}
