//! ALSA backend for [`AudioIo`].
//!
//! Device I/O runs on dedicated std threads (never tokio tasks): the capture thread
//! hands mono f32 blocks to the event loop, the render thread plays booked chunks
//! on its own frame clock and writes silence between them.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use tokio::sync::mpsc;

use super::audio_io::{AudioIo, CaptureStream, RenderSink, StreamGuard};
use super::codec::{f32_to_pcm16, pcm16_to_f32};
use super::playback::{render_period, Booking};
use crate::error::{Result, SessionError};

/// Blocks buffered between the capture thread and the event loop.
const CAPTURE_QUEUE_DEPTH: usize = 64;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone, Copy)]
pub struct AlsaParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a PCM device for capture (recording).
pub fn open_capture(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, channels, None)
}

/// Open a PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Playback, sample_rate, channels, period_size)
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    };
    let pcm = PCM::new(device, direction, false).map_err(|e| {
        SessionError::DeviceAcquisition(format!("cannot open '{}' for {}: {}", device, dir_name, e))
    })?;

    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}

/// Real hardware through ALSA.
pub struct AlsaIo {
    capture_device: String,
    playback_device: String,
    playback_period_size: Option<usize>,
    streams: Vec<Arc<AtomicBool>>,
}

impl AlsaIo {
    pub fn new(capture_device: &str, playback_device: &str, playback_period_size: usize) -> Self {
        Self {
            capture_device: capture_device.to_string(),
            playback_device: playback_device.to_string(),
            playback_period_size: (playback_period_size > 0).then_some(playback_period_size),
            streams: Vec::new(),
        }
    }

    fn track(&mut self, running: &Arc<AtomicBool>) {
        self.streams.retain(|flag| flag.load(Ordering::SeqCst));
        self.streams.push(running.clone());
    }
}

impl AudioIo for AlsaIo {
    fn open_capture(&mut self, sample_rate: u32) -> Result<CaptureStream> {
        let (pcm, params) = open_capture(&self.capture_device, sample_rate, 1)?;
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE_DEPTH);

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    if let Err(e) = record_thread(pcm, params, tx, &running) {
                        log::error!("Recording thread error: {}", e);
                    }
                    running.store(false, Ordering::SeqCst);
                })?
        };

        self.track(&running);
        Ok(CaptureStream::new(
            params.sample_rate,
            rx,
            StreamGuard::new(running, Some(handle)),
        ))
    }

    fn open_renderer(&mut self, sample_rate: u32) -> Result<Box<dyn RenderSink>> {
        let (pcm, params) =
            open_playback(&self.playback_device, sample_rate, 1, self.playback_period_size)?;
        if params.sample_rate != sample_rate {
            return Err(SessionError::DeviceAcquisition(format!(
                "playback device settled on {}Hz, need {}Hz",
                params.sample_rate, sample_rate
            )));
        }

        let running = Arc::new(AtomicBool::new(true));
        let position = Arc::new(AtomicU64::new(0));
        let (tx, rx) = std_mpsc::channel();

        let handle = {
            let running = running.clone();
            let position = position.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = play_thread(pcm, params, rx, &position, &running) {
                        log::error!("Playback thread error: {}", e);
                    }
                    running.store(false, Ordering::SeqCst);
                })?
        };

        self.track(&running);
        Ok(Box::new(AlsaRenderSink {
            sample_rate,
            position,
            tx,
            guard: StreamGuard::new(running, Some(handle)),
        }))
    }

    fn close(&mut self) {
        for flag in self.streams.drain(..) {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for AlsaIo {
    fn drop(&mut self) {
        self.close();
    }
}

struct AlsaRenderSink {
    sample_rate: u32,
    /// Frames handed to the device so far; this is the render clock.
    position: Arc<AtomicU64>,
    tx: std_mpsc::Sender<Booking>,
    guard: StreamGuard,
}

impl RenderSink for AlsaRenderSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> f64 {
        self.position.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn submit(&mut self, start: f64, samples: Vec<f32>) {
        if !self.guard.is_running() {
            log::warn!("Render thread stopped, dropping {} samples", samples.len());
            return;
        }
        let start_frame = (start * self.sample_rate as f64).round() as u64;
        if self.tx.send(Booking::new(start_frame, samples)).is_err() {
            log::warn!("Render thread gone, chunk dropped");
        }
    }
}

// ======================== Recording thread ========================

fn record_thread(
    pcm: PCM,
    params: AlsaParams,
    tx: mpsc::Sender<Vec<f32>>,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let io = pcm.io_i16()?;
    let channels = params.channels.max(1) as usize;
    let mut read_buf = vec![0i16; params.period_size * channels];

    log::info!(
        "Recording started: rate={}, ch={}, period={}",
        params.sample_rate,
        channels,
        params.period_size,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                // Interleaved → mono
                let block: Vec<f32> = read_buf[..frames * channels]
                    .chunks_exact(channels)
                    .map(|frame| {
                        frame.iter().map(|&s| pcm16_to_f32(s)).sum::<f32>() / channels as f32
                    })
                    .collect();
                if tx.blocking_send(block).is_err() {
                    log::info!("Capture receiver dropped");
                    break;
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}

// ======================== Playback thread ========================

fn play_thread(
    pcm: PCM,
    params: AlsaParams,
    rx: std_mpsc::Receiver<Booking>,
    position: &AtomicU64,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let io = pcm.io_i16()?;
    let period = params.period_size.max(1);
    let mut pending: VecDeque<Booking> = VecDeque::new();
    let mut mix = vec![0f32; period];
    let mut out = vec![0i16; period];

    log::info!("Playback started: rate={}, period={}", params.sample_rate, period);

    while running.load(Ordering::Relaxed) {
        pending.extend(rx.try_iter());

        let pos = position.load(Ordering::Acquire);
        render_period(&mut mix, pos, &mut pending);
        for (dst, &src) in out.iter_mut().zip(mix.iter()) {
            *dst = f32_to_pcm16(src);
        }

        // 写入 ALSA，处理短写和 XRUN
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period {
            match io.writei(&out[frames_written..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        return Ok(());
                    }
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries reached, dropping {} frames",
                            period - frames_written
                        );
                        break;
                    }
                }
            }
        }

        position.fetch_add(period as u64, Ordering::Release);
    }

    log::info!("Playback stopped");
    Ok(())
}
