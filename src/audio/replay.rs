//! Deterministic [`AudioIo`] that replays fixed sample arrays.
//!
//! Capture hands out the configured blocks in order and then stays open until
//! stopped, like a live microphone. Rendering records every booking against a
//! manually driven clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::audio_io::{AudioIo, CaptureStream, RenderSink, StreamGuard};
use crate::error::{Result, SessionError};

#[derive(Debug, Default)]
struct RenderState {
    now: f64,
    submissions: Vec<(f64, Vec<f32>)>,
}

/// Shared view of what a [`ManualRenderSink`] was asked to play.
#[derive(Debug, Clone, Default)]
pub struct RenderLog {
    inner: Arc<Mutex<RenderState>>,
}

impl RenderLog {
    pub fn set_now(&self, now: f64) {
        if let Ok(mut state) = self.inner.lock() {
            state.now = now;
        }
    }

    fn now(&self) -> f64 {
        self.inner.lock().map(|state| state.now).unwrap_or_default()
    }

    /// `(start, samples)` of every booking, in submission order.
    pub fn submissions(&self) -> Vec<(f64, Vec<f32>)> {
        self.inner
            .lock()
            .map(|state| state.submissions.clone())
            .unwrap_or_default()
    }

    fn record(&self, start: f64, samples: Vec<f32>) {
        if let Ok(mut state) = self.inner.lock() {
            state.submissions.push((start, samples));
        }
    }
}

pub struct ManualRenderSink {
    sample_rate: u32,
    log: RenderLog,
}

impl ManualRenderSink {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_log(sample_rate, RenderLog::default())
    }

    pub fn with_log(sample_rate: u32, log: RenderLog) -> Self {
        Self { sample_rate, log }
    }

    pub fn log(&self) -> RenderLog {
        self.log.clone()
    }
}

impl RenderSink for ManualRenderSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> f64 {
        self.log.now()
    }

    fn submit(&mut self, start: f64, samples: Vec<f32>) {
        self.log.record(start, samples);
    }
}

pub struct ReplayIo {
    capture_rate: u32,
    blocks: Vec<Vec<f32>>,
    fail_capture: bool,
    render_log: RenderLog,
    capture_running: Arc<AtomicBool>,
}

impl ReplayIo {
    /// Replays `blocks` as if captured at `capture_rate`.
    pub fn new(capture_rate: u32, blocks: Vec<Vec<f32>>) -> Self {
        Self {
            capture_rate,
            blocks,
            fail_capture: false,
            render_log: RenderLog::default(),
            capture_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate a missing microphone.
    pub fn without_microphone(mut self) -> Self {
        self.fail_capture = true;
        self
    }

    pub fn render_log(&self) -> RenderLog {
        self.render_log.clone()
    }

    /// Reads true while a capture stream handed out by this backend is alive.
    pub fn capture_flag(&self) -> Arc<AtomicBool> {
        self.capture_running.clone()
    }
}

impl AudioIo for ReplayIo {
    fn open_capture(&mut self, _sample_rate: u32) -> Result<CaptureStream> {
        if self.fail_capture {
            return Err(SessionError::DeviceAcquisition("no capture device".into()));
        }
        let (tx, rx) = mpsc::channel(self.blocks.len().max(1));
        for block in &self.blocks {
            if tx.try_send(block.clone()).is_err() {
                log::warn!("Replay capture queue full");
            }
        }

        self.capture_running.store(true, Ordering::SeqCst);
        let running = self.capture_running.clone();
        // Holding the sender keeps the stream open until it is dropped.
        let keep_open = std::thread::spawn({
            let running = running.clone();
            move || {
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                drop(tx);
            }
        });
        Ok(CaptureStream::new(
            self.capture_rate,
            rx,
            StreamGuard::new(running, Some(keep_open)),
        ))
    }

    fn open_renderer(&mut self, sample_rate: u32) -> Result<Box<dyn RenderSink>> {
        Ok(Box::new(ManualRenderSink::with_log(
            sample_rate,
            self.render_log.clone(),
        )))
    }

    fn close(&mut self) {
        self.capture_running.store(false, Ordering::SeqCst);
    }
}
