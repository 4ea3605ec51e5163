//! Hardware audio seam.
//!
//! Capture and render devices are platform capabilities behind [`AudioIo`]. The ALSA
//! backend drives real hardware; [`crate::audio::replay`] replays fixed sample arrays
//! for tests. Every stream handed out owns a [`StreamGuard`], so dropping the stream
//! releases the device on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

use crate::error::Result;

/// Live microphone stream: mono f32 blocks at the negotiated device rate.
pub struct CaptureStream {
    pub sample_rate: u32,
    pub blocks: mpsc::Receiver<Vec<f32>>,
    // Must drop after `blocks`: the producer may be parked on a full channel.
    _guard: StreamGuard,
}

impl CaptureStream {
    pub fn new(sample_rate: u32, blocks: mpsc::Receiver<Vec<f32>>, guard: StreamGuard) -> Self {
        Self {
            sample_rate,
            blocks,
            _guard: guard,
        }
    }
}

/// Output device with its own clock.
///
/// `now` reads the render clock, which is the only timing authority for playback.
pub trait RenderSink: Send {
    fn sample_rate(&self) -> u32;

    /// Current render position in seconds.
    fn now(&self) -> f64;

    /// Book `samples` to start at `start` seconds on the render clock. Never blocks.
    fn submit(&mut self, start: f64, samples: Vec<f32>);
}

pub trait AudioIo: Send {
    /// Acquire the microphone. The device may settle on a rate other than `sample_rate`.
    fn open_capture(&mut self, sample_rate: u32) -> Result<CaptureStream>;

    /// Acquire the speaker at `sample_rate`.
    fn open_renderer(&mut self, sample_rate: u32) -> Result<Box<dyn RenderSink>>;

    /// Release everything this backend still holds.
    fn close(&mut self);
}

/// Stops a device thread when dropped or when its backend is closed.
pub struct StreamGuard {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StreamGuard {
    pub fn new(running: Arc<AtomicBool>, thread: Option<JoinHandle<()>>) -> Self {
        Self { running, thread }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the device thread to stop. Inside a tokio runtime the join runs on the
    /// blocking pool, so the caller never waits out a device period.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.thread.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || join_device_thread(handle));
            }
            Err(_) => join_device_thread(handle),
        }
    }
}

fn join_device_thread(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        log::error!("Audio thread panicked during shutdown");
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.stop();
    }
}
