//! audio - Microphone capture, scheduled playback and PCM conversion
//!
//! Device I/O runs on dedicated std threads behind [`AudioIo`]; ALSA drives real
//! hardware and [`replay`] stands in for it in tests.

mod alsa_device;
pub mod audio_io;
mod audio_system;
pub mod capture;
pub mod codec;
pub mod playback;
pub mod replay;

pub use alsa_device::AlsaIo;
pub use audio_io::{AudioIo, CaptureStream, RenderSink, StreamGuard};
pub use audio_system::{AudioConfig, AudioSystem};
pub use capture::{EncodedFrame, FrameEncoder};
pub use playback::{PlaybackScheduler, PlaybackSlot, ScheduledChunk};
