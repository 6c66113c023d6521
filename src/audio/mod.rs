//! audio - Microphone capture, timed playback, and the PCM16 wire codec.
//!
//! Device I/O uses ALSA on dedicated OS threads. The session talks to the
//! hardware only through the `AudioSystem`, `AudioOutput` and
//! `CaptureStream` traits so it can be driven without a sound card.

mod alsa_device;
mod audio_system;
pub mod pcm;
mod play;
mod record;
pub mod scheduler;

pub use audio_system::{
    AlsaAudioSystem, AudioChunk, AudioConfig, AudioOutput, AudioSystem, BufferId, CaptureStream,
    PlaybackEvent,
};
pub use pcm::SampleBuffer;
pub use scheduler::{PlaybackScheduler, ScheduledBuffer};
