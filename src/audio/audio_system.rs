//! Hardware seams of the session and their ALSA implementation.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async network tasks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::alsa_device;
use super::pcm::SampleBuffer;
use super::play::OutputEngine;
use super::record::CaptureThread;
use crate::error::AcquisitionError;

/// Audio system configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Microphone rate sent to the service
    pub input_sample_rate: u32,
    /// Rate of the audio the service sends back
    pub output_sample_rate: u32,
    /// Channel count of the service audio
    pub output_channels: u16,
    /// Capture channel count requested from ALSA; frames are mixed to mono
    pub capture_channels: u32,
    /// Samples per outbound `AudioChunk`
    pub chunk_frames: usize,
    /// Frames rendered per playback period
    pub playback_period_frames: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            output_channels: 1,
            capture_channels: 1,
            chunk_frames: 4096,
            playback_period_frames: 480,
        }
    }
}

/// Identity of one scheduled output buffer within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Notifications from the output device back to the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The buffer played to its end and was released by the device.
    Ended(BufferId),
}

/// A fixed-size window of mono microphone samples in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    samples: Arc<[f32]>,
}

impl AudioChunk {
    pub fn new(samples: impl Into<Arc<[f32]>>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Output subsystem with its own clock.
///
/// Times are seconds on the output clock, which starts at 0 when the output
/// is opened and advances as audio is rendered.
pub trait AudioOutput: Send {
    fn current_time(&self) -> f64;

    /// Queue `buffer` to begin at `start_at`. Starting in the past starts now.
    fn start(&mut self, id: BufferId, buffer: SampleBuffer, start_at: f64);

    /// Stop a buffer immediately, whether it is playing or still pending.
    /// Unknown ids are ignored.
    fn stop(&mut self, id: BufferId);

    /// RMS level of the most recently rendered audio, in [0, 1].
    fn level(&self) -> f32;

    /// Release the device. Further calls are no-ops.
    fn close(&mut self);
}

/// Live microphone stream. Dropping it must release the device as well.
pub trait CaptureStream: Send {
    fn stop(&mut self);
}

/// Factory for the per-session audio resources.
pub trait AudioSystem: Send + Sync {
    /// Acquire the microphone. Chunks are delivered in capture order.
    fn open_capture(
        &self,
        chunks: mpsc::Sender<AudioChunk>,
    ) -> Result<Box<dyn CaptureStream>, AcquisitionError>;

    /// Open the output subsystem. Completion notifications go to `events`.
    fn open_output(
        &self,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Box<dyn AudioOutput>, AcquisitionError>;
}

/// ALSA-backed audio system.
pub struct AlsaAudioSystem {
    config: AudioConfig,
}

impl AlsaAudioSystem {
    pub fn new(config: AudioConfig) -> Self {
        log::info!(
            "AudioSystem: capture: \"{}\" {}Hz, playback: \"{}\" {}Hz/{}ch",
            config.capture_device,
            config.input_sample_rate,
            config.playback_device,
            config.output_sample_rate,
            config.output_channels,
        );
        Self { config }
    }
}

impl AudioSystem for AlsaAudioSystem {
    fn open_capture(
        &self,
        chunks: mpsc::Sender<AudioChunk>,
    ) -> Result<Box<dyn CaptureStream>, AcquisitionError> {
        let (pcm, params) = alsa_device::open_capture(
            &self.config.capture_device,
            self.config.input_sample_rate,
            self.config.capture_channels,
        )
        .map_err(|e| AcquisitionError::Microphone(format!("{:#}", e)))?;

        let stream = CaptureThread::spawn(pcm, params, self.config.chunk_frames, chunks)?;
        Ok(Box::new(stream))
    }

    fn open_output(
        &self,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Box<dyn AudioOutput>, AcquisitionError> {
        let period = (self.config.playback_period_frames > 0)
            .then_some(self.config.playback_period_frames);
        let (pcm, params) = alsa_device::open_playback(
            &self.config.playback_device,
            self.config.output_sample_rate,
            self.config.output_channels as u32,
            period,
        )
        .map_err(|e| AcquisitionError::Output(format!("{:#}", e)))?;

        let engine = OutputEngine::spawn(pcm, params, events)?;
        Ok(Box::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_audio_config() {
        let config = AudioConfig::default();
        assert_eq!(config.input_sample_rate, 16_000);
        assert_eq!(config.output_sample_rate, 24_000);
        assert_eq!(config.output_channels, 1);
        assert_eq!(config.chunk_frames, 4096);
    }

    #[test]
    fn test_audio_chunk_accessors() {
        let chunk = AudioChunk::new(vec![0.25f32; 4]);
        let copy = chunk.clone();
        assert_eq!(copy.samples(), &[0.25; 4]);
        assert_eq!(chunk.len(), 4);
        assert!(!chunk.is_empty());
    }
}
