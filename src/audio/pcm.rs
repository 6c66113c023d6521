//! PCM16 codec for the duplex channel.
//!
//! Outbound: float samples in [-1, 1] → 16-bit signed little-endian PCM →
//! base64. Inbound: base64 → PCM16LE → float samples. No resampling happens
//! here; rates are configuration constants per direction.

use base64::prelude::*;

use crate::error::DecodeError;

/// Decoded audio ready for playback. Samples are interleaved when
/// `channels > 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl SampleBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// MIME type announced with outbound media chunks.
pub fn mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Encode float samples to PCM16LE bytes. Each sample is clamped to [-1, 1]
/// before scaling; the scaled value is truncated toward zero.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        // NaN clamps to NaN and `as` maps it to 0.
        let scaled = (s.clamp(-1.0, 1.0) * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32);
        out.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    out
}

/// `encode` followed by standard padded base64.
pub fn encode_base64(samples: &[f32]) -> String {
    BASE64_STANDARD.encode(encode(samples))
}

/// Decode PCM16LE bytes into a sample buffer.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<SampleBuffer, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::NoChannels);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    let count = bytes.len() / 2;
    if count % channels as usize != 0 {
        return Err(DecodeError::ChannelMismatch {
            samples: count,
            channels,
        });
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(SampleBuffer {
        samples,
        sample_rate,
        channels,
    })
}

/// Decode a base64 payload as carried in `inlineData.data`.
pub fn decode_base64(
    payload: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<SampleBuffer, DecodeError> {
    let bytes = BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|e| DecodeError::Encoding(e.to_string()))?;
    decode(&bytes, sample_rate, channels)
}
