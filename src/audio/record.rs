use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use anyhow::Result;
use tokio::sync::mpsc;

use super::alsa_device::AlsaParams;
use super::audio_system::{AudioChunk, CaptureStream};
use crate::error::AcquisitionError;

/// Microphone capture running on its own OS thread.
///
/// ALSA capture → mono mixdown → fixed windows of `chunk_frames` → `chunks`.
pub struct CaptureThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureThread {
    pub fn spawn(
        pcm: PCM,
        params: AlsaParams,
        chunk_frames: usize,
        chunks: mpsc::Sender<AudioChunk>,
    ) -> Result<Self, AcquisitionError> {
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    if let Err(e) = record_thread(&pcm, &params, chunk_frames, chunks, &running) {
                        log::error!("Recording thread error: {}", e);
                    }
                })
                .map_err(|e| AcquisitionError::Thread(e.to_string()))?
        };

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }
}

impl CaptureStream for CaptureThread {
    /// Signal the thread to stop and wait for it to release the device.
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Average interleaved i16 frames down to mono floats in [-1, 1].
pub(crate) fn mix_to_mono(interleaved: &[i16], channels: usize, out: &mut Vec<f32>) {
    let channels = channels.max(1);
    for frame in interleaved.chunks_exact(channels) {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        out.push(sum as f32 / channels as f32 / 32768.0);
    }
}

fn record_thread(
    pcm: &PCM,
    params: &AlsaParams,
    chunk_frames: usize,
    chunks: mpsc::Sender<AudioChunk>,
    running: &AtomicBool,
) -> Result<()> {
    let channels = params.channels as usize;
    let chunk_frames = chunk_frames.max(1);

    // ALSA read buffer (interleaved i16, one period)
    let mut read_buf = vec![0i16; params.period_size * channels];
    let mut accum: Vec<f32> = Vec::with_capacity(chunk_frames * 2);

    let io = pcm.io_i16()?;

    log::info!(
        "Recording started: rate={}, ch={}, period={}, chunk_frames={}",
        params.sample_rate,
        channels,
        params.period_size,
        chunk_frames,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                mix_to_mono(&read_buf[..frames * channels], channels, &mut accum);

                while accum.len() >= chunk_frames {
                    let chunk = AudioChunk::new(&accum[..chunk_frames]);
                    accum.drain(..chunk_frames);
                    if chunks.blocking_send(chunk).is_err() {
                        log::info!("Capture receiver dropped, stopping");
                        return Ok(());
                    }
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
