use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use anyhow::Result;
use tokio::sync::mpsc;

use super::alsa_device::AlsaParams;
use super::audio_system::{AudioOutput, BufferId, PlaybackEvent};
use super::pcm::SampleBuffer;
use crate::error::AcquisitionError;

struct Voice {
    id: BufferId,
    start_frame: u64,
    buffer: SampleBuffer,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.frames() as u64
    }
}

/// Buffers placed on the output clock, rendered period by period.
///
/// `next_frame` is the first frame not yet rendered; nothing can be placed
/// before it. A request that lands in the past (the render loop advanced
/// between reading the clock and placing the buffer) is moved up to
/// `next_frame`, and later requests are shifted by the same amount so they
/// stay back to back. The shift is dropped once the timeline drains.
pub(crate) struct Timeline {
    voices: Vec<Voice>,
    channels: usize,
    next_frame: u64,
    shift: u64,
}

impl Timeline {
    pub(crate) fn new(channels: usize) -> Self {
        Self {
            voices: Vec::new(),
            channels: channels.max(1),
            next_frame: 0,
            shift: 0,
        }
    }

    /// Earliest frame a new buffer can start at, in requester time.
    pub(crate) fn now(&self) -> u64 {
        self.next_frame.saturating_sub(self.shift)
    }

    /// Place `buffer` at `requested` (requester time). Returns the frame it
    /// will actually start at.
    pub(crate) fn add(&mut self, id: BufferId, buffer: SampleBuffer, requested: u64) -> u64 {
        if self.voices.is_empty() {
            self.shift = 0;
        }
        let mut start_frame = requested + self.shift;
        if start_frame < self.next_frame {
            self.shift += self.next_frame - start_frame;
            start_frame = self.next_frame;
        }
        self.voices.push(Voice {
            id,
            start_frame,
            buffer,
        });
        start_frame
    }

    pub(crate) fn remove(&mut self, id: BufferId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.voices.len()
    }

    pub(crate) fn clear(&mut self) {
        self.voices.clear();
        self.shift = 0;
    }

    /// Mix the next `frames` frames into `out` (interleaved, pre-zeroed),
    /// advance `next_frame` past them and drop every voice that ends inside
    /// the window. Returns the ids of the dropped voices in start order.
    pub(crate) fn render(&mut self, frames: usize, out: &mut [f32]) -> Vec<BufferId> {
        let pos = self.next_frame;
        let window_end = pos + frames as u64;
        self.next_frame = window_end;
        let out_ch = self.channels;

        for voice in &self.voices {
            let from = voice.start_frame.max(pos);
            let to = voice.end_frame().min(window_end);
            let in_ch = voice.buffer.channels.max(1) as usize;
            for frame in from..to {
                let src = (frame - voice.start_frame) as usize * in_ch;
                let dst = (frame - pos) as usize * out_ch;
                for c in 0..out_ch {
                    out[dst + c] += voice.buffer.samples[src + c % in_ch];
                }
            }
        }

        let mut finished: Vec<(u64, BufferId)> = self
            .voices
            .iter()
            .filter(|v| v.end_frame() <= window_end)
            .map(|v| (v.start_frame, v.id))
            .collect();
        finished.sort();
        self.voices.retain(|v| v.end_frame() > window_end);
        finished.into_iter().map(|(_, id)| id).collect()
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt().min(1.0)
}

struct Shared {
    timeline: Mutex<Timeline>,
    level: AtomicU32,
    running: AtomicBool,
}

impl Shared {
    fn timeline(&self) -> MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// ALSA output with a sample-accurate clock.
///
/// The playback thread renders one period at a time from the timeline and
/// writes it to the device; silence keeps the clock running when nothing is
/// scheduled. The clock reads the timeline's next unrendered frame, so a
/// buffer started at `current_time()` is never cut by a period already in
/// flight.
pub struct OutputEngine {
    shared: Arc<Shared>,
    sample_rate: u32,
    handle: Option<JoinHandle<()>>,
}

impl OutputEngine {
    pub fn spawn(
        pcm: PCM,
        params: AlsaParams,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Self, AcquisitionError> {
        let shared = Arc::new(Shared {
            timeline: Mutex::new(Timeline::new(params.channels as usize)),
            level: AtomicU32::new(0f32.to_bits()),
            running: AtomicBool::new(true),
        });
        let sample_rate = params.sample_rate;

        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = play_thread(&pcm, &params, &shared, events) {
                        log::error!("Playback thread error: {}", e);
                    }
                })
                .map_err(|e| AcquisitionError::Thread(e.to_string()))?
        };

        Ok(Self {
            shared,
            sample_rate,
            handle: Some(handle),
        })
    }
}

impl AudioOutput for OutputEngine {
    fn current_time(&self) -> f64 {
        self.shared.timeline().now() as f64 / self.sample_rate as f64
    }

    fn start(&mut self, id: BufferId, buffer: SampleBuffer, start_at: f64) {
        let requested = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        self.shared.timeline().add(id, buffer, requested);
    }

    fn stop(&mut self, id: BufferId) {
        self.shared.timeline().remove(id);
    }

    fn level(&self) -> f32 {
        f32::from_bits(self.shared.level.load(Ordering::Relaxed))
    }

    fn close(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
        self.shared.timeline().clear();
    }
}

impl Drop for OutputEngine {
    fn drop(&mut self) {
        self.close();
    }
}

fn play_thread(
    pcm: &PCM,
    params: &AlsaParams,
    shared: &Shared,
    events: mpsc::UnboundedSender<PlaybackEvent>,
) -> Result<()> {
    let channels = params.channels.max(1) as usize;
    let period = params.period_size.max(1);
    let mut mix = vec![0f32; period * channels];
    let mut out = vec![0i16; period * channels];

    let io = pcm.io_i16()?;

    log::info!(
        "Playback started: rate={}, ch={}, period={}",
        params.sample_rate,
        channels,
        period,
    );

    while shared.running.load(Ordering::Relaxed) {
        mix.fill(0.0);
        let finished = shared.timeline().render(period, &mut mix);

        shared.level.store(rms(&mix).to_bits(), Ordering::Relaxed);
        for (dst, &s) in out.iter_mut().zip(&mix) {
            *dst = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        }

        // Write with retry loop to handle short writes and XRUN recovery.
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period {
            match io.writei(&out[frames_written * channels..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        return Err(e2.into());
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

        for id in finished {
            if events.send(PlaybackEvent::Ended(id)).is_err() {
                log::debug!("Playback event receiver dropped");
            }
        }
    }

    log::info!("Playback stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(samples: Vec<f32>) -> SampleBuffer {
        SampleBuffer {
            samples,
            sample_rate: 24_000,
            channels: 1,
        }
    }

    #[test]
    fn test_render_places_buffer_at_start_frame() {
        let mut timeline = Timeline::new(1);
        timeline.add(BufferId(1), mono(vec![0.5; 4]), 2);

        let mut out = vec![0.0; 4];
        let finished = timeline.render(4, &mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5]);
        assert!(finished.is_empty());

        let mut out = vec![0.0; 4];
        let finished = timeline.render(4, &mut out);
        assert_eq!(out, vec![0.5, 0.5, 0.0, 0.0]);
        assert_eq!(finished, vec![BufferId(1)]);
        assert_eq!(timeline.len(), 0);
    }

    #[test]
    fn test_back_to_back_buffers_have_no_gap() {
        let mut timeline = Timeline::new(1);
        timeline.add(BufferId(1), mono(vec![0.1; 3]), 0);
        timeline.add(BufferId(2), mono(vec![0.2; 3]), 3);

        let mut out = vec![0.0; 6];
        let finished = timeline.render(6, &mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.1, 0.2, 0.2, 0.2]);
        assert_eq!(finished, vec![BufferId(1), BufferId(2)]);
    }

    #[test]
    fn test_removed_voice_is_silent() {
        let mut timeline = Timeline::new(1);
        timeline.add(BufferId(7), mono(vec![0.9; 8]), 0);
        assert!(timeline.remove(BufferId(7)));
        assert!(!timeline.remove(BufferId(7)));

        let mut out = vec![0.0; 8];
        let finished = timeline.render(8, &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(finished.is_empty());
    }

    #[test]
    fn test_mono_buffer_fills_stereo_device() {
        let mut timeline = Timeline::new(2);
        timeline.add(BufferId(1), mono(vec![0.25, -0.25]), 0);

        let mut out = vec![0.0; 4];
        timeline.render(2, &mut out);
        assert_eq!(out, vec![0.25, 0.25, -0.25, -0.25]);
    }

    #[test]
    fn test_buffer_started_at_now_plays_from_first_sample() {
        let period = 480;
        let mut timeline = Timeline::new(1);
        let mut out = vec![0.0; period];
        timeline.render(period, &mut out);

        let samples: Vec<f32> = (1..=2400).map(|i| i as f32 / 10_000.0).collect();
        let start = timeline.now();
        assert_eq!(timeline.add(BufferId(1), mono(samples.clone()), start), 480);

        let mut played = Vec::new();
        while timeline.len() > 0 {
            let mut out = vec![0.0; period];
            timeline.render(period, &mut out);
            played.extend(out);
        }
        assert_eq!(&played[..samples.len()], &samples[..]);
    }

    #[test]
    fn test_request_behind_render_is_moved_up_and_stays_gapless() {
        let mut timeline = Timeline::new(1);
        let mut out = vec![0.0; 4];
        timeline.render(4, &mut out);

        // Clock read, then the render loop advances before the buffer lands.
        let now = timeline.now();
        timeline.render(4, &mut out);

        assert_eq!(timeline.add(BufferId(1), mono(vec![0.1; 4]), now), 8);
        assert_eq!(timeline.add(BufferId(2), mono(vec![0.2; 4]), now + 4), 12);

        let mut out = vec![0.0; 8];
        let finished = timeline.render(8, &mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.1, 0.1, 0.2, 0.2, 0.2, 0.2]);
        assert_eq!(finished, vec![BufferId(1), BufferId(2)]);
    }

    #[test]
    fn test_clear_resets_shift() {
        let mut timeline = Timeline::new(1);
        let mut out = vec![0.0; 4];
        timeline.render(4, &mut out);
        timeline.add(BufferId(1), mono(vec![0.1; 4]), 0);
        assert_eq!(timeline.now(), 0);

        timeline.clear();
        assert_eq!(timeline.now(), 4);
        assert_eq!(timeline.len(), 0);
    }

    #[test]
    fn test_rms_level() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5]) - 0.5).abs() < 1e-6);
    }
}
