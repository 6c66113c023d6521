//! Gapless playback scheduling with barge-in.
//!
//! Each decoded buffer starts at `max(cursor, now)` and pushes the cursor to
//! its end, so buffers play back to back while delivery keeps pace and fall
//! back to "now" after a stall. An interruption stops every live buffer and
//! resets the cursor to the output clock.

use std::collections::BTreeSet;

use super::audio_system::{AudioOutput, BufferId};
use super::pcm::SampleBuffer;

/// Placement of one buffer on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start_at: f64,
    pub duration: f64,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start_at + self.duration
    }
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    cursor: f64,
    live: BTreeSet<BufferId>,
    next_id: u64,
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        let cursor = output.current_time();
        Self {
            output,
            cursor,
            live: BTreeSet::new(),
            next_id: 0,
            closed: false,
        }
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, id: BufferId) -> bool {
        self.live.contains(&id)
    }

    pub fn level(&self) -> f32 {
        if self.closed { 0.0 } else { self.output.level() }
    }

    /// Schedule `buffer` right after everything already queued.
    /// Returns `None` for an empty buffer or after `shutdown`.
    pub fn schedule(&mut self, buffer: SampleBuffer) -> Option<ScheduledBuffer> {
        if self.closed || buffer.is_empty() {
            return None;
        }

        let now = self.output.current_time();
        let start_at = self.cursor.max(now);
        let duration = buffer.duration();
        let id = BufferId(self.next_id);
        self.next_id += 1;

        self.output.start(id, buffer, start_at);
        self.live.insert(id);
        self.cursor = start_at + duration;

        log::trace!(
            "Scheduled buffer {:?} at {:.3}s for {:.3}s ({} live)",
            id,
            start_at,
            duration,
            self.live.len()
        );

        Some(ScheduledBuffer {
            id,
            start_at,
            duration,
        })
    }

    /// A buffer finished on its own.
    pub fn on_ended(&mut self, id: BufferId) {
        self.live.remove(&id);
    }

    /// Barge-in: stop every live buffer, played or pending, and restart the
    /// cursor at the output clock. Returns how many buffers were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.stop_all();
        self.cursor = self.output.current_time();
        stopped
    }

    /// Stop everything and release the output device. Idempotent.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.stop_all();
        self.output.close();
        self.closed = true;
    }

    fn stop_all(&mut self) -> usize {
        let live = std::mem::take(&mut self.live);
        for id in &live {
            self.output.stop(*id);
        }
        live.len()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        now: f64,
        started: Vec<(BufferId, f64)>,
        stopped: Vec<BufferId>,
        closed: bool,
    }

    #[derive(Clone, Default)]
    struct FakeOutput(Arc<Mutex<FakeState>>);

    impl FakeOutput {
        fn set_now(&self, t: f64) {
            self.0.lock().unwrap().now = t;
        }
    }

    impl AudioOutput for FakeOutput {
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().now
        }
        fn start(&mut self, id: BufferId, _buffer: SampleBuffer, start_at: f64) {
            self.0.lock().unwrap().started.push((id, start_at));
        }
        fn stop(&mut self, id: BufferId) {
            self.0.lock().unwrap().stopped.push(id);
        }
        fn level(&self) -> f32 {
            0.5
        }
        fn close(&mut self) {
            self.0.lock().unwrap().closed = true;
        }
    }

    fn buffer(seconds: f64) -> SampleBuffer {
        let rate = 24_000;
        SampleBuffer {
            samples: vec![0.0; (seconds * rate as f64) as usize],
            sample_rate: rate,
            channels: 1,
        }
    }

    fn scheduler_at(now: f64) -> (PlaybackScheduler, FakeOutput) {
        let output = FakeOutput::default();
        output.set_now(now);
        (PlaybackScheduler::new(Box::new(output.clone())), output)
    }

    #[test]
    fn test_cursor_starts_at_output_clock() {
        let (scheduler, _) = scheduler_at(3.5);
        assert_eq!(scheduler.cursor(), 3.5);
    }

    #[test]
    fn test_on_time_delivery_is_gapless() {
        let (mut scheduler, output) = scheduler_at(0.0);

        let a = scheduler.schedule(buffer(0.5)).unwrap();
        output.set_now(0.1);
        let b = scheduler.schedule(buffer(0.25)).unwrap();
        output.set_now(0.2);
        let c = scheduler.schedule(buffer(0.5)).unwrap();

        assert_eq!(a.start_at, 0.0);
        assert_eq!(b.start_at, a.end());
        assert_eq!(c.start_at, b.end());
        assert_eq!(scheduler.cursor(), c.end());
        assert_eq!(scheduler.live_count(), 3);
    }

    #[test]
    fn test_stall_falls_back_to_now() {
        let (mut scheduler, output) = scheduler_at(0.0);
        scheduler.schedule(buffer(0.5)).unwrap();

        output.set_now(2.0);
        let late = scheduler.schedule(buffer(0.5)).unwrap();
        assert_eq!(late.start_at, 2.0);
        assert_eq!(scheduler.cursor(), 2.5);
    }

    #[test]
    fn test_never_overlaps_under_irregular_arrivals() {
        let (mut scheduler, output) = scheduler_at(0.0);
        let arrivals = [0.0, 0.01, 0.4, 0.41, 1.9, 1.95, 1.96, 5.0, 5.001];
        let durations = [0.3, 0.1, 0.2, 0.5, 0.04, 0.3, 0.2, 0.1, 0.1];

        let mut placed = Vec::new();
        for (t, d) in arrivals.iter().zip(durations) {
            output.set_now(*t);
            placed.push(scheduler.schedule(buffer(d)).unwrap());
        }
        for pair in placed.windows(2) {
            assert!(pair[1].start_at >= pair[0].end() - 1e-12);
            assert!(pair[1].start_at >= pair[0].start_at);
        }
    }

    #[test]
    fn test_interrupt_stops_everything_and_resets_cursor() {
        let (mut scheduler, output) = scheduler_at(0.0);
        let ids: Vec<_> = (0..3)
            .map(|_| scheduler.schedule(buffer(1.0)).unwrap().id)
            .collect();

        output.set_now(0.4);
        assert_eq!(scheduler.interrupt(), 3);
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(scheduler.cursor(), 0.4);

        let state = output.0.lock().unwrap();
        assert_eq!(state.stopped, ids);
    }

    #[test]
    fn test_schedule_after_interrupt_starts_now() {
        let (mut scheduler, output) = scheduler_at(0.0);
        scheduler.schedule(buffer(3.0)).unwrap();
        output.set_now(1.0);
        scheduler.interrupt();

        let next = scheduler.schedule(buffer(0.5)).unwrap();
        assert_eq!(next.start_at, 1.0);
    }

    #[test]
    fn test_ended_buffers_leave_live_set() {
        let (mut scheduler, _) = scheduler_at(0.0);
        let a = scheduler.schedule(buffer(0.1)).unwrap();
        let b = scheduler.schedule(buffer(0.1)).unwrap();

        scheduler.on_ended(a.id);
        assert!(!scheduler.is_live(a.id));
        assert!(scheduler.is_live(b.id));
        scheduler.on_ended(a.id);
        assert_eq!(scheduler.live_count(), 1);
    }

    #[test]
    fn test_shutdown_releases_output_once() {
        let (mut scheduler, output) = scheduler_at(0.0);
        scheduler.schedule(buffer(0.2)).unwrap();
        scheduler.shutdown();
        scheduler.shutdown();

        assert!(output.0.lock().unwrap().closed);
        assert_eq!(scheduler.live_count(), 0);
        assert!(scheduler.schedule(buffer(0.2)).is_none());
        assert_eq!(scheduler.level(), 0.0);
    }

    #[test]
    fn test_empty_buffer_is_not_scheduled() {
        let (mut scheduler, _) = scheduler_at(0.0);
        assert!(scheduler.schedule(buffer(0.0)).is_none());
        assert_eq!(scheduler.cursor(), 0.0);
    }
}
