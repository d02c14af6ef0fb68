//! Gap-free playback scheduling
//!
//! Inbound frames arrive irregularly but must play back to back. Each frame
//! starts at `max(next_start_time, now)` on the sink clock, so a buffer never
//! starts in the past and never before its predecessor ends. A late arrival
//! leaves a gap; nothing ever overlaps.
//!
//! The scheduler is owned by the session loop, which serializes scheduling,
//! completions and interruption flushes.

use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::audio::buffer::AudioFrame;
use crate::audio::playback::{BufferId, PlaybackSink};
use crate::error::AudioError;

/// Placement of one scheduled buffer on the sink clock
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
    sink: Box<dyn PlaybackSink>,
    next_start_time: f64,
    active: BTreeMap<BufferId, ScheduledBuffer>,
    next_id: BufferId,
    closed: bool,
}

impl PlaybackScheduler {
    /// Start the sink and return the scheduler with the receiver on which
    /// the sink reports finished buffers.
    pub fn start(
        mut sink: Box<dyn PlaybackSink>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<BufferId>), AudioError> {
        let (tx, rx) = mpsc::unbounded_channel();
        sink.start(tx)?;
        let next_start_time = sink.now();
        Ok((
            Self {
                sink,
                next_start_time,
                active: BTreeMap::new(),
                next_id: 0,
                closed: false,
            },
            rx,
        ))
    }

    /// Schedule a decoded frame right after everything already scheduled.
    ///
    /// Zero-length frames are skipped and return `None`.
    pub fn schedule(&mut self, frame: AudioFrame) -> Result<Option<ScheduledBuffer>, AudioError> {
        let duration = frame.duration();
        if duration <= 0.0 {
            return Ok(None);
        }

        let now = self.sink.now();
        let start_at = self.next_start_time.max(now);
        let id = self.next_id;

        self.sink.schedule(id, frame, start_at)?;
        self.next_id += 1;

        let buffer = ScheduledBuffer {
            id,
            start_at,
            duration,
        };
        self.active.insert(id, buffer);
        self.next_start_time = start_at + duration;
        Ok(Some(buffer))
    }

    /// A buffer finished on its own. Unknown ids (already flushed) are ignored.
    pub fn on_complete(&mut self, id: BufferId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Stop every buffer, playing or pending, and restart the timeline at
    /// the current clock. Returns how many buffers were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in std::mem::take(&mut self.active).into_keys() {
            self.sink.stop(id);
        }
        self.next_start_time = self.sink.now();
        if stopped > 0 {
            debug!("Flushed {} buffers", stopped);
        }
        stopped
    }

    /// Flush and release the sink
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.interrupt();
        self.sink.close();
        self.closed = true;
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn now(&self) -> f64 {
        self.sink.now()
    }

    /// Asynchronous sink failure, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.sink.check_errors()
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
    use crate::audio::playback::MockSinkHandle;
    use proptest::prelude::*;

    fn frame(samples: usize) -> AudioFrame {
        AudioFrame::new(vec![0.1; samples], 1, 24_000, 0)
    }

    fn scheduler(handle: &MockSinkHandle) -> (PlaybackScheduler, mpsc::UnboundedReceiver<BufferId>) {
        PlaybackScheduler::start(Box::new(handle.sink())).unwrap()
    }

    #[test]
    fn test_back_to_back_frames_are_exactly_contiguous() {
        let handle = MockSinkHandle::new();
        let (mut scheduler, _rx) = scheduler(&handle);

        let first = scheduler.schedule(frame(2400)).unwrap().unwrap();
        let second = scheduler.schedule(frame(2400)).unwrap().unwrap();

        assert_eq!(first.start_at, 0.0);
        assert_eq!(second.start_at, first.start_at + 0.1);
        assert_eq!(scheduler.active_count(), 2);
    }

    #[test]
    fn test_late_arrival_starts_now() {
        let handle = MockSinkHandle::new();
        let (mut scheduler, _rx) = scheduler(&handle);

        scheduler.schedule(frame(2400)).unwrap();
        handle.set_time(0.5);
        let late = scheduler.schedule(frame(2400)).unwrap().unwrap();

        assert_eq!(late.start_at, 0.5);
        assert!((scheduler.next_start_time() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_starts_from_sink_clock() {
        let handle = MockSinkHandle::new();
        handle.set_time(3.25);
        let (mut scheduler, _rx) = scheduler(&handle);

        assert_eq!(scheduler.next_start_time(), 3.25);
        let buffer = scheduler.schedule(frame(240)).unwrap().unwrap();
        assert_eq!(buffer.start_at, 3.25);
    }

    #[test]
    fn test_zero_duration_frame_skipped() {
        let handle = MockSinkHandle::new();
        let (mut scheduler, _rx) = scheduler(&handle);

        scheduler.schedule(frame(2400)).unwrap();
        let before = scheduler.next_start_time();
        assert!(scheduler.schedule(frame(0)).unwrap().is_none());
        assert_eq!(scheduler.next_start_time(), before);
        assert_eq!(handle.history().len(), 1);
    }

    #[test]
    fn test_completion_removes_buffer() {
        let handle = MockSinkHandle::new();
        let (mut scheduler, mut rx) = scheduler(&handle);

        scheduler.schedule(frame(2400)).unwrap();
        scheduler.schedule(frame(2400)).unwrap();
        handle.set_time(0.15);

        let id = rx.try_recv().unwrap();
        assert!(scheduler.on_complete(id));
        assert!(!scheduler.on_complete(id));
        assert_eq!(scheduler.active_count(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_interrupt_stops_playing_and_pending() {
        let handle = MockSinkHandle::new();
        let (mut scheduler, mut rx) = scheduler(&handle);

        scheduler.schedule(frame(2400)).unwrap();
        scheduler.schedule(frame(2400)).unwrap();
        // first buffer is mid-playback, second is pending
        handle.set_time(0.05);

        assert_eq!(scheduler.interrupt(), 2);
        assert_eq!(scheduler.active_count(), 0);
        assert!(scheduler.next_start_time() <= handle.now());
        assert_eq!(handle.stopped(), vec![0, 1]);

        // stopped buffers never complete
        handle.set_time(10.0);
        assert!(rx.try_recv().is_err());

        let resumed = scheduler.schedule(frame(2400)).unwrap().unwrap();
        assert_eq!(resumed.start_at, 10.0);
    }

    #[test]
    fn test_shutdown_closes_sink_once() {
        let handle = MockSinkHandle::new();
        let (mut scheduler, _rx) = scheduler(&handle);
        scheduler.schedule(frame(2400)).unwrap();

        scheduler.shutdown();
        drop(scheduler);
        assert_eq!(handle.closes(), 1);
        assert!(handle.active().is_empty());
    }

    #[test]
    fn test_failed_sink_start() {
        let handle = MockSinkHandle::new();
        handle.fail_next_start("no speakers");
        assert!(PlaybackScheduler::start(Box::new(handle.sink())).is_err());
    }

    proptest! {
        #[test]
        fn prop_no_overlap(
            arrivals in prop::collection::vec((0u32..4800, 0.0f64..0.3), 1..40)
        ) {
            let handle = MockSinkHandle::new();
            let (mut scheduler, _rx) = scheduler(&handle);

            let mut placed: Vec<ScheduledBuffer> = Vec::new();
            for (samples, delay) in arrivals {
                handle.advance(delay);
                let now = handle.now();
                if let Some(buffer) = scheduler.schedule(frame(samples as usize)).unwrap() {
                    prop_assert!(buffer.start_at >= now);
                    placed.push(buffer);
                }
            }

            for pair in placed.windows(2) {
                prop_assert!(pair[1].start_at >= pair[0].start_at);
                prop_assert!(pair[1].start_at - pair[0].end() >= 0.0);
            }
        }
    }
}
