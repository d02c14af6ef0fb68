//! Clock-driven speaker output
//!
//! A [`PlaybackSink`] accepts discrete buffers with absolute start times on
//! its own clock and reports each buffer that finishes naturally. Buffers
//! that are stopped never report completion.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::buffer::AudioFrame;
use crate::audio::device::get_output_device;
use crate::audio::resample::{downmix, resample, upmix};
use crate::config::PlaybackConfig;
use crate::error::AudioError;

/// Identifies one scheduled buffer for cancellation and completion
pub type BufferId = u64;

/// Completion notifications from the sink's clock
pub type CompletionSender = mpsc::UnboundedSender<BufferId>;

const START_TIMEOUT: Duration = Duration::from_secs(5);

/// A clock-driven audio output
pub trait PlaybackSink: Send {
    /// Open the output and start its clock
    fn start(&mut self, completions: CompletionSender) -> Result<(), AudioError>;

    /// Current clock time in seconds
    fn now(&self) -> f64;

    /// Play `frame` beginning at clock time `start_at`
    fn schedule(&mut self, id: BufferId, frame: AudioFrame, start_at: f64) -> Result<(), AudioError>;

    /// Silence a buffer immediately, even mid-playback. No-op for unknown ids.
    fn stop(&mut self, id: BufferId);

    /// Stop everything and release the device
    fn close(&mut self);

    /// Next asynchronous device error, if any
    fn check_errors(&self) -> Option<AudioError> {
        None
    }
}

struct Scheduled {
    id: BufferId,
    /// Absolute start position in device frames
    start: u64,
    /// Interleaved at the device channel count
    samples: Vec<f32>,
}

impl Scheduled {
    fn end(&self, channels: usize) -> u64 {
        self.start + (self.samples.len() / channels) as u64
    }
}

/// Buffers placed on the device sample clock
struct Timeline {
    channels: usize,
    entries: Vec<Scheduled>,
    completions: Option<CompletionSender>,
}

impl Timeline {
    fn tail(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.end(self.channels))
            .max()
            .unwrap_or(0)
    }

    /// Rounding or a late arrival must not overlap what is already placed
    fn place(&mut self, id: BufferId, earliest: u64, samples: Vec<f32>) {
        let start = earliest.max(self.tail());
        self.entries.push(Scheduled { id, start, samples });
    }

    /// Mix every entry overlapping `[pos, pos + frames)` into `out`
    fn render(&self, pos: u64, out: &mut [f32]) {
        let frames = (out.len() / self.channels) as u64;
        out.fill(0.0);
        for entry in &self.entries {
            let end = entry.end(self.channels);
            let from = entry.start.max(pos);
            let to = end.min(pos + frames);
            if from >= to {
                continue;
            }
            let src = ((from - entry.start) as usize) * self.channels;
            let dst = ((from - pos) as usize) * self.channels;
            let len = ((to - from) as usize) * self.channels;
            out[dst..dst + len].copy_from_slice(&entry.samples[src..src + len]);
        }
    }

    /// Drop entries that ended at or before `pos`, reporting each
    fn retire(&mut self, pos: u64) {
        let channels = self.channels;
        let completions = &self.completions;
        self.entries.retain(|entry| {
            if entry.end(channels) <= pos {
                if let Some(tx) = completions {
                    let _ = tx.send(entry.id);
                }
                false
            } else {
                true
            }
        });
    }
}

struct PlaybackShared {
    timeline: Mutex<Timeline>,
    /// Device frames rendered since the stream started
    position: AtomicU64,
}

/// Speaker output on a cpal device
///
/// The device runs at its native rate; inbound frames are resampled and
/// spread across the device channels when scheduled.
pub struct CpalPlayback {
    device_name: Option<String>,
    stream_config: StreamConfig,
    sample_format: cpal::SampleFormat,
    shared: Arc<PlaybackShared>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
}

impl CpalPlayback {
    /// Acquire the configured output device and query its native format
    pub fn new(config: &PlaybackConfig) -> Result<Self, AudioError> {
        let device = get_output_device(config.device.as_deref())?;
        let default_config = device.default_output_config()?;
        let stream_config = default_config.config();

        tracing::info!(
            "Playback device {}: {} Hz, {} ch, {:?}",
            device.name,
            stream_config.sample_rate.0,
            stream_config.channels,
            default_config.sample_format()
        );

        Ok(Self {
            device_name: config.device.clone(),
            sample_format: default_config.sample_format(),
            shared: Arc::new(PlaybackShared {
                timeline: Mutex::new(Timeline {
                    channels: stream_config.channels.max(1) as usize,
                    entries: Vec::new(),
                    completions: None,
                }),
                position: AtomicU64::new(0),
            }),
            stream_config,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
        })
    }

    fn device_rate(&self) -> u32 {
        self.stream_config.sample_rate.0
    }
}

/// Convert a decoded frame to interleaved samples at the device format
fn to_device_layout(frame: &AudioFrame, rate: u32, channels: u16) -> Result<Vec<f32>, AudioError> {
    let mono = downmix(&frame.samples, frame.channels);
    let resampled = resample(&mono, frame.sample_rate, rate)?;
    Ok(upmix(&resampled, channels))
}

fn build_output_stream<T>(
    device: &cpal::Device,
    stream_config: &StreamConfig,
    shared: Arc<PlaybackShared>,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut mix: Vec<f32> = Vec::new();
    let stream = device.build_output_stream(
        stream_config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            mix.resize(data.len(), 0.0);
            let pos = shared.position.load(Ordering::Acquire);
            let mut timeline = shared.timeline.lock();
            let frames = (data.len() / timeline.channels) as u64;

            timeline.render(pos, &mut mix);
            for (out, &sample) in data.iter_mut().zip(&mix) {
                *out = <T as cpal::Sample>::from_sample::<f32>(sample);
            }

            shared.position.store(pos + frames, Ordering::Release);
            timeline.retire(pos + frames);
        },
        move |err| {
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )?;
    Ok(stream)
}

impl PlaybackSink for CpalPlayback {
    fn start(&mut self, completions: CompletionSender) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyStarted);
        }
        self.shared.timeline.lock().completions = Some(completions);

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let shared = self.shared.clone();
        let device_name = self.device_name.clone();
        let stream_config = self.stream_config.clone();
        let sample_format = self.sample_format;

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || {
                let stream = get_output_device(device_name.as_deref()).and_then(|device| {
                    let device = device.into_inner();
                    match sample_format {
                        cpal::SampleFormat::F32 => {
                            build_output_stream::<f32>(&device, &stream_config, shared, error_tx)
                        }
                        cpal::SampleFormat::I16 => {
                            build_output_stream::<i16>(&device, &stream_config, shared, error_tx)
                        }
                        cpal::SampleFormat::U16 => {
                            build_output_stream::<u16>(&device, &stream_config, shared, error_tx)
                        }
                        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
                    }
                });

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;
        self.thread_handle = Some(handle);

        let outcome = ready_rx
            .recv_timeout(START_TIMEOUT)
            .unwrap_or_else(|_| Err(AudioError::StreamError("playback thread did not start".into())));
        if outcome.is_err() {
            self.close();
        }
        outcome
    }

    fn now(&self) -> f64 {
        self.shared.position.load(Ordering::Acquire) as f64 / self.device_rate() as f64
    }

    fn schedule(&mut self, id: BufferId, frame: AudioFrame, start_at: f64) -> Result<(), AudioError> {
        let rate = self.device_rate();
        let samples = to_device_layout(&frame, rate, self.stream_config.channels.max(1))?;
        let requested = (start_at * rate as f64).round() as u64;
        let position = self.shared.position.load(Ordering::Acquire);

        self.shared
            .timeline
            .lock()
            .place(id, requested.max(position), samples);
        Ok(())
    }

    fn stop(&mut self, id: BufferId) {
        self.shared.timeline.lock().entries.retain(|e| e.id != id);
    }

    fn close(&mut self) {
        {
            let mut timeline = self.shared.timeline.lock();
            timeline.entries.clear();
            timeline.completions = None;
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.close();
    }
}

/// One buffer as seen by a [`MockSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct MockBuffer {
    pub id: BufferId,
    pub start_at: f64,
    pub duration: f64,
}

#[derive(Default)]
struct MockSinkState {
    clock: Mutex<f64>,
    active: Mutex<Vec<MockBuffer>>,
    history: Mutex<Vec<MockBuffer>>,
    stopped: Mutex<Vec<BufferId>>,
    completions: Mutex<Option<CompletionSender>>,
    starts: AtomicUsize,
    closes: AtomicUsize,
    fail_start: Mutex<Option<String>>,
}

/// Test-side handle to every [`MockSink`] created from it; owns the manual clock
#[derive(Clone, Default)]
pub struct MockSinkHandle {
    state: Arc<MockSinkState>,
}

impl MockSinkHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> MockSink {
        MockSink {
            state: self.state.clone(),
        }
    }

    /// Make the next `start` fail as if the output device were unavailable
    pub fn fail_next_start(&self, reason: &str) {
        *self.state.fail_start.lock() = Some(reason.to_string());
    }

    pub fn now(&self) -> f64 {
        *self.state.clock.lock()
    }

    /// Move the clock to `t`, completing every buffer that has ended by then
    pub fn set_time(&self, t: f64) {
        *self.state.clock.lock() = t;
        let completions = self.state.completions.lock().clone();
        self.state.active.lock().retain(|buffer| {
            if buffer.start_at + buffer.duration <= t {
                if let Some(tx) = &completions {
                    let _ = tx.send(buffer.id);
                }
                false
            } else {
                true
            }
        });
    }

    pub fn advance(&self, dt: f64) {
        let now = self.now();
        self.set_time(now + dt);
    }

    /// Buffers scheduled and neither finished nor stopped
    pub fn active(&self) -> Vec<MockBuffer> {
        self.state.active.lock().clone()
    }

    /// Every buffer ever scheduled, in scheduling order
    pub fn history(&self) -> Vec<MockBuffer> {
        self.state.history.lock().clone()
    }

    pub fn stopped(&self) -> Vec<BufferId> {
        self.state.stopped.lock().clone()
    }

    pub fn starts(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

/// Hardware-free sink with a manually driven clock
pub struct MockSink {
    state: Arc<MockSinkState>,
}

impl PlaybackSink for MockSink {
    fn start(&mut self, completions: CompletionSender) -> Result<(), AudioError> {
        if let Some(reason) = self.state.fail_start.lock().take() {
            return Err(AudioError::DeviceNotFound(reason));
        }
        *self.state.completions.lock() = Some(completions);
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn now(&self) -> f64 {
        *self.state.clock.lock()
    }

    fn schedule(&mut self, id: BufferId, frame: AudioFrame, start_at: f64) -> Result<(), AudioError> {
        let buffer = MockBuffer {
            id,
            start_at,
            duration: frame.duration(),
        };
        self.state.history.lock().push(buffer.clone());
        self.state.active.lock().push(buffer);
        Ok(())
    }

    fn stop(&mut self, id: BufferId) {
        let mut active = self.state.active.lock();
        let before = active.len();
        active.retain(|b| b.id != id);
        if active.len() != before {
            self.state.stopped.lock().push(id);
        }
    }

    fn close(&mut self) {
        self.state.active.lock().clear();
        if self.state.completions.lock().take().is_some() {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeline(channels: usize) -> Timeline {
        Timeline {
            channels,
            entries: Vec::new(),
            completions: None,
        }
    }

    #[test]
    fn test_render_places_buffers_on_clock() {
        let mut tl = timeline(1);
        tl.entries.push(Scheduled { id: 1, start: 2, samples: vec![1.0; 3] });
        tl.entries.push(Scheduled { id: 2, start: 5, samples: vec![0.5; 2] });

        let mut out = vec![9.0; 8];
        tl.render(0, &mut out);
        assert_eq!(out, vec![0.0, 0.0, 1.0, 1.0, 1.0, 0.5, 0.5, 0.0]);

        let mut out = vec![9.0; 2];
        tl.render(3, &mut out);
        assert_eq!(out, vec![1.0, 1.0]);
    }

    #[test]
    fn test_render_interleaved_channels() {
        let mut tl = timeline(2);
        tl.entries.push(Scheduled { id: 1, start: 1, samples: vec![0.1, 0.1, 0.2, 0.2] });

        let mut out = vec![0.0; 6];
        tl.render(0, &mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_retire_reports_finished_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tl = timeline(1);
        tl.completions = Some(tx);
        tl.entries.push(Scheduled { id: 1, start: 0, samples: vec![0.0; 4] });
        tl.entries.push(Scheduled { id: 2, start: 4, samples: vec![0.0; 4] });

        tl.retire(4);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(tl.tail(), 8);
    }

    #[test]
    fn test_place_queues_behind_tail() {
        let mut tl = timeline(2);
        tl.place(1, 10, vec![0.0; 8]);
        tl.place(2, 4, vec![0.0; 4]);
        tl.place(3, 30, vec![0.0; 2]);

        let starts: Vec<u64> = tl.entries.iter().map(|e| e.start).collect();
        assert_eq!(starts, vec![10, 14, 30]);
    }

    #[test]
    fn test_device_layout_spreads_mono_across_channels() {
        let frame = AudioFrame::new(vec![0.5; 240], 1, 24_000, 0);
        let samples = to_device_layout(&frame, 24_000, 2).unwrap();
        assert_eq!(samples.len(), 480);
        assert!(samples.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_mock_sink_completes_on_clock() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = MockSinkHandle::new();
        let mut sink = handle.sink();
        sink.start(tx).unwrap();

        sink.schedule(1, AudioFrame::new(vec![0.0; 2400], 1, 24_000, 0), 0.0).unwrap();
        sink.schedule(2, AudioFrame::new(vec![0.0; 2400], 1, 24_000, 1), 0.1).unwrap();

        handle.set_time(0.15);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());

        sink.stop(2);
        handle.set_time(1.0);
        assert!(rx.try_recv().is_err());
        assert_eq!(handle.stopped(), vec![2]);
    }
}
