//! Microphone capture
//!
//! The cpal stream lives on its own thread for the lifetime of a session.
//! Its callback downmixes, resamples to the outbound rate, slices fixed-size
//! frames and hands them to a [`FrameSink`] without ever blocking.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Sample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{AudioFrame, FrameSink};
use crate::audio::device::get_input_device;
use crate::audio::resample::{downmix, upmix, StreamResampler};
use crate::config::CaptureConfig;
use crate::error::AudioError;

/// How long `start` waits for the device thread to report the stream is playing
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// A source of captured frames at a fixed rate and channel count
pub trait CaptureSource: Send {
    /// Begin delivering frames to `sink`
    fn start(&mut self, sink: FrameSink) -> Result<(), AudioError>;

    /// Stop delivering and release the device. Returns only once the device
    /// is released; safe to call repeatedly.
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Next asynchronous device error, if any
    fn check_errors(&self) -> Option<AudioError>;
}

/// Turns arbitrary device callbacks into fixed-size outbound frames
pub struct Framer {
    device_channels: u16,
    out_channels: u16,
    out_rate: u32,
    block_size: usize,
    resampler: StreamResampler,
    resampled: Vec<f32>,
    pending: Vec<f32>,
    sequence: u32,
}

impl Framer {
    pub fn new(
        device_rate: u32,
        device_channels: u16,
        config: &CaptureConfig,
    ) -> Result<Self, AudioError> {
        Ok(Self {
            device_channels,
            out_channels: config.channels,
            out_rate: config.sample_rate,
            block_size: config.block_size,
            resampler: StreamResampler::new(device_rate, config.sample_rate)?,
            resampled: Vec::new(),
            pending: Vec::with_capacity(config.block_size * config.channels as usize * 2),
            sequence: 0,
        })
    }

    /// Feed interleaved device samples; `emit` is called once per complete frame
    pub fn push(
        &mut self,
        data: &[f32],
        mut emit: impl FnMut(AudioFrame),
    ) -> Result<(), AudioError> {
        let mono = downmix(data, self.device_channels);
        self.resampled.clear();
        self.resampler.process(&mono, &mut self.resampled)?;
        self.pending
            .extend_from_slice(&upmix(&self.resampled, self.out_channels));

        let frame_len = self.block_size * self.out_channels as usize;
        while self.pending.len() >= frame_len {
            let samples: Vec<f32> = self.pending.drain(..frame_len).collect();
            emit(AudioFrame::new(
                samples,
                self.out_channels,
                self.out_rate,
                self.sequence,
            ));
            self.sequence = self.sequence.wrapping_add(1);
        }
        Ok(())
    }
}

/// Audio capture from a cpal input device
pub struct CpalCapture {
    /// Device name, `None` for the default input
    device_name: Option<String>,

    /// Device-native stream configuration
    stream_config: StreamConfig,

    sample_format: cpal::SampleFormat,

    /// Outbound format
    config: CaptureConfig,

    running: Arc<AtomicBool>,

    thread_handle: Option<JoinHandle<()>>,

    error_rx: Option<Receiver<AudioError>>,

    frames_delivered: Arc<AtomicU64>,
}

impl CpalCapture {
    /// Acquire the configured input device and query its native format
    pub fn new(config: &CaptureConfig) -> Result<Self, AudioError> {
        let device = get_input_device(config.device.as_deref())?;
        let default_config = device.default_input_config()?;

        tracing::info!(
            "Capture device {}: {} Hz, {} ch, {:?}",
            device.name,
            default_config.sample_rate().0,
            default_config.channels(),
            default_config.sample_format()
        );

        Ok(Self {
            device_name: config.device.clone(),
            sample_format: default_config.sample_format(),
            stream_config: default_config.config(),
            config: config.clone(),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            frames_delivered: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Frames handed to the sink since start
    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }
}

fn build_input_stream<T>(
    device: &cpal::Device,
    stream_config: &StreamConfig,
    mut framer: Framer,
    sink: FrameSink,
    delivered: Arc<AtomicU64>,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let callback_errors = error_tx.clone();
    let mut scratch: Vec<f32> = Vec::new();

    let stream = device.build_input_stream(
        stream_config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));

            let result = framer.push(&scratch, |frame| {
                delivered.fetch_add(1, Ordering::Relaxed);
                // A full queue drops the frame; the sink counts it
                let _ = sink.deliver(frame);
            });
            if let Err(e) = result {
                let _ = callback_errors.try_send(e);
            }
        },
        move |err| {
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )?;
    Ok(stream)
}

impl CaptureSource for CpalCapture {
    fn start(&mut self, sink: FrameSink) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyStarted);
        }

        let framer = Framer::new(
            self.stream_config.sample_rate.0,
            self.stream_config.channels,
            &self.config,
        )?;

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);
        self.frames_delivered.store(0, Ordering::SeqCst);

        let running = self.running.clone();
        let delivered = self.frames_delivered.clone();
        let device_name = self.device_name.clone();
        let stream_config = self.stream_config.clone();
        let sample_format = self.sample_format;

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || {
                let stream = get_input_device(device_name.as_deref()).and_then(|device| {
                    let device = device.into_inner();
                    match sample_format {
                        cpal::SampleFormat::F32 => build_input_stream::<f32>(
                            &device, &stream_config, framer, sink, delivered, error_tx,
                        ),
                        cpal::SampleFormat::I16 => build_input_stream::<i16>(
                            &device, &stream_config, framer, sink, delivered, error_tx,
                        ),
                        cpal::SampleFormat::U16 => build_input_stream::<u16>(
                            &device, &stream_config, framer, sink, delivered, error_tx,
                        ),
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

                // Keep thread alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, releasing the device
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;
        self.thread_handle = Some(handle);

        let outcome = ready_rx
            .recv_timeout(START_TIMEOUT)
            .unwrap_or_else(|_| Err(AudioError::StreamError("capture thread did not start".into())));
        if outcome.is_err() {
            self.stop();
        }
        outcome
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::debug!("Capture stopped after {} frames", self.frames_delivered());
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Default)]
struct MockCaptureState {
    sink: Mutex<Option<FrameSink>>,
    running: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    errors: Mutex<Vec<AudioError>>,
}

/// Test-side handle to every [`MockCapture`] created from it
#[derive(Clone, Default)]
pub struct MockCaptureHandle {
    state: Arc<MockCaptureState>,
}

impl MockCaptureHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a capture source bound to this handle
    pub fn source(&self) -> MockCapture {
        MockCapture {
            state: self.state.clone(),
        }
    }

    /// Deliver a frame as if the device produced it. Returns false when no
    /// capture is running or the frame was dropped.
    pub fn push(&self, frame: AudioFrame) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.state.sink.lock().as_ref() {
            Some(sink) => sink.deliver(frame),
            None => false,
        }
    }

    /// Report an asynchronous device error
    pub fn fail(&self, error: AudioError) {
        self.state.errors.lock().push(error);
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }
}

/// Hardware-free capture source driven through a [`MockCaptureHandle`]
pub struct MockCapture {
    state: Arc<MockCaptureState>,
}

impl CaptureSource for MockCapture {
    fn start(&mut self, sink: FrameSink) -> Result<(), AudioError> {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return Err(AudioError::AlreadyStarted);
        }
        *self.state.sink.lock() = Some(sink);
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        if self.state.running.swap(false, Ordering::SeqCst) {
            self.state.sink.lock().take();
            self.state.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    fn check_errors(&self) -> Option<AudioError> {
        self.state.errors.lock().pop()
    }
}

impl Drop for MockCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono_16k() -> CaptureConfig {
        CaptureConfig::default()
    }

    #[test]
    fn test_framer_slices_fixed_blocks() {
        let mut framer = Framer::new(16_000, 1, &mono_16k()).unwrap();
        let mut frames = Vec::new();

        // 3 blocks plus change, delivered in odd-sized callbacks
        let data = vec![0.1f32; 4096 * 3 + 100];
        for chunk in data.chunks(333) {
            framer.push(chunk, |f| frames.push(f)).unwrap();
        }

        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.samples.len(), 4096);
            assert_eq!(frame.sample_rate, 16_000);
            assert_eq!(frame.channels, 1);
            assert_eq!(frame.sequence, i as u32);
        }
    }

    #[test]
    fn test_framer_downmixes_stereo() {
        let mut framer = Framer::new(16_000, 2, &mono_16k()).unwrap();
        let mut frames = Vec::new();
        let stereo: Vec<f32> = (0..4096).flat_map(|_| [0.5f32, -0.1]).collect();

        framer.push(&stereo, |f| frames.push(f)).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].samples.iter().all(|s| (s - 0.2).abs() < 1e-6));
    }

    #[test]
    fn test_framer_resamples_device_rate() {
        let mut framer = Framer::new(48_000, 1, &mono_16k()).unwrap();
        let mut frames = Vec::new();
        for _ in 0..100 {
            framer.push(&[0.0f32; 480], |f| frames.push(f)).unwrap();
        }
        // 48000 device samples is one second, i.e. ~16000 outbound samples
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn test_mock_capture_delivers_until_stopped() {
        let handle = MockCaptureHandle::new();
        let mut capture = handle.source();
        let sink = FrameSink::new(4);

        assert!(!handle.push(AudioFrame::new(vec![0.0; 4], 1, 16_000, 0)));
        capture.start(sink.clone()).unwrap();
        assert!(handle.push(AudioFrame::new(vec![0.0; 4], 1, 16_000, 1)));
        assert_eq!(sink.buffer().len(), 1);

        capture.stop();
        capture.stop();
        assert_eq!(handle.stops(), 1);
        assert!(!handle.push(AudioFrame::new(vec![0.0; 4], 1, 16_000, 2)));
    }
}
