//! Per-session device acquisition
//!
//! The session controller acquires a fresh capture source and playback sink
//! for every session through an [`AudioBackend`], so the same controller
//! runs against real devices or against mocks.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::audio::capture::{CaptureSource, CpalCapture, MockCaptureHandle};
use crate::audio::playback::{CpalPlayback, MockSinkHandle, PlaybackSink};
use crate::config::{CaptureConfig, PlaybackConfig};
use crate::error::AudioError;

/// Opens the devices for one session
pub trait AudioBackend: Send + Sync {
    fn open_capture(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, AudioError>;

    fn open_playback(&self, config: &PlaybackConfig) -> Result<Box<dyn PlaybackSink>, AudioError>;
}

/// System devices through cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_capture(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, AudioError> {
        Ok(Box::new(CpalCapture::new(config)?))
    }

    fn open_playback(&self, config: &PlaybackConfig) -> Result<Box<dyn PlaybackSink>, AudioError> {
        Ok(Box::new(CpalPlayback::new(config)?))
    }
}

/// Mock devices shared with the test through their handles
#[derive(Default)]
pub struct MockBackend {
    pub capture: MockCaptureHandle,
    pub playback: MockSinkHandle,
    capture_opens: AtomicUsize,
    playback_opens: AtomicUsize,
    capture_failure: Mutex<Option<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next capture acquisition fail, e.g. a denied microphone
    pub fn deny_capture(&self, reason: &str) {
        *self.capture_failure.lock() = Some(reason.to_string());
    }

    pub fn capture_opens(&self) -> usize {
        self.capture_opens.load(Ordering::SeqCst)
    }

    pub fn playback_opens(&self) -> usize {
        self.playback_opens.load(Ordering::SeqCst)
    }
}

impl AudioBackend for MockBackend {
    fn open_capture(&self, _config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, AudioError> {
        self.capture_opens.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.capture_failure.lock().take() {
            return Err(AudioError::DeviceNotFound(reason));
        }
        Ok(Box::new(self.capture.source()))
    }

    fn open_playback(&self, _config: &PlaybackConfig) -> Result<Box<dyn PlaybackSink>, AudioError> {
        self.playback_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.playback.sink()))
    }
}
