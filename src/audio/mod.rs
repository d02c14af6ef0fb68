//! Audio subsystem module

pub mod backend;
pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;
pub mod resample;

pub use backend::{AudioBackend, CpalBackend, MockBackend};
pub use buffer::{AudioFrame, FrameSink, RingBuffer};
pub use capture::{CaptureSource, CpalCapture, MockCapture, MockCaptureHandle};
pub use device::{list_devices, AudioDevice, AudioDeviceInfo};
pub use playback::{BufferId, CpalPlayback, MockSink, MockSinkHandle, PlaybackSink};
