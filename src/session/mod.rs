//! Session subsystem: lifecycle, playback scheduling and UI-facing state

pub mod controller;
pub mod scheduler;
pub mod state;

pub use controller::SessionController;
pub use scheduler::{PlaybackScheduler, ScheduledBuffer};
pub use state::{SessionEvent, SessionState, SessionStats};
