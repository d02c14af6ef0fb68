//! # Duplex Voice
//!
//! Real-time duplex voice streaming between a local microphone, a remote
//! conversational agent and the local speakers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          SessionController                                │
//! │                                                                          │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌──────────────┐  │
//! │  │ Microphone  │──▶│  Downmix +  │──▶│ Ring Buffer │──▶│  PCM16 +     │  │
//! │  │ (cpal cb)   │   │  Resample   │   │ (drop full) │   │  base64      │  │
//! │  └─────────────┘   └─────────────┘   └─────────────┘   └──────┬───────┘  │
//! │                                                              │          │
//! │                                                              ▼          │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │            Transport Session (network::websocket)                 │   │
//! │  │   out: audio chunks        in: audio / transcript / interrupted   │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! │                    │                          │                         │
//! │                    ▼                          ▼                         │
//! │  ┌─────────────────────────────┐   ┌─────────────────────────────┐      │
//! │  │ PCM16 decode                │   │ Transcript accumulator      │      │
//! │  └──────────────┬──────────────┘   └─────────────────────────────┘      │
//! │                 ▼                                                       │
//! │  ┌─────────────────────────────┐   ┌─────────────────────────────┐      │
//! │  │ Playback Scheduler          │──▶│ Playback Sink (sample clock) │      │
//! │  │ nextStartTime, active set   │◀──│ completion notifications     │      │
//! │  └─────────────────────────────┘   └─────────────────────────────┘      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All mutable session state is owned by one event-loop task per session;
//! capture, transport and playback feed it through channels.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};
pub use session::{SessionController, SessionEvent, SessionState, SessionStats};

/// Application-wide constants
pub mod constants {
    /// Outbound (microphone) sample rate on the wire
    pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

    /// Outbound channel count on the wire
    pub const CAPTURE_CHANNELS: u16 = 1;

    /// Samples per channel in each captured frame
    pub const CAPTURE_BLOCK_SIZE: usize = 4096;

    /// Captured frames held for the sender before new frames are dropped
    pub const CAPTURE_QUEUE_FRAMES: usize = 8;

    /// Inbound (agent speech) sample rate on the wire
    pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

    /// Inbound channel count on the wire
    pub const PLAYBACK_CHANNELS: u16 = 1;

    /// Encoded chunks queued for the socket writer
    pub const OUTBOUND_QUEUE_CHUNKS: usize = 8;

    /// Inbound transport events queued for the session loop
    pub const INBOUND_QUEUE_EVENTS: usize = 256;

    /// Bytes per quantized sample
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Default agent endpoint
    pub const DEFAULT_AGENT_URL: &str = "ws://127.0.0.1:8765/live";
}
