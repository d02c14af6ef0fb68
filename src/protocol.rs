//! Wire protocol between the client and the agent
//!
//! Every message is a JSON text frame tagged by `type`. Audio travels as
//! base64 text of little-endian 16-bit PCM.

use serde::{Deserialize, Serialize};

use crate::constants::BYTES_PER_SAMPLE;

/// One encoded unit of audio on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireChunk {
    /// base64 of interleaved little-endian i16 samples
    pub payload: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl WireChunk {
    pub fn new(payload: String, sample_rate: u32, channels: u16) -> Self {
        Self {
            payload,
            sample_rate,
            channels,
        }
    }

    /// Bytes making up one interleaved sample frame
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }
}

/// Client → agent messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message of a session, announcing the outbound format
    Setup {
        session_id: String,
        sample_rate: u32,
        channels: u16,
    },
    Audio(WireChunk),
}

/// Agent → client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Audio(WireChunk),
    Transcript { text: String },
    /// Barge-in: pending speech must be silenced
    Interrupted,
    TurnComplete,
    Error { message: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
