//! Error types for the duplex voice pipeline

use thiserror::Error;

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Microphone or speaker could not be acquired. Fatal to the connect attempt.
    #[error("Device acquisition failed: {0}")]
    DeviceAcquisition(AudioError),

    /// Channel to the agent failed to open or closed unexpectedly.
    #[error("Transport failure: {0}")]
    Transport(#[from] NetworkError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The connect attempt was overtaken by a `disconnect()`.
    #[error("Connect aborted by disconnect")]
    Aborted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Resampler error: {0}")]
    Resample(String),

    #[error("Device already in use")]
    AlreadyStarted,

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Frame codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload length is not a whole number of interleaved 16-bit frames.
    #[error("Malformed chunk: {len} bytes is not a multiple of {channels} channel(s) x 2")]
    MalformedChunk { len: usize, channels: u16 },

    #[error("Invalid payload encoding: {0}")]
    InvalidPayload(String),

    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u16),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Frame format {rate} Hz/{channels} ch does not match stream {expected_rate} Hz/{expected_channels} ch")]
    FormatMismatch {
        rate: u32,
        channels: u16,
        expected_rate: u32,
        expected_channels: u16,
    },
}

/// Transport errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out after {0} ms")]
    Timeout(u64),

    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Outbound queue is full; the chunk was not accepted.
    #[error("Outbound queue full")]
    Backpressure,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Reported by the channel itself: a socket error or an agent-side error
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Connection closed")]
    Closed,
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        AudioError::UnsupportedFormat(e.to_string())
    }
}

/// Result type alias for the pipeline
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors_carry_reason() {
        let err = Error::DeviceAcquisition(AudioError::DeviceNotFound("mic".into()));
        assert_eq!(err.to_string(), "Device acquisition failed: Device not found: mic");

        let err: Error = NetworkError::ConnectionFailed("refused".into()).into();
        assert_eq!(err.to_string(), "Transport failure: Connection failed: refused");
    }

    #[test]
    fn test_malformed_chunk_message() {
        let err = CodecError::MalformedChunk { len: 3, channels: 1 };
        assert!(err.to_string().contains("3 bytes"));
    }
}
