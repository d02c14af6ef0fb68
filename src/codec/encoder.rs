//! PCM16 encoder
//!
//! Quantizes float samples to little-endian i16 and wraps them as base64.

use base64::{engine::general_purpose, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};

use crate::audio::buffer::AudioFrame;
use crate::constants::BYTES_PER_SAMPLE;
use crate::error::CodecError;
use crate::protocol::WireChunk;

/// Quantize one sample: `round(s * 32767)`, clamped to the i16 range.
#[inline]
pub fn quantize(sample: f32) -> i16 {
    (sample * 32767.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Serialize interleaved samples as little-endian i16 bytes
pub fn to_pcm16(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        buf.put_i16_le(quantize(sample));
    }
    buf.freeze()
}

/// Encode interleaved samples into a wire chunk.
///
/// `samples.len()` must be a whole number of frames for `channels`.
pub fn encode(samples: &[f32], channels: u16, sample_rate: u32) -> Result<WireChunk, CodecError> {
    if channels == 0 {
        return Err(CodecError::UnsupportedChannels(channels));
    }
    if samples.len() % channels as usize != 0 {
        return Err(CodecError::InvalidFrameSize(samples.len()));
    }

    let pcm = to_pcm16(samples);
    Ok(WireChunk::new(
        general_purpose::STANDARD.encode(&pcm),
        sample_rate,
        channels,
    ))
}

/// Stream encoder for one capture stream
///
/// The stream format is fixed at construction; frames in any other format
/// are rejected.
pub struct PcmEncoder {
    sample_rate: u32,
    channels: u16,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl PcmEncoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        if !(1..=2).contains(&channels) {
            return Err(CodecError::UnsupportedChannels(channels));
        }
        Ok(Self {
            sample_rate,
            channels,
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Encode a captured frame
    pub fn encode(&mut self, frame: &AudioFrame) -> Result<WireChunk, CodecError> {
        if frame.sample_rate != self.sample_rate || frame.channels != self.channels {
            return Err(CodecError::FormatMismatch {
                rate: frame.sample_rate,
                channels: frame.channels,
                expected_rate: self.sample_rate,
                expected_channels: self.channels,
            });
        }

        let chunk = encode(&frame.samples, self.channels, self.sample_rate)?;
        self.frames_encoded += 1;
        self.bytes_produced += (frame.samples.len() * BYTES_PER_SAMPLE) as u64;
        Ok(chunk)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone, Default)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    /// Raw PCM bytes, before base64
    pub bytes_produced: u64,
}
