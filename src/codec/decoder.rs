//! PCM16 decoder
//!
//! Inverse of the encoder: base64 text → little-endian i16 → float frames.

use base64::{engine::general_purpose, Engine as _};

use crate::audio::buffer::AudioFrame;
use crate::constants::BYTES_PER_SAMPLE;
use crate::error::CodecError;
use crate::protocol::WireChunk;

/// Convert one wire sample back to float (`value / 32768`)
#[inline]
pub fn dequantize(value: i16) -> f32 {
    value as f32 / 32768.0
}

/// Decode a wire chunk into a frame.
///
/// Payloads that are not a whole number of interleaved sample frames are
/// rejected rather than truncated.
pub fn decode(chunk: &WireChunk) -> Result<AudioFrame, CodecError> {
    if chunk.channels == 0 {
        return Err(CodecError::UnsupportedChannels(chunk.channels));
    }

    let bytes = general_purpose::STANDARD
        .decode(chunk.payload.as_bytes())
        .map_err(|e| CodecError::InvalidPayload(e.to_string()))?;

    if bytes.len() % chunk.frame_bytes() != 0 {
        return Err(CodecError::MalformedChunk {
            len: bytes.len(),
            channels: chunk.channels,
        });
    }

    let samples = bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| dequantize(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();

    Ok(AudioFrame::new(samples, chunk.channels, chunk.sample_rate, 0))
}

/// Stream decoder for inbound agent audio
///
/// The stream format is fixed at construction; chunks in any other format
/// are rejected.
pub struct PcmDecoder {
    sample_rate: u32,
    channels: u16,
    sequence: u32,
    frames_decoded: u64,
    frames_rejected: u64,
    samples_produced: u64,
}

impl PcmDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        if !(1..=2).contains(&channels) {
            return Err(CodecError::UnsupportedChannels(channels));
        }
        Ok(Self {
            sample_rate,
            channels,
            sequence: 0,
            frames_decoded: 0,
            frames_rejected: 0,
            samples_produced: 0,
        })
    }

    /// Decode a chunk, numbering frames in arrival order
    pub fn decode(&mut self, chunk: &WireChunk) -> Result<AudioFrame, CodecError> {
        if chunk.sample_rate != self.sample_rate || chunk.channels != self.channels {
            self.frames_rejected += 1;
            return Err(CodecError::FormatMismatch {
                rate: chunk.sample_rate,
                channels: chunk.channels,
                expected_rate: self.sample_rate,
                expected_channels: self.channels,
            });
        }
        match decode(chunk) {
            Ok(mut frame) => {
                frame.sequence = self.sequence;
                self.sequence = self.sequence.wrapping_add(1);
                self.frames_decoded += 1;
                self.samples_produced += frame.samples.len() as u64;
                Ok(frame)
            }
            Err(e) => {
                self.frames_rejected += 1;
                Err(e)
            }
        }
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_rejected: self.frames_rejected,
            samples_produced: self.samples_produced,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_rejected: u64,
    pub samples_produced: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use proptest::prelude::*;

    /// Worst case of `x - round(x * 32767) / 32768` for |x| <= 1
    const QUANTIZATION_BOUND: f32 = 1.5 / 32768.0 + 1e-6;

    #[test]
    fn test_rejects_odd_byte_count() {
        // 3 bytes of mono PCM16
        let chunk = WireChunk::new(general_purpose::STANDARD.encode([1u8, 2, 3]), 24_000, 1);
        assert_eq!(
            decode(&chunk).unwrap_err(),
            CodecError::MalformedChunk { len: 3, channels: 1 }
        );
    }

    #[test]
    fn test_rejects_partial_stereo_frame() {
        // 6 bytes is three i16 samples, one and a half stereo frames
        let chunk = WireChunk::new(general_purpose::STANDARD.encode([0u8; 6]), 24_000, 2);
        assert!(matches!(decode(&chunk), Err(CodecError::MalformedChunk { len: 6, channels: 2 })));
    }

    #[test]
    fn test_rejects_bad_base64() {
        let chunk = WireChunk::new("not base64!".into(), 24_000, 1);
        assert!(matches!(decode(&chunk), Err(CodecError::InvalidPayload(_))));
    }

    #[test]
    fn test_empty_payload_is_empty_frame() {
        let frame = decode(&WireChunk::new(String::new(), 24_000, 1)).unwrap();
        assert!(frame.samples.is_empty());
        assert_eq!(frame.duration(), 0.0);
    }

    #[test]
    fn test_capture_scenario_three_frames() {
        let frames: Vec<Vec<f32>> = (0..3)
            .map(|n| (0..4096).map(|i| ((i + n) as f32 * 0.01).sin() * 0.8).collect())
            .collect();

        let chunks: Vec<WireChunk> = frames
            .iter()
            .map(|samples| encode(samples, 1, 16_000).unwrap())
            .collect();
        assert_eq!(chunks.len(), 3);

        for chunk in &chunks {
            let frame = decode(chunk).unwrap();
            assert_eq!(frame.samples.len(), 4096);
            assert_eq!(frame.sample_rate, 16_000);
        }
    }

    #[test]
    fn test_decoder_counts_rejections_and_sequences() {
        let mut decoder = PcmDecoder::new(24_000, 1).unwrap();
        let good = encode(&[0.5; 240], 1, 24_000).unwrap();
        let bad = WireChunk::new(general_purpose::STANDARD.encode([0u8; 5]), 24_000, 1);

        assert_eq!(decoder.decode(&good).unwrap().sequence, 0);
        assert!(decoder.decode(&bad).is_err());
        assert_eq!(decoder.decode(&good).unwrap().sequence, 1);

        let stats = decoder.stats();
        assert_eq!(stats.frames_decoded, 2);
        assert_eq!(stats.frames_rejected, 1);
        assert_eq!(stats.samples_produced, 480);
    }

    #[test]
    fn test_decoder_rejects_other_stream_format() {
        let mut decoder = PcmDecoder::new(24_000, 1).unwrap();
        let stereo_8k = encode(&[0.1; 1600], 2, 8_000).unwrap();

        assert_eq!(
            decoder.decode(&stereo_8k).unwrap_err(),
            CodecError::FormatMismatch {
                rate: 8_000,
                channels: 2,
                expected_rate: 24_000,
                expected_channels: 1,
            }
        );
        assert_eq!(decoder.stats().frames_rejected, 1);
        assert!(PcmDecoder::new(24_000, 0).is_err());
    }

    fn frames_strategy() -> impl Strategy<Value = (u16, Vec<f32>)> {
        (1u16..=2).prop_flat_map(|channels| {
            (0usize..512).prop_flat_map(move |frames| {
                (
                    Just(channels),
                    prop::collection::vec(-1.0f32..=1.0, frames * channels as usize),
                )
            })
        })
    }

    proptest! {
        #[test]
        fn prop_round_trip_within_quantization((channels, samples) in frames_strategy()) {
            let chunk = encode(&samples, channels, 16_000).unwrap();
            let frame = decode(&chunk).unwrap();

            prop_assert_eq!(frame.channels, channels);
            prop_assert_eq!(frame.samples.len(), samples.len());
            for (orig, back) in samples.iter().zip(&frame.samples) {
                prop_assert!((orig - back).abs() <= QUANTIZATION_BOUND, "{} -> {}", orig, back);
            }
        }

        #[test]
        fn prop_payload_bytes_are_reversible(samples in prop::collection::vec(-1.0f32..=1.0, 0..256)) {
            let chunk = encode(&samples, 1, 24_000).unwrap();
            let raw = general_purpose::STANDARD.decode(&chunk.payload).unwrap();
            prop_assert_eq!(raw.len(), samples.len() * 2);
            prop_assert_eq!(&raw[..], &crate::codec::encoder::to_pcm16(&samples)[..]);
        }
    }
}
