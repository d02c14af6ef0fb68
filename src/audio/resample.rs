//! Channel mapping and sample-rate conversion
//!
//! Capture devices rarely run at the 16 kHz mono wire format and output
//! devices rarely run at 24 kHz, so both directions convert here using
//! rubato's polynomial resampler.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::AudioError;

/// Input frames fed to the streaming resampler per call
const STREAM_CHUNK_FRAMES: usize = 1024;

/// Average interleaved channels down to mono
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Duplicate mono samples across `channels` interleaved channels
pub fn upmix(mono: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return mono.to_vec();
    }
    let mut out = Vec::with_capacity(mono.len() * channels);
    for &sample in mono {
        out.extend(std::iter::repeat(sample).take(channels));
    }
    out
}

fn build(input_rate: u32, output_rate: u32, chunk: usize) -> Result<FastFixedIn<f32>, AudioError> {
    FastFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        1.0,
        PolynomialDegree::Cubic,
        chunk,
        1,
    )
    .map_err(|e| AudioError::Resample(e.to_string()))
}

/// Resample a complete mono buffer in one pass.
///
/// The output is padded or trimmed to exactly
/// `round(len * output_rate / input_rate)` samples so that durations are
/// preserved on the output clock.
pub fn resample(input: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>, AudioError> {
    if input_rate == output_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let expected =
        (input.len() as f64 * output_rate as f64 / input_rate as f64).round() as usize;
    let mut resampler = build(input_rate, output_rate, input.len())?;
    let mut output = resampler
        .process(&[input], None)
        .map_err(|e| AudioError::Resample(e.to_string()))?
        .into_iter()
        .next()
        .unwrap_or_default();

    output.resize(expected, 0.0);
    Ok(output)
}

/// Streaming mono resampler for the capture callback.
///
/// Buffers input until a full chunk is available; rates that already match
/// pass straight through.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self, AudioError> {
        let resampler = if input_rate == output_rate {
            None
        } else {
            Some(build(input_rate, output_rate, STREAM_CHUNK_FRAMES)?)
        };
        Ok(Self {
            resampler,
            pending: Vec::with_capacity(STREAM_CHUNK_FRAMES * 2),
        })
    }

    /// Feed mono input, appending whatever output is ready to `out`
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<(), AudioError> {
        let Some(resampler) = self.resampler.as_mut() else {
            out.extend_from_slice(input);
            return Ok(());
        };

        self.pending.extend_from_slice(input);
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let produced = resampler
                .process(&[&self.pending[..needed]], None)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            if let Some(channel) = produced.first() {
                out.extend_from_slice(channel);
            }
            self.pending.drain(..needed);
        }
        Ok(())
    }
}
