//! Conversions from external audio formats into pipeline chunks.
//!
//! Capture PCM arrives as 16-bit little-endian mono; synthesized speech and
//! uploaded clips arrive at arbitrary rates and channel counts and are mixed
//! down and resampled to the pipeline rate before slicing.

use crate::error::{RenderError, Result};
use crate::pipeline::messages::AudioChunk;
use std::io::Cursor;
use tracing::warn;

/// Bytes per 16-bit sample.
const BYTES_PER_SAMPLE: usize = 2;

/// Split raw 16-bit little-endian mono PCM into normalized speech chunks.
///
/// # Errors
///
/// Returns `RenderError::Config` if `bytes` is not a whole number of chunks.
pub fn pcm16_to_chunks(bytes: &[u8], chunk_samples: usize) -> Result<Vec<AudioChunk>> {
    let chunk_bytes = chunk_samples * BYTES_PER_SAMPLE;
    if chunk_bytes == 0 || bytes.len() % chunk_bytes != 0 {
        return Err(RenderError::Config(format!(
            "PCM body of {} bytes is not a multiple of {chunk_bytes} bytes",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(chunk_bytes)
        .map(|chunk| {
            let samples = chunk
                .chunks_exact(BYTES_PER_SAMPLE)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0)
                .collect();
            AudioChunk::speech(samples)
        })
        .collect())
}

/// Decode a WAV file into mono f32 samples at `target_rate`.
///
/// # Errors
///
/// Returns an error if the bytes are not a readable WAV stream.
pub fn decode_wav(bytes: &[u8], target_rate: u32) -> Result<Vec<f32>> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| RenderError::AssetLoad(format!("invalid WAV data: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| RenderError::AssetLoad(format!("failed to read WAV samples: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| RenderError::AssetLoad(format!("failed to read WAV samples: {e}")))?
        }
    };

    if spec.channels > 1 {
        warn!(
            "audio has {} channels, mixing down to mono",
            spec.channels
        );
    }
    let mono = to_mono(&interleaved, spec.channels);

    if spec.sample_rate != target_rate {
        warn!(
            "audio sample rate is {}Hz, resampling to {}Hz",
            spec.sample_rate, target_rate
        );
    }
    Ok(resample(&mono, spec.sample_rate, target_rate))
}

/// Decode a WAV file and slice it into pipeline chunks.
///
/// A trailing partial chunk is dropped.
///
/// # Errors
///
/// Returns an error if the bytes are not a readable WAV stream.
pub fn wav_to_chunks(bytes: &[u8], sample_rate: u32, chunk_samples: usize) -> Result<Vec<AudioChunk>> {
    let samples = decode_wav(bytes, sample_rate)?;
    Ok(samples
        .chunks_exact(chunk_samples)
        .map(|c| AudioChunk::speech(c.to_vec()))
        .collect())
}

/// Slice an utterance into chunks, zero-padding the final partial chunk.
pub fn slice_utterance(samples: &[f32], chunk_samples: usize) -> Vec<AudioChunk> {
    if chunk_samples == 0 {
        return Vec::new();
    }
    samples
        .chunks(chunk_samples)
        .map(|c| {
            let mut block = c.to_vec();
            block.resize(chunk_samples, 0.0);
            AudioChunk::speech(block)
        })
        .collect()
}

/// Convert normalized float samples to signed 16-bit PCM, clamping overs.
pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * 32_767.0) as i16)
        .collect()
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return data.to_vec();
    }
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
///
/// Speech energy sits below 8 kHz, so no anti-alias filter is applied when
/// going down to 16 kHz.
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}
