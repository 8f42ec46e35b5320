//! Log-mel spectrogram extraction for lip-sync conditioning.
//!
//! Matches the front end the common wav2lip-family models are trained on:
//! pre-emphasis, centered STFT with a Hann window, Slaney mel filterbank,
//! dB conversion and symmetric normalization to \[-4, 4\].

use crate::config::FeatureConfig;
use crate::pipeline::messages::MelChunk;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

const PREEMPHASIS: f32 = 0.97;
const REF_LEVEL_DB: f32 = 20.0;
const MIN_LEVEL_DB: f32 = -100.0;
const MAX_ABS_VALUE: f32 = 4.0;

/// Reusable mel-spectrogram extractor.
pub struct MelExtractor {
    n_fft: usize,
    hop: usize,
    mel_window: usize,
    window: Vec<f32>,
    /// `mel_bins` rows of `n_fft / 2 + 1` weights.
    filterbank: Vec<Vec<f32>>,
    fft: Arc<dyn Fft<f32>>,
}

impl MelExtractor {
    pub fn new(config: &FeatureConfig, sample_rate: u32) -> Self {
        let n_fft = config.n_fft;
        let window = (0..n_fft)
            .map(|i| {
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / n_fft as f32).cos()
            })
            .collect();
        let filterbank = mel_filterbank(
            config.mel_bins,
            n_fft,
            sample_rate as f32,
            config.fmin,
            config.fmax,
        );
        let fft = FftPlanner::new().plan_fft_forward(n_fft);
        Self {
            n_fft,
            hop: config.hop,
            mel_window: config.mel_window,
            window,
            filterbank,
            fft,
        }
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Normalized log-mel spectrogram, one `Vec` of mel bands per frame.
    pub fn spectrogram(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        if samples.is_empty() {
            return Vec::new();
        }

        let emphasized = preemphasis(samples);
        let padded = reflect_pad(&emphasized, self.n_fft / 2);
        let frames = 1 + emphasized.len() / self.hop;
        let bins = self.n_fft / 2 + 1;

        let mut buffer = vec![Complex::new(0.0_f32, 0.0); self.n_fft];
        let mut magnitude = vec![0.0_f32; bins];
        let mut out = Vec::with_capacity(frames);

        for t in 0..frames {
            let start = t * self.hop;
            for (i, slot) in buffer.iter_mut().enumerate() {
                let sample = padded.get(start + i).copied().unwrap_or(0.0);
                *slot = Complex::new(sample * self.window[i], 0.0);
            }
            self.fft.process(&mut buffer);
            for (bin, mag) in magnitude.iter_mut().enumerate() {
                *mag = buffer[bin].norm();
            }

            let mel_frame = self
                .filterbank
                .iter()
                .map(|weights| {
                    let energy: f32 = weights
                        .iter()
                        .zip(&magnitude)
                        .map(|(w, m)| w * m)
                        .sum();
                    normalize(amp_to_db(energy))
                })
                .collect();
            out.push(mel_frame);
        }
        out
    }

    /// Cut a `mel_bins x mel_window` chunk centred on `center_frame`.
    ///
    /// Windows that would run past either edge are shifted inward; a
    /// spectrogram shorter than the window is edge-padded.
    pub fn window_at(&self, spectrogram: &[Vec<f32>], center_frame: usize) -> MelChunk {
        let rows = self.filterbank.len();
        let cols = self.mel_window;
        let mut chunk = MelChunk::zeros(rows, cols);
        if spectrogram.is_empty() {
            return chunk;
        }

        let last_start = spectrogram.len().saturating_sub(cols);
        let start = center_frame.saturating_sub(cols / 2).min(last_start);
        for col in 0..cols {
            let frame = &spectrogram[(start + col).min(spectrogram.len() - 1)];
            for (row, value) in frame.iter().enumerate() {
                chunk.data[row * cols + col] = *value;
            }
        }
        chunk
    }
}

fn preemphasis(samples: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len());
    let mut prev = 0.0;
    for &s in samples {
        out.push(s - PREEMPHASIS * prev);
        prev = s;
    }
    out
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let n = samples.len();
    let mut out = Vec::with_capacity(n + 2 * pad);
    for i in (1..=pad).rev() {
        out.push(samples[i.min(n - 1)]);
    }
    out.extend_from_slice(samples);
    for i in 0..pad {
        out.push(samples[n.saturating_sub(2 + i).min(n - 1)]);
    }
    out
}

fn amp_to_db(x: f32) -> f32 {
    20.0 * x.max(1e-5).log10() - REF_LEVEL_DB
}

fn normalize(db: f32) -> f32 {
    ((2.0 * MAX_ABS_VALUE) * ((db - MIN_LEVEL_DB) / -MIN_LEVEL_DB) - MAX_ABS_VALUE)
        .clamp(-MAX_ABS_VALUE, MAX_ABS_VALUE)
}

fn hz_to_mel(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = 6.4_f32.ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = 6.4_f32.ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}

/// Slaney-normalized triangular mel filterbank.
fn mel_filterbank(mel_bins: usize, n_fft: usize, sample_rate: f32, fmin: f32, fmax: f32) -> Vec<Vec<f32>> {
    let bins = n_fft / 2 + 1;
    let fft_freqs: Vec<f32> = (0..bins)
        .map(|i| i as f32 * sample_rate / n_fft as f32)
        .collect();

    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);
    let points: Vec<f32> = (0..mel_bins + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (mel_bins + 1) as f32))
        .collect();

    (0..mel_bins)
        .map(|m| {
            let (lo, mid, hi) = (points[m], points[m + 1], points[m + 2]);
            let enorm = 2.0 / (hi - lo);
            fft_freqs
                .iter()
                .map(|&f| {
                    let lower = (f - lo) / (mid - lo);
                    let upper = (hi - f) / (hi - mid);
                    lower.min(upper).max(0.0) * enorm
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn extractor() -> MelExtractor {
        MelExtractor::new(&FeatureConfig::default(), 16_000)
    }

    #[test]
    fn frame_count_follows_hop() {
        let mel = extractor().spectrogram(&vec![0.0; 16_000]);
        assert_eq!(mel.len(), 81);
        assert!(mel.iter().all(|f| f.len() == 80));
    }

    #[test]
    fn silence_normalizes_to_floor() {
        let mel = extractor().spectrogram(&vec![0.0; 3_200]);
        assert!(mel.iter().flatten().all(|v| (*v + MAX_ABS_VALUE).abs() < 1e-4));
    }

    #[test]
    fn tone_lights_up_matching_band() {
        let tone: Vec<f32> = (0..8_000)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 1_000.0 * i as f32 / 16_000.0).sin())
            .collect();
        let mel = extractor().spectrogram(&tone);
        let frame = &mel[mel.len() / 2];
        let loudest = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        let low_band = frame[0];
        assert!(frame[loudest] > low_band);
        assert!((20..60).contains(&loudest), "1 kHz landed in band {loudest}");
    }

    #[test]
    fn window_is_clamped_to_spectrogram_edges() {
        let ex = extractor();
        let spec: Vec<Vec<f32>> = (0..20).map(|t| vec![t as f32; 80]).collect();
        let head = ex.window_at(&spec, 0);
        assert_eq!(head.get(0, 0), 0.0);
        let tail = ex.window_at(&spec, 19);
        assert_eq!(tail.get(0, 15), 19.0);
        assert_eq!(tail.get(0, 0), 4.0);
    }

    #[test]
    fn short_spectrogram_is_edge_padded() {
        let ex = extractor();
        let spec: Vec<Vec<f32>> = (0..4).map(|t| vec![t as f32; 80]).collect();
        let chunk = ex.window_at(&spec, 2);
        assert_eq!(chunk.cols, 16);
        assert_eq!(chunk.get(3, 15), 3.0);
    }
}
