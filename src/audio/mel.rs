//! Short-time magnitude spectra and HTK-style log-mel filterbanks.

use ndarray::{Array2, Array3, ArrayView1, Axis};
use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::error::{Result, StepError};

const MEL_BREAK_FREQUENCY_HERTZ: f64 = 700.0;
const MEL_HIGH_FREQUENCY_Q: f64 = 1127.0;

/// Added before the log so silent bins stay finite.
pub const LOG_OFFSET: f64 = f64::EPSILON;

/// Hann window that tiles with hop = len/2 (no repeated endpoint).
pub fn periodic_hann(window_length: usize) -> Vec<f64> {
    (0..window_length)
        .map(|i| {
            0.5 - 0.5 * (2.0 * std::f64::consts::PI / window_length as f64 * i as f64).cos()
        })
        .collect()
}

/// Number of complete windows of `window_length` that fit with the given hop.
pub fn num_frames(num_samples: usize, window_length: usize, hop_length: usize) -> usize {
    if num_samples < window_length || hop_length == 0 {
        return 0;
    }
    1 + (num_samples - window_length) / hop_length
}

pub fn hertz_to_mel(hertz: f64) -> f64 {
    MEL_HIGH_FREQUENCY_Q * (1.0 + hertz / MEL_BREAK_FREQUENCY_HERTZ).ln()
}

/// Magnitude of the real FFT of each Hann-windowed frame: `[frames, fft_length / 2 + 1]`.
///
/// Frames longer than the FFT are truncated, shorter ones zero-padded.
pub fn stft_magnitude(
    signal: &[f64],
    fft_length: usize,
    hop_length: usize,
    window_length: usize,
) -> Array2<f64> {
    let bins = fft_length / 2 + 1;
    let frames = num_frames(signal.len(), window_length, hop_length);
    let window = periodic_hann(window_length);
    let copy_len = window_length.min(fft_length);

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(fft_length);

    let rows: Vec<Vec<f64>> = (0..frames)
        .into_par_iter()
        .map(|frame| {
            let start = frame * hop_length;
            let mut buffer = vec![Complex::new(0.0, 0.0); fft_length];
            for (i, slot) in buffer.iter_mut().take(copy_len).enumerate() {
                *slot = Complex::new(signal[start + i] * window[i], 0.0);
            }
            fft.process(&mut buffer);
            buffer[..bins].iter().map(|c| c.norm()).collect()
        })
        .collect();

    let mut spectrogram = Array2::zeros((frames, bins));
    for (mut row, values) in spectrogram.axis_iter_mut(Axis(0)).zip(rows.iter()) {
        row.assign(&ArrayView1::from(values.as_slice()));
    }
    spectrogram
}

/// Triangular mel weights mapping `num_spectrogram_bins` linear bins onto `num_mel_bins` bands.
///
/// The DC bin never contributes.
pub fn mel_weight_matrix(
    num_mel_bins: usize,
    num_spectrogram_bins: usize,
    sample_rate: u32,
    lower_edge_hertz: f64,
    upper_edge_hertz: f64,
) -> Result<Array2<f64>> {
    let nyquist = sample_rate as f64 / 2.0;
    if lower_edge_hertz < 0.0 {
        return Err(StepError::Config(format!(
            "lower edge {} must be >= 0",
            lower_edge_hertz
        )));
    }
    if lower_edge_hertz >= upper_edge_hertz {
        return Err(StepError::Config(format!(
            "lower edge {} must be below upper edge {}",
            lower_edge_hertz, upper_edge_hertz
        )));
    }
    if upper_edge_hertz > nyquist {
        return Err(StepError::Config(format!(
            "upper edge {} exceeds Nyquist {}",
            upper_edge_hertz, nyquist
        )));
    }
    if num_spectrogram_bins < 2 {
        return Err(StepError::Config("need at least two spectrogram bins".into()));
    }

    let bin_mels: Vec<f64> = (0..num_spectrogram_bins)
        .map(|i| hertz_to_mel(nyquist * i as f64 / (num_spectrogram_bins - 1) as f64))
        .collect();

    let low_mel = hertz_to_mel(lower_edge_hertz);
    let high_mel = hertz_to_mel(upper_edge_hertz);
    let edge_count = num_mel_bins + 2;
    let band_edges: Vec<f64> = (0..edge_count)
        .map(|i| low_mel + (high_mel - low_mel) * i as f64 / (edge_count - 1) as f64)
        .collect();

    let mut weights = Array2::zeros((num_spectrogram_bins, num_mel_bins));
    for band in 0..num_mel_bins {
        let (lower, center, upper) = (band_edges[band], band_edges[band + 1], band_edges[band + 2]);
        for (bin, &mel) in bin_mels.iter().enumerate().skip(1) {
            let lower_slope = (mel - lower) / (center - lower);
            let upper_slope = (upper - mel) / (upper - center);
            weights[[bin, band]] = lower_slope.min(upper_slope).max(0.0);
        }
    }
    Ok(weights)
}

/// `ln(mel + LOG_OFFSET)` for every frame: `[frames, num_mel_bins]`.
pub fn log_mel_spectrogram(
    signal: &[f64],
    fft_length: usize,
    hop_length: usize,
    window_length: usize,
    mel_weights: &Array2<f64>,
) -> Array2<f64> {
    let spectrogram = stft_magnitude(signal, fft_length, hop_length, window_length);
    spectrogram
        .dot(mel_weights)
        .mapv_into(|energy| (energy + LOG_OFFSET).ln())
}

/// Slide a `lookback`-frame window with hop 1 over the time axis: `[n, lookback, bands]`.
pub fn stack_frames(spectrogram: &Array2<f64>, lookback: usize) -> Array3<f32> {
    let (time, bands) = spectrogram.dim();
    let count = num_frames(time, lookback, 1);
    let mut stacked = Array3::zeros((count, lookback, bands));
    for (start, mut example) in stacked.axis_iter_mut(Axis(0)).enumerate() {
        let window = spectrogram.slice(ndarray::s![start..start + lookback, ..]);
        example.assign(&window.mapv(|v| v as f32));
    }
    stacked
}
