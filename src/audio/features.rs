use ndarray::{s, Array2, Array4};

use super::mel;
use super::resample::resample;
use super::Waveform;
use crate::config::FeatureConfig;
use crate::error::Result;

/// Below this the frequency resolution of the base FFT gets coarse.
const MIN_RELIABLE_FFT_LENGTH: usize = 512;

/// Sample-domain sizes derived from a [`FeatureConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FftLayout {
    pub window_length_samples: usize,
    pub hop_length_samples: usize,
    /// Smallest power of two covering the analysis window
    pub base_fft_length: usize,
    /// One FFT length per output channel
    pub fft_lengths: Vec<usize>,
}

impl FftLayout {
    pub fn new(config: &FeatureConfig) -> Self {
        let rate = config.sample_rate as f64;
        let window_length_samples = (rate * config.window_length_secs).round() as usize;
        let hop_length_samples = (rate * config.hop_length_secs).round() as usize;
        let base_fft_length = window_length_samples.max(1).next_power_of_two();
        let fft_lengths = if config.is_multi_resolution() {
            multi_resolution_lengths(base_fft_length, config.num_multi_channels)
        } else {
            vec![base_fft_length]
        };
        Self {
            window_length_samples,
            hop_length_samples,
            base_fft_length,
            fft_lengths,
        }
    }

    pub fn is_low_resolution(&self) -> bool {
        self.base_fft_length < MIN_RELIABLE_FFT_LENGTH
    }
}

/// Power-of-two FFT lengths straddling `base`: `channels / 2` below it, the rest at or above.
pub fn multi_resolution_lengths(base: usize, channels: usize) -> Vec<usize> {
    let exponent = base.trailing_zeros() as usize;
    let mut remaining = channels;
    let mut lengths = Vec::with_capacity(channels);
    for power in exponent.saturating_sub(channels / 2)..exponent {
        lengths.push(1usize << power);
        remaining -= 1;
    }
    for power in exponent..exponent + remaining {
        lengths.push(1usize << power);
    }
    lengths
}

/// Waveform → `[frame, time band, mel band, channel]` log-mel tensor.
///
/// Channels hold one spectral resolution each. Output depends only on the
/// waveform and the configuration.
pub struct SpectralFeatureExtractor {
    config: FeatureConfig,
    layout: FftLayout,
    mel_weights: Vec<Array2<f64>>,
}

impl SpectralFeatureExtractor {
    pub fn new(config: FeatureConfig) -> Result<Self> {
        config.validate()?;
        let layout = FftLayout::new(&config);
        if layout.is_low_resolution() {
            log::warn!(
                "Base FFT length {} is below {}; features may be low quality",
                layout.base_fft_length,
                MIN_RELIABLE_FFT_LENGTH
            );
        }

        let mel_weights = layout
            .fft_lengths
            .iter()
            .map(|&fft_length| {
                mel::mel_weight_matrix(
                    config.num_freq_bands,
                    fft_length / 2 + 1,
                    config.sample_rate,
                    config.min_freq,
                    config.max_freq,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "Feature layout: window={} hop={} fft={:?}",
            layout.window_length_samples,
            layout.hop_length_samples,
            layout.fft_lengths
        );

        Ok(Self {
            config,
            layout,
            mel_weights,
        })
    }

    pub fn layout(&self) -> &FftLayout {
        &self.layout
    }

    /// Per-example shape `[time bands, mel bands, channels]`.
    pub fn frame_shape(&self) -> [usize; 3] {
        [
            self.config.num_time_bands,
            self.config.num_freq_bands,
            self.config.output_channels(),
        ]
    }

    pub fn extract(&self, waveform: &Waveform) -> Result<Array4<f32>> {
        let mono = waveform.to_mono();
        let mono = resample(&mono, waveform.sample_rate, self.config.sample_rate)?;
        let signal: Vec<f64> = mono.iter().map(|&s| s as f64).collect();

        let [lookback, bands, channels] = self.frame_shape();
        let spectral_frames = mel::num_frames(
            signal.len(),
            self.layout.window_length_samples,
            self.layout.hop_length_samples,
        );
        let examples = mel::num_frames(spectral_frames, lookback, 1);
        let mut tensor = Array4::zeros((examples, lookback, bands, channels));

        for (channel, (&fft_length, weights)) in self
            .layout
            .fft_lengths
            .iter()
            .zip(&self.mel_weights)
            .enumerate()
        {
            let log_mel = mel::log_mel_spectrogram(
                &signal,
                fft_length,
                self.layout.hop_length_samples,
                self.layout.window_length_samples,
                weights,
            );
            let stacked = mel::stack_frames(&log_mel, lookback);
            tensor.slice_mut(s![.., .., .., channel]).assign(&stacked);
        }

        log::debug!(
            "Extracted {} feature frames ({} channel(s)) from {:.1}s of audio",
            examples,
            channels,
            waveform.duration_secs()
        );

        Ok(tensor)
    }
}
