use ndarray::{Array4, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StepError};

/// Per-frequency-band mean and population variance of one feature channel.
///
/// Fit incrementally; two scalers fit on disjoint data merge into the scaler of their union.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelScaler {
    pub samples_seen: u64,
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
}

impl ChannelScaler {
    pub fn new(width: usize) -> Self {
        Self {
            samples_seen: 0,
            mean: vec![0.0; width],
            var: vec![0.0; width],
        }
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    /// Fold a batch of rows into the running statistics.
    pub fn partial_fit<'a, I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = ArrayView1<'a, f32>>,
    {
        let width = self.width();
        let mut count = 0u64;
        let mut mean = vec![0.0; width];
        let mut m2 = vec![0.0; width];
        for row in rows {
            count += 1;
            for (i, &value) in row.iter().enumerate().take(width) {
                let value = value as f64;
                let delta = value - mean[i];
                mean[i] += delta / count as f64;
                m2[i] += delta * (value - mean[i]);
            }
        }
        self.combine(count, &mean, &m2);
    }

    pub fn merge(&mut self, other: &ChannelScaler) {
        let n = other.samples_seen as f64;
        let m2: Vec<f64> = other.var.iter().map(|v| v * n).collect();
        self.combine(other.samples_seen, &other.mean, &m2);
    }

    fn combine(&mut self, count: u64, mean: &[f64], m2: &[f64]) {
        if count == 0 {
            return;
        }
        let na = self.samples_seen as f64;
        let nb = count as f64;
        let total = na + nb;
        for i in 0..self.width() {
            let delta = mean[i] - self.mean[i];
            let combined_m2 = self.var[i] * na + m2[i] + delta * delta * na * nb / total;
            self.mean[i] += delta * nb / total;
            self.var[i] = combined_m2 / total;
        }
        self.samples_seen += count;
    }

    /// Standard deviation per band, with 1 standing in for zero variance.
    pub fn scale(&self) -> Vec<f64> {
        self.var
            .iter()
            .map(|&v| if v > 0.0 { v.sqrt() } else { 1.0 })
            .collect()
    }

    pub fn transform<'a, I>(&self, rows: I)
    where
        I: IntoIterator<Item = ndarray::ArrayViewMut1<'a, f32>>,
    {
        let scale = self.scale();
        for mut row in rows {
            for (i, value) in row.iter_mut().enumerate().take(self.width()) {
                *value = ((*value as f64 - self.mean[i]) / scale[i]) as f32;
            }
        }
    }
}

/// Fold a `[frame, time, freq, channel]` tensor into one scaler per channel.
///
/// Rows are `(frame, time band)` pairs and columns are frequency bands.
pub fn fit_channel_scalers(scalers: &mut [ChannelScaler], features: &Array4<f32>) -> Result<()> {
    check_channels(scalers, features)?;
    for (channel, scaler) in scalers.iter_mut().enumerate() {
        let view = features.index_axis(Axis(3), channel);
        scaler.partial_fit(view.lanes(Axis(2)));
    }
    Ok(())
}

/// Standardize a `[frame, time, freq, channel]` tensor in place.
pub fn apply_channel_scalers(scalers: &[ChannelScaler], features: &mut Array4<f32>) -> Result<()> {
    check_channels(scalers, features)?;
    for (channel, scaler) in scalers.iter().enumerate() {
        let mut view = features.index_axis_mut(Axis(3), channel);
        scaler.transform(view.lanes_mut(Axis(2)));
    }
    Ok(())
}

fn check_channels(scalers: &[ChannelScaler], features: &Array4<f32>) -> Result<()> {
    let (_, _, freq, channels) = features.dim();
    if scalers.len() != channels || scalers.iter().any(|s| s.width() != freq) {
        return Err(StepError::Dataset(format!(
            "{} scaler(s) do not fit a tensor with {} channel(s) of {} bands",
            scalers.len(),
            channels,
            freq
        )));
    }
    Ok(())
}
