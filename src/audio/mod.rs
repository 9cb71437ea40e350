pub mod decode;
pub mod features;
pub mod mel;
pub mod resample;

/// Decoded audio: interleaved samples at the file's native rate.
#[derive(Clone, Debug)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

impl Waveform {
    #[cfg(test)]
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: 1,
            sample_rate,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    pub fn duration_secs(&self) -> f64 {
        self.num_frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels into one.
    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels <= 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks_exact(self.channels)
            .map(|frame| frame.iter().sum::<f32>() / self.channels as f32)
            .collect()
    }
}
