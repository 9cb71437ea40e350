use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::StepError;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub alignment: AlignmentConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub generate: GenerateConfig,
}

/// Spectral front-end settings. Also fixes the label frame rate through `hop_length_secs`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FeatureConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Mel bins per frame
    #[serde(default = "default_num_freq_bands")]
    pub num_freq_bands: usize,
    /// Lookback frames stacked into each feature example
    #[serde(default = "default_num_time_bands")]
    pub num_time_bands: usize,
    #[serde(default = "default_window_length_secs")]
    pub window_length_secs: f64,
    #[serde(default = "default_hop_length_secs")]
    pub hop_length_secs: f64,
    #[serde(default = "default_min_freq")]
    pub min_freq: f64,
    #[serde(default = "default_max_freq")]
    pub max_freq: f64,
    /// More than one channel switches on multi-resolution FFTs
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_num_multi_channels")]
    pub num_multi_channels: usize,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Later onsets overwrite earlier ones on the same frame; collisions are counted
    #[default]
    LastWins,
    /// Any collision fails the song
    Reject,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AlignmentConfig {
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_validation_fraction")]
    pub validation_fraction: f64,
    /// Sample budget for the valid-index scan; zero or negative means unlimited
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub class_weights: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GenerateConfig {
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            num_freq_bands: default_num_freq_bands(),
            num_time_bands: default_num_time_bands(),
            window_length_secs: default_window_length_secs(),
            hop_length_secs: default_hop_length_secs(),
            min_freq: default_min_freq(),
            max_freq: default_max_freq(),
            num_channels: default_num_channels(),
            num_multi_channels: default_num_multi_channels(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            validation_fraction: default_validation_fraction(),
            limit: default_limit(),
            class_weights: false,
        }
    }
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            lookback: default_lookback(),
            seed: None,
        }
    }
}

impl FeatureConfig {
    pub fn is_multi_resolution(&self) -> bool {
        self.num_channels > 1
    }

    /// Number of channels in the produced feature tensor.
    pub fn output_channels(&self) -> usize {
        if self.is_multi_resolution() {
            self.num_multi_channels
        } else {
            1
        }
    }

    pub fn validate(&self) -> Result<(), StepError> {
        let fail = |msg: String| Err(StepError::Config(msg));
        if self.sample_rate == 0 {
            return fail("sample_rate must be positive".into());
        }
        if self.num_freq_bands == 0 || self.num_time_bands == 0 {
            return fail("num_freq_bands and num_time_bands must be positive".into());
        }
        if !(self.window_length_secs > 0.0) || !(self.hop_length_secs > 0.0) {
            return fail("window and hop lengths must be positive".into());
        }
        if (self.hop_length_secs * self.sample_rate as f64).round() < 1.0 {
            return fail("hop length is shorter than one sample".into());
        }
        if self.is_multi_resolution() && self.num_multi_channels == 0 {
            return fail("num_multi_channels must be positive".into());
        }
        let nyquist = self.sample_rate as f64 / 2.0;
        if self.min_freq < 0.0 {
            return fail(format!("min_freq {} must be >= 0", self.min_freq));
        }
        if self.min_freq >= self.max_freq {
            return fail(format!(
                "min_freq {} must be below max_freq {}",
                self.min_freq, self.max_freq
            ));
        }
        if self.max_freq > nyquist {
            return fail(format!(
                "max_freq {} exceeds the Nyquist frequency {}",
                self.max_freq, nyquist
            ));
        }
        Ok(())
    }
}

impl StatsConfig {
    pub fn sample_budget(&self) -> Option<usize> {
        (self.limit > 0).then_some(self.limit as usize)
    }
}

fn default_sample_rate() -> u32 { 16000 }
fn default_num_freq_bands() -> usize { 80 }
fn default_num_time_bands() -> usize { 15 }
fn default_window_length_secs() -> f64 { 0.025 }
fn default_hop_length_secs() -> f64 { 0.01 }
fn default_min_freq() -> f64 { 27.5 }
fn default_max_freq() -> f64 { 8000.0 }
fn default_num_channels() -> usize { 1 }
fn default_num_multi_channels() -> usize { 3 }
fn default_seed() -> u64 { 42 }
fn default_validation_fraction() -> f64 { 0.1 }
fn default_limit() -> i64 { -1 }
fn default_lookback() -> usize { 1 }

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.features.validate()?;
    Ok(config)
}

/// Explicit path first, then `stepgen.toml` in the working directory, then the user config dirs.
pub fn discover_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from("stepgen.toml");
    if local.exists() {
        return Some(local);
    }
    if let Some(home) = dirs::home_dir() {
        let xdg = home.join(".config").join("stepgen").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        let platform = config_dir.join("stepgen").join("config.toml");
        if platform.exists() {
            return Some(platform);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.features, FeatureConfig::default());
        assert_eq!(config.features.sample_rate, 16000);
        assert_eq!(config.alignment.collision_policy, CollisionPolicy::LastWins);
        assert_eq!(config.stats.seed, 42);
        assert_eq!(config.stats.sample_budget(), None);
        assert_eq!(config.generate.lookback, 1);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: Config = toml::from_str(
            r#"
            [features]
            sample_rate = 44100
            num_channels = 3

            [alignment]
            collision_policy = "reject"

            [stats]
            limit = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.features.sample_rate, 44100);
        assert_eq!(config.features.hop_length_secs, 0.01);
        assert!(config.features.is_multi_resolution());
        assert_eq!(config.features.output_channels(), 3);
        assert_eq!(config.alignment.collision_policy, CollisionPolicy::Reject);
        assert_eq!(config.stats.sample_budget(), Some(5000));
    }

    #[test]
    fn validation_rejects_bad_frequency_ranges() {
        let mut features = FeatureConfig::default();
        assert!(features.validate().is_ok());

        features.max_freq = 9000.0;
        assert!(features.validate().is_err());

        features.max_freq = 8000.0;
        features.min_freq = 8000.0;
        assert!(features.validate().is_err());

        features.min_freq = -1.0;
        assert!(features.validate().is_err());
    }

    #[test]
    fn validation_rejects_degenerate_sizes() {
        let features = FeatureConfig {
            hop_length_secs: 0.0,
            ..FeatureConfig::default()
        };
        assert!(features.validate().is_err());

        let features = FeatureConfig {
            num_freq_bands: 0,
            ..FeatureConfig::default()
        };
        assert!(features.validate().is_err());
    }
}
