//! Per-song training example preparation: audio features plus aligned labels.

use anyhow::{Context, Result};
use ndarray::Array4;
use std::path::{Path, PathBuf};

use crate::audio::decode::{decode_audio, find_audio_file};
use crate::audio::features::SpectralFeatureExtractor;
use crate::chart::align::{FrameAlignedLabelSet, TemporalAligner};
use crate::chart::timing::NoteChart;
use crate::dataset::scaler::{apply_channel_scalers, ChannelScaler};

const TIMING_EXTENSION: &str = "txt";

/// A timing file and the audio it was charted against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SongJob {
    pub name: String,
    pub timing_path: PathBuf,
    pub audio_path: PathBuf,
}

#[derive(Debug)]
pub struct PreparedSong {
    pub name: String,
    pub features: Array4<f32>,
    /// `None` when the chart has no onsets for the requested difficulty
    pub labels: Option<FrameAlignedLabelSet>,
}

/// Pair every `<name>.txt` in `timing_dir` with `<name>.<audio ext>` in `audio_dir`, sorted by name.
pub fn pair_songs(audio_dir: &Path, timing_dir: &Path) -> Result<Vec<SongJob>> {
    let entries = std::fs::read_dir(timing_dir)
        .with_context(|| format!("Failed to read timing directory: {}", timing_dir.display()))?;

    let mut jobs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(TIMING_EXTENSION) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match find_audio_file(audio_dir, name) {
            Some(audio_path) => jobs.push(SongJob {
                name: name.to_string(),
                timing_path: path.clone(),
                audio_path,
            }),
            None => log::warn!("No audio for timing file {}", path.display()),
        }
    }
    jobs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(jobs)
}

/// Features for one song, standardized when `scalers` is given, plus the labels of `difficulty`.
///
/// Every difficulty of the chart is aligned, so a collision in any of them fails the song.
pub fn prepare_song(
    job: &SongJob,
    extractor: &SpectralFeatureExtractor,
    aligner: &TemporalAligner,
    difficulty: &str,
    scalers: Option<&[ChannelScaler]>,
) -> Result<PreparedSong> {
    let chart = NoteChart::read(&job.timing_path)?;
    let waveform = decode_audio(&job.audio_path)?;
    let mut features = extractor.extract(&waveform)?;
    let frame_count = features.dim().0;

    if let Some(scalers) = scalers {
        apply_channel_scalers(scalers, &mut features)?;
    }

    let mut aligned = aligner.align(&chart, frame_count)?;
    let labels = aligned.remove(difficulty);
    if labels.is_none() {
        log::debug!("{} has no '{}' chart", job.name, difficulty);
    }

    if let Some(ref labels) = labels {
        log::debug!(
            "{}: {} frames, {} onsets, {} collisions",
            job.name,
            frame_count,
            labels.onset_count(),
            labels.collisions
        );
    }

    Ok(PreparedSong {
        name: job.name.clone(),
        features,
        labels,
    })
}
