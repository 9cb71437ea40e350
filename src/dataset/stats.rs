use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::scaler::{fit_channel_scalers, ChannelScaler};
use super::store::{DatasetSource, DatasetStore};
use crate::arrows::NUM_COMBINATIONS;
use crate::config::StatsConfig;
use crate::error::{Result, StepError};

/// Corpus-level numbers computed once before training.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorpusStatistics {
    pub all_indexes: Vec<usize>,
    pub train_indexes: Vec<usize>,
    pub val_indexes: Vec<usize>,
    pub num_samples: usize,
    pub num_train_samples: usize,
    pub num_val_samples: usize,
    /// `ln(positive / negative)` over training onsets; absent when either count is zero
    pub init_bias_correction: Option<f64>,
    pub train_scalers: Vec<ChannelScaler>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_class_weights: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_class_weights: Option<Vec<f64>>,
}

impl CorpusStatistics {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetSplit {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Songs whose labels are all non-negative, in corpus order.
///
/// A song whose labels cannot be read is skipped like one without labels.
/// With a budget the scan stops right after the song whose frames push the
/// running total past it.
pub fn select_valid_indexes<S: DatasetStore>(store: &mut S, budget: Option<usize>) -> Result<Vec<usize>> {
    let ranges = store.song_ranges().to_vec();
    let mut valid = Vec::new();
    let mut total = 0usize;
    let mut skipped = 0usize;

    for (index, range) in ranges.into_iter().enumerate() {
        let labels = match store.labels(range) {
            Ok(labels) => labels,
            Err(e @ (StepError::Dataset(_) | StepError::Io(_))) => {
                log::warn!("Skipping song {} (unreadable labels: {})", index, e);
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        if labels.len() != range.len() || labels.iter().any(|&label| label < 0) {
            log::debug!("Skipping song {} (no usable labels)", index);
            skipped += 1;
            continue;
        }
        valid.push(index);
        total += range.len();
        if budget.is_some_and(|limit| total > limit) {
            log::info!("Sample budget reached after {} songs", valid.len());
            break;
        }
    }

    if skipped > 0 {
        log::warn!("Skipped {} song(s) with missing or malformed labels", skipped);
    }
    Ok(valid)
}

/// Seeded shuffle; the first `ceil(fraction * n)` indexes become validation.
pub fn split_indexes(valid: &[usize], validation_fraction: f64, seed: u64) -> DatasetSplit {
    let mut shuffled = valid.to_vec();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    shuffled.shuffle(&mut rng);

    let val_size = ((validation_fraction * shuffled.len() as f64).ceil().max(0.0) as usize)
        .min(shuffled.len());
    let train = shuffled.split_off(val_size);
    DatasetSplit {
        train,
        validation: shuffled,
    }
}

pub fn count_samples<S: DatasetStore>(store: &S, indexes: &[usize]) -> usize {
    let ranges = store.song_ranges();
    indexes
        .iter()
        .filter_map(|&index| ranges.get(index))
        .map(|range| range.len())
        .sum()
}

pub fn bias_from_counts(num_positive: usize, num_samples: usize) -> Option<f64> {
    let num_negative = num_samples.saturating_sub(num_positive);
    if num_positive == 0 || num_negative == 0 {
        return None;
    }
    Some((num_positive as f64 / num_negative as f64).ln())
}

pub fn init_bias_correction<S: DatasetStore>(
    store: &mut S,
    indexes: &[usize],
    num_samples: usize,
) -> Result<Option<f64>> {
    let mut num_positive = 0usize;
    for &index in indexes {
        let range = store.song_range(index)?;
        num_positive += store
            .labels(range)?
            .iter()
            .filter(|&&label| label > 0)
            .count();
    }
    let bias = bias_from_counts(num_positive, num_samples);
    if bias.is_none() {
        log::warn!(
            "Bias correction undefined ({} positive of {} samples)",
            num_positive,
            num_samples
        );
    }
    Ok(bias)
}

/// One scaler per channel; each song is fit on its own and merged into the total.
pub fn fit_train_scalers<S: DatasetStore>(store: &mut S, indexes: &[usize]) -> Result<Vec<ChannelScaler>> {
    let [_, freq, channels] = store.frame_shape();
    let mut scalers = vec![ChannelScaler::new(freq); channels];
    for &index in indexes {
        let range = store.song_range(index)?;
        let features = store.features(range)?;
        let mut song_scalers = vec![ChannelScaler::new(freq); channels];
        fit_channel_scalers(&mut song_scalers, &features)?;
        for (total, song) in scalers.iter_mut().zip(&song_scalers) {
            total.merge(song);
        }
    }
    Ok(scalers)
}

pub fn class_weights<S: DatasetStore>(store: &mut S, indexes: &[usize]) -> Result<Vec<f64>> {
    let mut counts = vec![0u64; NUM_COMBINATIONS];
    for &index in indexes {
        let range = store.song_range(index)?;
        let onehot = store.onehot_arrows(range)?;
        for row in onehot.rows() {
            for (class, &bit) in row.iter().enumerate() {
                counts[class] += bit as u64;
            }
        }
    }
    let total: u64 = counts.iter().sum();
    Ok(counts
        .iter()
        .map(|&count| {
            if count == 0 {
                0.0
            } else {
                (total as f64 / count as f64) / NUM_COMBINATIONS as f64
            }
        })
        .collect())
}

/// Scans a corpus once per quantity, holding at most one song in memory.
pub struct CorpusStatisticsEngine {
    config: StatsConfig,
}

impl CorpusStatisticsEngine {
    pub fn new(config: StatsConfig) -> Self {
        Self { config }
    }

    /// Indexes and split only, without the feature pass.
    pub fn split<D: DatasetSource>(&self, source: &D) -> Result<(D::Store, DatasetSplit)> {
        let mut store = source.open()?;
        let valid = select_valid_indexes(&mut store, self.config.sample_budget())?;
        let split = split_indexes(&valid, self.config.validation_fraction, self.config.seed);
        Ok((store, split))
    }

    pub fn compute<D: DatasetSource>(&self, source: &D) -> Result<CorpusStatistics> {
        let mut store = source.open()?;

        let all_indexes = select_valid_indexes(&mut store, self.config.sample_budget())?;
        let split = split_indexes(&all_indexes, self.config.validation_fraction, self.config.seed);

        let num_samples = count_samples(&store, &all_indexes);
        let num_train_samples = count_samples(&store, &split.train);
        let num_val_samples = count_samples(&store, &split.validation);
        log::info!(
            "{} songs ({} samples): {} train ({} samples), {} validation ({} samples)",
            all_indexes.len(),
            num_samples,
            split.train.len(),
            num_train_samples,
            split.validation.len(),
            num_val_samples
        );

        let init_bias_correction = init_bias_correction(&mut store, &split.train, num_train_samples)?;
        if let Some(bias) = init_bias_correction {
            log::info!("Initial bias correction: {:.6}", bias);
        }

        let train_scalers = fit_train_scalers(&mut store, &split.train)?;

        let (train_class_weights, all_class_weights) = if self.config.class_weights {
            (
                Some(class_weights(&mut store, &split.train)?),
                Some(class_weights(&mut store, &all_indexes)?),
            )
        } else {
            (None, None)
        };

        Ok(CorpusStatistics {
            all_indexes,
            train_indexes: split.train,
            val_indexes: split.validation,
            num_samples,
            num_train_samples,
            num_val_samples,
            init_bias_correction,
            train_scalers,
            train_class_weights,
            all_class_weights,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::store::SongRange;
    use ndarray::{Array2, Array4};
    use std::cell::Cell;
    use std::rc::Rc;

    struct MemorySong {
        labels: Vec<i8>,
        arrow: usize,
    }

    #[derive(Default)]
    struct Counters {
        opened: Cell<usize>,
        released: Cell<usize>,
    }

    struct MemoryCorpus {
        songs: Vec<MemorySong>,
        fail_features: bool,
        counters: Rc<Counters>,
    }

    struct MemoryStore {
        ranges: Vec<SongRange>,
        labels: Vec<i8>,
        arrows: Vec<usize>,
        fail_features: bool,
        counters: Rc<Counters>,
    }

    impl MemoryCorpus {
        fn new(songs: Vec<MemorySong>) -> Self {
            Self {
                songs,
                fail_features: false,
                counters: Rc::new(Counters::default()),
            }
        }
    }

    impl DatasetSource for MemoryCorpus {
        type Store = MemoryStore;

        fn open(&self) -> Result<MemoryStore> {
            self.counters.opened.set(self.counters.opened.get() + 1);
            let mut ranges = Vec::new();
            let mut labels = Vec::new();
            let mut arrows = Vec::new();
            for song in &self.songs {
                let start = labels.len();
                labels.extend_from_slice(&song.labels);
                arrows.extend(song.labels.iter().map(|&l| if l > 0 { song.arrow } else { 0 }));
                ranges.push(SongRange {
                    start,
                    end: labels.len(),
                });
            }
            Ok(MemoryStore {
                ranges,
                labels,
                arrows,
                fail_features: self.fail_features,
                counters: Rc::clone(&self.counters),
            })
        }
    }

    impl DatasetStore for MemoryStore {
        fn song_ranges(&self) -> &[SongRange] {
            &self.ranges
        }

        fn frame_shape(&self) -> [usize; 3] {
            [1, 2, 1]
        }

        fn labels(&mut self, range: SongRange) -> Result<Vec<i8>> {
            Ok(self.labels[range.start..range.end].to_vec())
        }

        fn features(&mut self, range: SongRange) -> Result<Array4<f32>> {
            if self.fail_features {
                return Err(StepError::Dataset("disk went away".into()));
            }
            Ok(Array4::from_shape_fn((range.len(), 1, 2, 1), |(n, _, f, _)| {
                (range.start + n) as f32 * (f as f32 + 1.0)
            }))
        }

        fn onehot_arrows(&mut self, range: SongRange) -> Result<Array2<u8>> {
            let mut onehot = Array2::zeros((range.len(), NUM_COMBINATIONS));
            for (row, &class) in self.arrows[range.start..range.end].iter().enumerate() {
                onehot[[row, class]] = 1;
            }
            Ok(onehot)
        }
    }

    impl Drop for MemoryStore {
        fn drop(&mut self) {
            self.counters.released.set(self.counters.released.get() + 1);
        }
    }

    fn song(frames: usize, positives: usize) -> MemorySong {
        let mut labels = vec![0i8; frames];
        for label in labels.iter_mut().take(positives) {
            *label = 1;
        }
        MemorySong { labels, arrow: 65 }
    }

    fn sentinel(frames: usize) -> MemorySong {
        MemorySong {
            labels: vec![-1; frames],
            arrow: 0,
        }
    }

    #[test]
    fn split_is_stable_and_disjoint() {
        let valid: Vec<usize> = (0..25).collect();
        let first = split_indexes(&valid, 0.1, 42);
        let second = split_indexes(&valid, 0.1, 42);
        assert_eq!(first, second);
        assert_eq!(first.validation.len(), 3);
        assert_eq!(first.train.len(), 22);

        let mut union: Vec<usize> = first.train.iter().chain(&first.validation).copied().collect();
        union.sort_unstable();
        assert_eq!(union, valid);

        assert_ne!(split_indexes(&valid, 0.1, 7), first);
    }

    #[test]
    fn split_of_nothing_is_empty() {
        let split = split_indexes(&[], 0.1, 42);
        assert!(split.train.is_empty() && split.validation.is_empty());
    }

    #[test]
    fn bias_is_log_odds() {
        let bias = bias_from_counts(10, 110).unwrap();
        assert!((bias - (10.0f64 / 100.0).ln()).abs() < 1e-12);
        assert_eq!(bias_from_counts(0, 50), None);
        assert_eq!(bias_from_counts(50, 50), None);
    }

    #[test]
    fn sentinel_songs_are_skipped() {
        let corpus = MemoryCorpus::new(vec![song(10, 2), sentinel(5), song(8, 1), song(4, 0)]);
        let mut store = corpus.open().unwrap();
        assert_eq!(select_valid_indexes(&mut store, None).unwrap(), vec![0, 2, 3]);
    }

    #[test]
    fn budget_includes_the_crossing_song() {
        let corpus = MemoryCorpus::new(vec![song(10, 1), song(10, 1), song(10, 1), song(10, 1)]);
        let mut store = corpus.open().unwrap();
        assert_eq!(select_valid_indexes(&mut store, Some(15)).unwrap(), vec![0, 1]);
        assert_eq!(select_valid_indexes(&mut store, Some(20)).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn compute_reports_consistent_statistics() {
        let songs = (0..10).map(|i| song(10 + i, 1 + i % 3)).chain([sentinel(7)]).collect();
        let corpus = MemoryCorpus::new(songs);
        let stats = CorpusStatisticsEngine::new(StatsConfig::default())
            .compute(&corpus)
            .unwrap();

        assert_eq!(stats.all_indexes, (0..10).collect::<Vec<_>>());
        assert_eq!(stats.val_indexes.len(), 1);
        assert_eq!(stats.train_indexes.len(), 9);
        assert_eq!(stats.num_samples, stats.num_train_samples + stats.num_val_samples);

        let positives: usize = stats.train_indexes.iter().map(|&i| 1 + i % 3).sum();
        let expected = (positives as f64 / (stats.num_train_samples - positives) as f64).ln();
        assert!((stats.init_bias_correction.unwrap() - expected).abs() < 1e-12);

        assert_eq!(stats.train_scalers.len(), 1);
        assert_eq!(stats.train_scalers[0].samples_seen as usize, stats.num_train_samples);
        assert!(stats.train_class_weights.is_none());
        assert!(stats.all_class_weights.is_none());

        assert_eq!(corpus.counters.opened.get(), 1);
        assert_eq!(corpus.counters.released.get(), 1);
    }

    #[test]
    fn class_weights_follow_inverse_frequency() {
        let corpus = MemoryCorpus::new(vec![song(4, 1), song(4, 1)]);
        let mut store = corpus.open().unwrap();
        let weights = class_weights(&mut store, &[0, 1]).unwrap();
        assert_eq!(weights.len(), NUM_COMBINATIONS);
        // 6 empty frames, 2 frames of class 65
        assert!((weights[0] - (8.0 / 6.0) / 256.0).abs() < 1e-12);
        assert!((weights[65] - (8.0 / 2.0) / 256.0).abs() < 1e-12);
        assert_eq!(weights[1], 0.0);
    }

    #[test]
    fn class_weights_cover_train_and_all_songs() {
        let corpus = MemoryCorpus::new((0..10).map(|i| song(10, 1 + i % 2)).collect());
        let config = StatsConfig {
            class_weights: true,
            ..StatsConfig::default()
        };
        let stats = CorpusStatisticsEngine::new(config).compute(&corpus).unwrap();

        let mut store = corpus.open().unwrap();
        let train = class_weights(&mut store, &stats.train_indexes).unwrap();
        let all = class_weights(&mut store, &stats.all_indexes).unwrap();
        assert_eq!(stats.train_class_weights.as_deref(), Some(train.as_slice()));
        assert_eq!(stats.all_class_weights.as_deref(), Some(all.as_slice()));
        // 15 positives in 100 frames
        assert!((all[65] - (100.0 / 15.0) / 256.0).abs() < 1e-12);
        assert!((all[0] - (100.0 / 85.0) / 256.0).abs() < 1e-12);
    }

    #[test]
    fn merged_scalers_match_a_single_pass() {
        let corpus = MemoryCorpus::new(vec![song(6, 1), song(9, 2), song(4, 0)]);
        let mut store = corpus.open().unwrap();
        let merged = fit_train_scalers(&mut store, &[0, 1, 2]).unwrap();

        let features = store.features(SongRange { start: 0, end: 19 }).unwrap();
        let mut single = vec![ChannelScaler::new(2)];
        fit_channel_scalers(&mut single, &features).unwrap();
        assert_eq!(merged[0].samples_seen, 19);
        for band in 0..2 {
            assert!((merged[0].mean[band] - single[0].mean[band]).abs() < 1e-9);
            assert!((merged[0].var[band] - single[0].var[band]).abs() < 1e-9);
        }
    }

    #[test]
    fn truncated_labels_skip_only_the_damaged_song() {
        use crate::chart::align::TemporalAligner;
        use crate::config::CollisionPolicy;
        use crate::dataset::store::{CorpusWriter, FileCorpus};

        let dir = tempfile::tempdir().unwrap();
        let labels = TemporalAligner::new(0.01, CollisionPolicy::LastWins)
            .align_events("hard", &[], 10)
            .unwrap();
        let mut writer = CorpusWriter::create(dir.path(), "hard", [1, 2, 1]).unwrap();
        for name in ["a", "b", "c"] {
            writer
                .append_song(name, &Array4::zeros((10, 1, 2, 1)), Some(&labels))
                .unwrap();
        }
        writer.finish().unwrap();

        std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("labels.i8"))
            .unwrap()
            .set_len(25)
            .unwrap();

        let stats = CorpusStatisticsEngine::new(StatsConfig::default())
            .compute(&FileCorpus::new(dir.path()))
            .unwrap();
        assert_eq!(stats.all_indexes, vec![0, 1]);
        assert_eq!(stats.num_samples, 20);
    }

    #[test]
    fn report_round_trips_through_json() {
        let corpus = MemoryCorpus::new(vec![song(6, 1), song(6, 2)]);
        let stats = CorpusStatisticsEngine::new(StatsConfig::default())
            .compute(&corpus)
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        std::fs::write(&path, serde_json::to_string(&stats).unwrap()).unwrap();

        let loaded = CorpusStatistics::load(&path).unwrap();
        assert_eq!(loaded.all_indexes, stats.all_indexes);
        assert_eq!(loaded.train_scalers, stats.train_scalers);
        assert!(loaded.all_class_weights.is_none());
    }

    #[test]
    fn store_is_released_when_a_pass_fails() {
        let mut corpus = MemoryCorpus::new(vec![song(6, 1), song(6, 2), song(6, 3)]);
        corpus.fail_features = true;
        let result = CorpusStatisticsEngine::new(StatsConfig::default()).compute(&corpus);
        assert!(matches!(result, Err(StepError::Dataset(_))));
        assert_eq!(corpus.counters.opened.get(), 1);
        assert_eq!(corpus.counters.released.get(), 1);
    }
}
