use serde::{Deserialize, Serialize};
use std::path::Path;

use super::context::{RingContext, TimingToken};
use super::decoder::ArrowPredictor;
use crate::arrows::encoding::{ArrowEncoding, ExtendedBinaryEncoding, LabelEncoding};
use crate::arrows::NUM_COMBINATIONS;
use crate::dataset::store::DatasetStore;
use crate::error::{Result, StepError};

/// First-order Markov model over combination labels, fit from charted onsets.
///
/// `transitions[previous][next]` counts how often `next` followed `previous`.
/// Every sequence starts from the empty combination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArrowPrior {
    pub transitions: Vec<Vec<u64>>,
}

impl Default for ArrowPrior {
    fn default() -> Self {
        Self {
            transitions: vec![vec![0; NUM_COMBINATIONS]; NUM_COMBINATIONS],
        }
    }
}

impl ArrowPrior {
    /// Count transitions between consecutive onset labels of one song.
    pub fn observe(&mut self, labels: &[usize]) {
        let mut previous = 0usize;
        for &label in labels.iter().filter(|&&l| l < NUM_COMBINATIONS) {
            self.transitions[previous][label] += 1;
            previous = label;
        }
    }

    /// Walk the given songs; only frames flagged as onsets contribute.
    pub fn fit<S: DatasetStore>(store: &mut S, indexes: &[usize]) -> Result<Self> {
        let mut prior = Self::default();
        for &index in indexes {
            let range = store.song_range(index)?;
            let labels = store.labels(range)?;
            let onehot = store.onehot_arrows(range)?;
            let sequence: Vec<usize> = labels
                .iter()
                .zip(onehot.rows())
                .filter(|&(&label, _)| label > 0)
                .filter_map(|(_, row)| row.iter().position(|&bit| bit == 1))
                .collect();
            prior.observe(&sequence);
        }
        log::info!(
            "Fit arrow prior on {} songs ({} transitions)",
            indexes.len(),
            prior.total()
        );
        Ok(prior)
    }

    pub fn total(&self) -> u64 {
        self.transitions.iter().flatten().sum()
    }

    /// Add-one smoothed distribution of the label following `previous`.
    pub fn distribution(&self, previous: usize) -> Vec<f64> {
        let Some(row) = self.transitions.get(previous) else {
            return vec![1.0 / NUM_COMBINATIONS as f64; NUM_COMBINATIONS];
        };
        let total = row.iter().sum::<u64>() as f64 + NUM_COMBINATIONS as f64;
        row.iter().map(|&count| (count as f64 + 1.0) / total).collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let prior: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        if prior.transitions.len() != NUM_COMBINATIONS
            || prior.transitions.iter().any(|row| row.len() != NUM_COMBINATIONS)
        {
            return Err(StepError::Dataset(format!(
                "prior {} is not a {}x{} table",
                path.display(),
                NUM_COMBINATIONS,
                NUM_COMBINATIONS
            )));
        }
        Ok(prior)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}

impl ArrowPredictor for ArrowPrior {
    fn predict(&mut self, context: &RingContext, _timing: &TimingToken) -> anyhow::Result<Vec<f64>> {
        let previous = match context.latest() {
            Some(entry) => LabelEncoding.encode(&ExtendedBinaryEncoding.decode(entry)?) as usize,
            None => 0,
        };
        Ok(self.distribution(previous))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrows::encoding::ArrowVocabulary;
    use crate::arrows::ArrowCombination;
    use crate::dataset::store::{CorpusWriter, DatasetSource, FileCorpus};
    use crate::chart::align::TemporalAligner;
    use crate::chart::timing::NoteTimingEvent;
    use crate::config::CollisionPolicy;
    use ndarray::Array4;

    #[test]
    fn observe_counts_transitions_from_empty() {
        let mut prior = ArrowPrior::default();
        prior.observe(&[5, 5, 9]);
        assert_eq!(prior.transitions[0][5], 1);
        assert_eq!(prior.transitions[5][5], 1);
        assert_eq!(prior.transitions[5][9], 1);
        assert_eq!(prior.total(), 3);
    }

    #[test]
    fn distribution_is_smoothed_and_normalized() {
        let mut prior = ArrowPrior::default();
        prior.observe(&[7, 7, 7]);
        let distribution = prior.distribution(7);
        assert!((distribution.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(distribution[7] > distribution[0]);
        assert!(distribution.iter().all(|&p| p > 0.0));
        assert!((prior.distribution(3)[0] - 1.0 / 256.0).abs() < 1e-12);
    }

    #[test]
    fn predicts_from_the_latest_context_entry() {
        let mut prior = ArrowPrior::default();
        prior.observe(&[65, 65, 65, 65]);
        let mut context = RingContext::new(2);
        let token = TimingToken::sequence(&[0.0]).unwrap()[0];

        let from_empty = prior.predict(&context, &token).unwrap();
        assert_eq!(from_empty, prior.distribution(0));

        context.push(&"1001".parse::<ArrowCombination>().unwrap());
        let from_65 = prior.predict(&context, &token).unwrap();
        assert_eq!(from_65, prior.distribution(65));
    }

    #[test]
    fn fits_from_a_corpus_and_round_trips_json() {
        let dir = tempfile::tempdir().unwrap();
        let corpus_dir = dir.path().join("corpus");
        let events = [
            NoteTimingEvent { time_secs: 0.02, arrows: ArrowVocabulary.encode("1000").unwrap() },
            NoteTimingEvent { time_secs: 0.05, arrows: ArrowVocabulary.encode("0001").unwrap() },
        ];
        let labels = TemporalAligner::new(0.01, CollisionPolicy::LastWins)
            .align_events("hard", &events, 8)
            .unwrap();
        let mut writer = CorpusWriter::create(&corpus_dir, "hard", [1, 2, 1]).unwrap();
        writer.append_song("a", &Array4::zeros((8, 1, 2, 1)), Some(&labels)).unwrap();
        writer.append_song("b", &Array4::zeros((3, 1, 2, 1)), None).unwrap();
        writer.finish().unwrap();

        let mut store = FileCorpus::new(&corpus_dir).open().unwrap();
        let prior = ArrowPrior::fit(&mut store, &[0, 1]).unwrap();
        assert_eq!(prior.transitions[0][64], 1);
        assert_eq!(prior.transitions[64][1], 1);
        assert_eq!(prior.total(), 2);
        assert!(ArrowPrior::fit(&mut store, &[4]).is_err());

        let path = dir.path().join("prior.json");
        prior.save(&path).unwrap();
        assert_eq!(ArrowPrior::load(&path).unwrap(), prior);
    }

    #[test]
    fn missing_prior_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ArrowPrior::load(&dir.path().join("absent.json")),
            Err(StepError::Io(_))
        ));
    }
}
