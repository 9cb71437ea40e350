use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use std::io::Write;
use std::path::Path;

use super::context::{RingContext, TimingToken};
use crate::arrows::encoding::ArrowVocabulary;
use crate::arrows::ArrowCombination;
use crate::error::{Result, StepError};

/// Step model: context window and timing in, distribution over every combination out.
pub trait ArrowPredictor {
    fn predict(&mut self, context: &RingContext, timing: &TimingToken) -> anyhow::Result<Vec<f64>>;
}

/// Autoregressive decoding loop. Each step samples one combination and feeds it back as context.
#[derive(Clone, Copy, Debug)]
pub struct SequenceDecoder {
    lookback: usize,
    vocabulary: ArrowVocabulary,
}

impl SequenceDecoder {
    pub fn new(lookback: usize) -> Result<Self> {
        if lookback == 0 {
            return Err(StepError::Config("decoder lookback must be positive".into()));
        }
        Ok(Self {
            lookback,
            vocabulary: ArrowVocabulary,
        })
    }

    /// Exactly one combination per timestamp, in input order.
    ///
    /// A predictor failure abandons the rest of the sequence.
    pub fn decode<P, R>(&self, timestamps: &[f64], predictor: &mut P, rng: &mut R) -> Result<Vec<ArrowCombination>>
    where
        P: ArrowPredictor + ?Sized,
        R: Rng + ?Sized,
    {
        let tokens = TimingToken::sequence(timestamps)?;
        let mut context = RingContext::new(self.lookback);
        let mut decoded = Vec::with_capacity(tokens.len());

        for (step, token) in tokens.iter().enumerate() {
            let distribution = predictor
                .predict(&context, token)
                .map_err(|source| StepError::Predictor { step, source })?;
            let sampler = weighted_index(step, &distribution, self.vocabulary.num_classes())?;
            let arrows = self.vocabulary.decode(sampler.sample(rng))?;
            log::trace!("step {}: {}", step, arrows);

            context.push(&arrows);
            decoded.push(arrows);
        }

        Ok(decoded)
    }
}

fn weighted_index(step: usize, distribution: &[f64], num_classes: usize) -> Result<WeightedIndex<f64>> {
    let fail = |reason: String| Err(StepError::Distribution { step, reason });
    if distribution.len() != num_classes {
        return fail(format!(
            "expected {} probabilities, got {}",
            num_classes,
            distribution.len()
        ));
    }
    if let Some(p) = distribution.iter().find(|p| !p.is_finite() || **p < 0.0) {
        return fail(format!("probability {} is not a finite non-negative number", p));
    }
    if distribution.iter().sum::<f64>() <= 0.0 {
        return fail("probabilities sum to zero".into());
    }
    WeightedIndex::new(distribution).map_err(|e| StepError::Distribution {
        step,
        reason: e.to_string(),
    })
}

/// Newline-separated canonical strings.
pub fn write_arrows(path: &Path, arrows: &[ArrowCombination]) -> Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for combination in arrows {
        writeln!(file, "{}", combination)?;
    }
    file.flush()?;
    Ok(())
}
