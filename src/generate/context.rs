use std::collections::VecDeque;

use crate::arrows::encoding::{ArrowEncoding, ExtendedBinary, ExtendedBinaryEncoding};
use crate::arrows::ArrowCombination;
use crate::error::{Result, StepError};

/// The most recent `lookback` extended-binary matrices, oldest first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingContext {
    entries: VecDeque<ExtendedBinary>,
}

impl RingContext {
    /// `lookback` copies of the empty combination.
    pub fn new(lookback: usize) -> Self {
        let empty = ExtendedBinaryEncoding.encode(&ArrowCombination::EMPTY);
        Self {
            entries: std::iter::repeat(empty).take(lookback).collect(),
        }
    }

    /// Drop the oldest entry and append `arrows` at the tail.
    pub fn push(&mut self, arrows: &ArrowCombination) {
        if self.entries.is_empty() {
            return;
        }
        self.entries.pop_front();
        self.entries.push_back(ExtendedBinaryEncoding.encode(arrows));
    }

    pub fn latest(&self) -> Option<&ExtendedBinary> {
        self.entries.back()
    }

    #[cfg(test)]
    pub fn decoded(&self) -> Result<Vec<ArrowCombination>> {
        self.entries
            .iter()
            .map(|entry| ExtendedBinaryEncoding.decode(entry))
            .collect()
    }
}

/// Timing features of one decoding step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimingToken {
    pub is_first: bool,
    /// Seconds since the previous onset, 0 at the first step
    pub gap_prev: f64,
    /// Seconds until the next onset, 0 at the last step
    pub gap_next: f64,
}

impl TimingToken {
    /// One token per timestamp. Timestamps must be finite and non-decreasing.
    pub fn sequence(timestamps: &[f64]) -> Result<Vec<TimingToken>> {
        if let Some(index) = timestamps.iter().position(|t| !t.is_finite()) {
            return Err(StepError::InvalidTimestamp(index));
        }
        if let Some(index) = timestamps.windows(2).position(|pair| pair[1] < pair[0]) {
            return Err(StepError::UnsortedTimestamps(index + 1));
        }

        let last = timestamps.len().saturating_sub(1);
        Ok(timestamps
            .iter()
            .enumerate()
            .map(|(i, &t)| TimingToken {
                is_first: i == 0,
                gap_prev: if i == 0 { 0.0 } else { t - timestamps[i - 1] },
                gap_next: if i == last { 0.0 } else { timestamps[i + 1] - t },
            })
            .collect())
    }
}
