use ndarray::{Array1, Array2, Array3, Axis};
use std::collections::BTreeMap;

use super::timing::{NoteChart, NoteTimingEvent};
use crate::arrows::encoding::{EncodedArrows, ENCODED_WIDTH};
use crate::arrows::{ArrowCombination, NUM_COMBINATIONS, NUM_LANES, NUM_STATES};
use crate::config::CollisionPolicy;
use crate::error::{Result, StepError};

/// Dense per-frame labels for one difficulty. Every array has one row per frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameAlignedLabelSet {
    /// 1 on onset frames, 0 elsewhere
    pub onsets: Array1<i8>,
    pub sample_weights: Array1<f32>,
    pub label_codes: Array1<u16>,
    /// `[frame, lane * state]`
    pub binary: Array2<u8>,
    /// `[frame, combination]`
    pub onehot: Array2<u8>,
    /// `[frame, state, lane]`
    pub extended: Array3<u8>,
    pub strings: Vec<String>,
    /// Onsets that landed on an already written frame
    pub collisions: usize,
}

impl FrameAlignedLabelSet {
    /// `frame_count` frames, all holding the empty combination with weight 1.
    pub fn empty(frame_count: usize) -> Self {
        let mut labels = Self {
            onsets: Array1::zeros(frame_count),
            sample_weights: Array1::ones(frame_count),
            label_codes: Array1::zeros(frame_count),
            binary: Array2::zeros((frame_count, ENCODED_WIDTH)),
            onehot: Array2::zeros((frame_count, NUM_COMBINATIONS)),
            extended: Array3::zeros((frame_count, NUM_STATES, NUM_LANES)),
            strings: vec![ArrowCombination::EMPTY.to_string(); frame_count],
            collisions: 0,
        };
        let empty = EncodedArrows::empty();
        for frame in 0..frame_count {
            labels.write_arrows(frame, &empty);
        }
        labels
    }

    pub fn len(&self) -> usize {
        self.onsets.len()
    }

    pub fn onset_count(&self) -> usize {
        self.onsets.iter().filter(|&&flag| flag == 1).count()
    }

    /// Frames flagged as onsets, ascending.
    #[cfg(test)]
    pub fn onset_frames(&self) -> Vec<usize> {
        self.onsets
            .iter()
            .enumerate()
            .filter(|&(_, &flag)| flag == 1)
            .map(|(frame, _)| frame)
            .collect()
    }

    fn write_arrows(&mut self, frame: usize, encoded: &EncodedArrows) {
        self.label_codes[frame] = encoded.label;
        self.binary
            .index_axis_mut(Axis(0), frame)
            .iter_mut()
            .zip(encoded.binary.iter())
            .for_each(|(slot, &bit)| *slot = bit);
        self.onehot
            .index_axis_mut(Axis(0), frame)
            .iter_mut()
            .zip(encoded.onehot.iter())
            .for_each(|(slot, &bit)| *slot = bit);
        let mut extended = self.extended.index_axis_mut(Axis(0), frame);
        for (state, row) in encoded.extended.iter().enumerate() {
            for (lane, &bit) in row.iter().enumerate() {
                extended[[state, lane]] = bit;
            }
        }
        self.strings[frame] = encoded.text();
    }
}

/// Scatters sparse onsets onto the spectral frame grid.
#[derive(Clone, Copy, Debug)]
pub struct TemporalAligner {
    hop_length_secs: f64,
    policy: CollisionPolicy,
}

impl TemporalAligner {
    pub fn new(hop_length_secs: f64, policy: CollisionPolicy) -> Self {
        Self {
            hop_length_secs,
            policy,
        }
    }

    /// Nearest frame to `time_secs` (ties to even); `None` before the first frame.
    pub fn onset_frame(&self, time_secs: f64) -> Option<usize> {
        let frame = (time_secs / self.hop_length_secs).round_ties_even();
        (frame >= 0.0 && frame.is_finite()).then_some(frame as usize)
    }

    pub fn align_events(
        &self,
        difficulty: &str,
        events: &[NoteTimingEvent],
        frame_count: usize,
    ) -> Result<FrameAlignedLabelSet> {
        let mut labels = FrameAlignedLabelSet::empty(frame_count);
        let mut dropped = 0usize;

        for event in events {
            let Some(frame) = self.onset_frame(event.time_secs).filter(|&f| f < frame_count) else {
                dropped += 1;
                continue;
            };

            if labels.onsets[frame] == 1 {
                match self.policy {
                    CollisionPolicy::Reject => {
                        return Err(StepError::OnsetCollision {
                            difficulty: difficulty.to_string(),
                            frame,
                        });
                    }
                    CollisionPolicy::LastWins => {
                        log::warn!(
                            "[{}] onset at {:.3}s overwrites frame {} ({} -> {})",
                            difficulty,
                            event.time_secs,
                            frame,
                            labels.strings[frame],
                            event.arrows.text()
                        );
                        labels.collisions += 1;
                    }
                }
            }

            labels.onsets[frame] = 1;
            labels.write_arrows(frame, &event.arrows);
        }

        if dropped > 0 {
            log::debug!(
                "[{}] dropped {} onset(s) outside {} frames",
                difficulty,
                dropped,
                frame_count
            );
        }

        Ok(labels)
    }

    /// Align every difficulty of a chart against the song's frame count.
    pub fn align(
        &self,
        chart: &NoteChart,
        frame_count: usize,
    ) -> Result<BTreeMap<String, FrameAlignedLabelSet>> {
        chart
            .difficulties
            .iter()
            .map(|(difficulty, events)| {
                self.align_events(difficulty, events, frame_count)
                    .map(|labels| (difficulty.clone(), labels))
            })
            .collect()
    }
}
