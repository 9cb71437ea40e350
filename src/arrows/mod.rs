pub mod encoding;

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StepError};

/// Number of lanes (left, down, up, right).
pub const NUM_LANES: usize = 4;
/// Distinct states a lane can hold: off, tap, hold/roll head, hold/roll tail.
pub const NUM_STATES: usize = 4;
/// Size of the combination space (`NUM_STATES ^ NUM_LANES`).
pub const NUM_COMBINATIONS: usize = 256;

/// The joint lane states at one onset.
///
/// The canonical text form is one digit per lane, e.g. `"1002"`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrowCombination([u8; NUM_LANES]);

impl ArrowCombination {
    /// All lanes off.
    pub const EMPTY: ArrowCombination = ArrowCombination([0; NUM_LANES]);

    pub fn new(lanes: [u8; NUM_LANES]) -> Result<Self> {
        if let Some(state) = lanes.iter().find(|&&s| s as usize >= NUM_STATES) {
            return Err(StepError::alphabet(
                &lanes.iter().map(|s| s.to_string()).collect::<String>(),
                format!("lane state {} is outside 0..{}", state, NUM_STATES),
            ));
        }
        Ok(Self(lanes))
    }

    pub fn lanes(&self) -> &[u8; NUM_LANES] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Every combination in label order.
    #[cfg(test)]
    pub fn all() -> impl Iterator<Item = ArrowCombination> {
        (0..NUM_COMBINATIONS).filter_map(Self::from_label)
    }

    /// Inverse of the base-4 label code; `None` outside the combination space.
    pub(crate) fn from_label(label: usize) -> Option<Self> {
        if label >= NUM_COMBINATIONS {
            return None;
        }
        let mut lanes = [0u8; NUM_LANES];
        let mut rest = label;
        for lane in (0..NUM_LANES).rev() {
            lanes[lane] = (rest % NUM_STATES) as u8;
            rest /= NUM_STATES;
        }
        Some(Self(lanes))
    }
}

impl FromStr for ArrowCombination {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self> {
        let digits: Vec<char> = s.chars().collect();
        if digits.len() != NUM_LANES {
            return Err(StepError::alphabet(
                s,
                format!("expected {} lanes, found {}", NUM_LANES, digits.len()),
            ));
        }

        let mut lanes = [0u8; NUM_LANES];
        for (lane, c) in digits.into_iter().enumerate() {
            let state = c
                .to_digit(10)
                .filter(|&d| (d as usize) < NUM_STATES)
                .ok_or_else(|| {
                    StepError::alphabet(s, format!("unrecognized state '{}' in lane {}", c, lane))
                })?;
            lanes[lane] = state as u8;
        }
        Ok(Self(lanes))
    }
}

impl fmt::Display for ArrowCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for state in self.0 {
            write!(f, "{}", state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_strings() {
        let arrows: ArrowCombination = "1002".parse().unwrap();
        assert_eq!(arrows.lanes(), &[1, 0, 0, 2]);
        assert_eq!(arrows.to_string(), "1002");
    }

    #[test]
    fn rejects_wrong_width() {
        assert!("100".parse::<ArrowCombination>().is_err());
        assert!("10000".parse::<ArrowCombination>().is_err());
        assert!("".parse::<ArrowCombination>().is_err());
    }

    #[test]
    fn rejects_unknown_states() {
        let err = "1040".parse::<ArrowCombination>().unwrap_err();
        assert!(matches!(err, StepError::Alphabet { .. }));
        assert!("10M0".parse::<ArrowCombination>().is_err());
        assert!(ArrowCombination::new([0, 0, 7, 0]).is_err());
    }

    #[test]
    fn enumerates_the_whole_space_once() {
        let all: Vec<_> = ArrowCombination::all().collect();
        assert_eq!(all.len(), NUM_COMBINATIONS);
        assert_eq!(all[0], ArrowCombination::EMPTY);
        assert_eq!(all[NUM_COMBINATIONS - 1].to_string(), "3333");
        let mut sorted = all.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), NUM_COMBINATIONS);
    }
}
