use super::{ArrowCombination, NUM_COMBINATIONS, NUM_LANES, NUM_STATES};
use crate::error::{Result, StepError};

/// Width of the binary and extended-binary vectors.
pub const ENCODED_WIDTH: usize = NUM_LANES * NUM_STATES;

/// One way of representing an arrow combination numerically.
///
/// Every scheme must be bijective over the combination space:
/// `decode(encode(x)) == x` for all `x`.
pub trait ArrowEncoding {
    type Encoded;

    const NAME: &'static str;

    fn encode(&self, arrows: &ArrowCombination) -> Self::Encoded;
    fn decode(&self, encoded: &Self::Encoded) -> Result<ArrowCombination>;
}

/// Single class id: the base-4 value of the arrow string, lane 0 most significant.
#[derive(Clone, Copy, Debug, Default)]
pub struct LabelEncoding;

impl ArrowEncoding for LabelEncoding {
    type Encoded = u16;

    const NAME: &'static str = "label";

    fn encode(&self, arrows: &ArrowCombination) -> u16 {
        arrows
            .lanes()
            .iter()
            .fold(0u16, |acc, &state| acc * NUM_STATES as u16 + state as u16)
    }

    fn decode(&self, encoded: &u16) -> Result<ArrowCombination> {
        let label = *encoded as usize;
        ArrowCombination::from_label(label).ok_or(StepError::LabelOutOfRange {
            label,
            limit: NUM_COMBINATIONS,
        })
    }
}

/// One-hot state per lane, lanes concatenated: bit `lane * NUM_STATES + state`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryEncoding;

impl ArrowEncoding for BinaryEncoding {
    type Encoded = [u8; ENCODED_WIDTH];

    const NAME: &'static str = "binary";

    fn encode(&self, arrows: &ArrowCombination) -> [u8; ENCODED_WIDTH] {
        let mut bits = [0u8; ENCODED_WIDTH];
        for (lane, &state) in arrows.lanes().iter().enumerate() {
            bits[lane * NUM_STATES + state as usize] = 1;
        }
        bits
    }

    fn decode(&self, encoded: &[u8; ENCODED_WIDTH]) -> Result<ArrowCombination> {
        let mut lanes = [0u8; NUM_LANES];
        for (lane, chunk) in encoded.chunks(NUM_STATES).enumerate() {
            lanes[lane] = single_hot(chunk)
                .ok_or_else(|| StepError::malformed(Self::NAME, format!("lane {} is not one-hot", lane)))?
                as u8;
        }
        ArrowCombination::new(lanes)
    }
}

/// Indicator over the whole combination space; the hot index equals the label code.
#[derive(Clone, Copy, Debug, Default)]
pub struct OneHotEncoding;

impl ArrowEncoding for OneHotEncoding {
    type Encoded = Vec<u8>;

    const NAME: &'static str = "one-hot";

    fn encode(&self, arrows: &ArrowCombination) -> Vec<u8> {
        let mut onehot = vec![0u8; NUM_COMBINATIONS];
        onehot[LabelEncoding.encode(arrows) as usize] = 1;
        onehot
    }

    fn decode(&self, encoded: &Vec<u8>) -> Result<ArrowCombination> {
        if encoded.len() != NUM_COMBINATIONS {
            return Err(StepError::malformed(
                Self::NAME,
                format!("expected {} entries, found {}", NUM_COMBINATIONS, encoded.len()),
            ));
        }
        let index = single_hot(encoded)
            .ok_or_else(|| StepError::malformed(Self::NAME, "vector is not one-hot"))?;
        LabelEncoding.decode(&(index as u16))
    }
}

/// State × lane indicator matrix: `matrix[state][lane] == 1` when the lane holds that state.
///
/// This is the per-step context layout the sequence model consumes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtendedBinaryEncoding;

pub type ExtendedBinary = [[u8; NUM_LANES]; NUM_STATES];

impl ArrowEncoding for ExtendedBinaryEncoding {
    type Encoded = ExtendedBinary;

    const NAME: &'static str = "extended-binary";

    fn encode(&self, arrows: &ArrowCombination) -> ExtendedBinary {
        let mut matrix = [[0u8; NUM_LANES]; NUM_STATES];
        for (lane, &state) in arrows.lanes().iter().enumerate() {
            matrix[state as usize][lane] = 1;
        }
        matrix
    }

    fn decode(&self, encoded: &ExtendedBinary) -> Result<ArrowCombination> {
        let mut lanes = [0u8; NUM_LANES];
        for (lane, slot) in lanes.iter_mut().enumerate() {
            let column: Vec<u8> = encoded.iter().map(|row| row[lane]).collect();
            *slot = single_hot(&column)
                .ok_or_else(|| StepError::malformed(Self::NAME, format!("lane {} is not one-hot", lane)))?
                as u8;
        }
        ArrowCombination::new(lanes)
    }
}

fn single_hot(values: &[u8]) -> Option<usize> {
    let mut hot = values.iter().enumerate().filter(|&(_, &v)| v != 0);
    match (hot.next(), hot.next()) {
        (Some((index, &1)), None) => Some(index),
        _ => None,
    }
}

/// Every encoded variant of one combination, produced together so they cannot drift apart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedArrows {
    pub arrows: ArrowCombination,
    pub label: u16,
    pub binary: [u8; ENCODED_WIDTH],
    pub onehot: Vec<u8>,
    pub extended: ExtendedBinary,
}

impl EncodedArrows {
    pub fn new(arrows: ArrowCombination) -> Self {
        Self {
            arrows,
            label: LabelEncoding.encode(&arrows),
            binary: BinaryEncoding.encode(&arrows),
            onehot: OneHotEncoding.encode(&arrows),
            extended: ExtendedBinaryEncoding.encode(&arrows),
        }
    }

    pub fn empty() -> Self {
        Self::new(ArrowCombination::EMPTY)
    }

    pub fn text(&self) -> String {
        self.arrows.to_string()
    }
}

/// Entry point for string ↔ code conversions of the arrow alphabet.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArrowVocabulary;

impl ArrowVocabulary {
    /// Parse a canonical arrow string and produce every encoded variant.
    pub fn encode(&self, text: &str) -> Result<EncodedArrows> {
        Ok(EncodedArrows::new(text.parse()?))
    }

    /// Map a label code back to its combination.
    pub fn decode(&self, label: usize) -> Result<ArrowCombination> {
        let label = u16::try_from(label).map_err(|_| StepError::LabelOutOfRange {
            label,
            limit: NUM_COMBINATIONS,
        })?;
        LabelEncoding.decode(&label)
    }

    pub fn num_classes(&self) -> usize {
        NUM_COMBINATIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_combination_is_the_default_in_every_scheme() {
        let empty = EncodedArrows::empty();
        assert_eq!(empty.label, 0);
        assert_eq!(empty.onehot[0], 1);
        assert_eq!(empty.onehot.iter().map(|&v| v as usize).sum::<usize>(), 1);
        for lane in 0..NUM_LANES {
            assert_eq!(empty.binary[lane * NUM_STATES], 1);
        }
        assert_eq!(empty.extended[0], [1; NUM_LANES]);
        assert_eq!(empty.text(), "0000");
    }

    #[test]
    fn label_is_base_four_with_first_lane_most_significant() {
        let vocab = ArrowVocabulary;
        assert_eq!(vocab.encode("0001").unwrap().label, 1);
        assert_eq!(vocab.encode("0010").unwrap().label, 4);
        assert_eq!(vocab.encode("1000").unwrap().label, 64);
        assert_eq!(vocab.encode("3333").unwrap().label, 255);
    }

    #[test]
    fn every_scheme_round_trips_the_whole_space() {
        for arrows in ArrowCombination::all() {
            let encoded = EncodedArrows::new(arrows);
            assert_eq!(LabelEncoding.decode(&encoded.label).unwrap(), arrows);
            assert_eq!(BinaryEncoding.decode(&encoded.binary).unwrap(), arrows);
            assert_eq!(OneHotEncoding.decode(&encoded.onehot).unwrap(), arrows);
            assert_eq!(ExtendedBinaryEncoding.decode(&encoded.extended).unwrap(), arrows);
            assert_eq!(encoded.text().parse::<ArrowCombination>().unwrap(), arrows);
            assert_eq!(ArrowVocabulary.decode(encoded.label as usize).unwrap(), arrows);
        }
    }

    #[test]
    fn binary_and_extended_describe_the_same_cells() {
        let encoded = ArrowVocabulary.encode("1203").unwrap();
        assert_eq!(encoded.binary[1], 1);
        assert_eq!(encoded.binary[1 * NUM_STATES + 2], 1);
        assert_eq!(encoded.binary[2 * NUM_STATES], 1);
        assert_eq!(encoded.binary[3 * NUM_STATES + 3], 1);
        assert_eq!(encoded.extended[1][0], 1);
        assert_eq!(encoded.extended[2][1], 1);
        assert_eq!(encoded.extended[0][2], 1);
        assert_eq!(encoded.extended[3][3], 1);
        assert_eq!(encoded.extended.iter().flatten().map(|&v| v as usize).sum::<usize>(), NUM_LANES);
    }

    #[test]
    fn rejects_malformed_vectors() {
        assert!(ArrowVocabulary.decode(NUM_COMBINATIONS).is_err());
        assert!(LabelEncoding.decode(&256).is_err());

        let mut binary = [0u8; ENCODED_WIDTH];
        assert!(BinaryEncoding.decode(&binary).is_err());
        binary = BinaryEncoding.encode(&ArrowCombination::EMPTY);
        binary[1] = 1;
        assert!(BinaryEncoding.decode(&binary).is_err());

        assert!(OneHotEncoding.decode(&vec![0u8; NUM_COMBINATIONS]).is_err());
        assert!(OneHotEncoding.decode(&vec![1u8; 4]).is_err());

        let mut extended = ExtendedBinaryEncoding.encode(&ArrowCombination::EMPTY);
        extended[2][0] = 1;
        assert!(ExtendedBinaryEncoding.decode(&extended).is_err());
    }

    #[test]
    fn vocabulary_reports_alphabet_errors() {
        assert!(matches!(
            ArrowVocabulary.encode("00000"),
            Err(StepError::Alphabet { .. })
        ));
        assert!(matches!(
            ArrowVocabulary.encode("0500"),
            Err(StepError::Alphabet { .. })
        ));
    }
}
