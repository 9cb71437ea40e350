//! Error types shared by the feature, label, statistics and decoding pipelines.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StepError {
    /// Arrow string has the wrong width or an unknown lane state
    #[error("invalid arrow combination '{arrows}': {reason}")]
    Alphabet { arrows: String, reason: String },

    /// Label code or one-hot index outside the combination space
    #[error("arrow label {label} is outside the combination space (0..{limit})")]
    LabelOutOfRange { label: usize, limit: usize },

    /// Binary, one-hot or extended-binary vector that does not describe one combination
    #[error("malformed {encoding} encoding: {reason}")]
    MalformedEncoding {
        encoding: &'static str,
        reason: String,
    },

    /// Timing file content that cannot be parsed
    #[error("timing file line {line}: {reason}")]
    Chart { line: usize, reason: String },

    #[error("difficulty '{0}' appears more than once in the timing file")]
    DuplicateDifficulty(String),

    /// Two onsets of one difficulty landed on the same frame under the reject policy
    #[error("onsets collide at frame {frame} in difficulty '{difficulty}'")]
    OnsetCollision { difficulty: String, frame: usize },

    #[error("invalid feature configuration: {0}")]
    Config(String),

    #[error("resampling failed: {0}")]
    Resample(String),

    #[error("dataset store: {0}")]
    Dataset(String),

    /// The external predictor failed; remaining steps are abandoned
    #[error("predictor failed at step {step}")]
    Predictor {
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid distribution at step {step}: {reason}")]
    Distribution { step: usize, reason: String },

    #[error("timestamps must be non-decreasing (index {0})")]
    UnsortedTimestamps(usize),

    #[error("timestamp at index {0} is not a finite number")]
    InvalidTimestamp(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StepError>;

impl StepError {
    pub(crate) fn alphabet(arrows: &str, reason: impl Into<String>) -> Self {
        StepError::Alphabet {
            arrows: arrows.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(encoding: &'static str, reason: impl Into<String>) -> Self {
        StepError::MalformedEncoding {
            encoding,
            reason: reason.into(),
        }
    }

    /// Validation errors abort a single song; everything else is a resource problem.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StepError::Alphabet { .. }
                | StepError::LabelOutOfRange { .. }
                | StepError::MalformedEncoding { .. }
                | StepError::Chart { .. }
                | StepError::DuplicateDifficulty(_)
                | StepError::OnsetCollision { .. }
        )
    }
}
