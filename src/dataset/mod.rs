pub mod scaler;
pub mod stats;
pub mod store;

pub use stats::CorpusStatisticsEngine;
pub use store::{CorpusWriter, FileCorpus};
