pub mod context;
pub mod decoder;
pub mod prior;

pub use decoder::{write_arrows, SequenceDecoder};
pub use prior::ArrowPrior;
