use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stepgen", about = "Dance chart training data preparation and arrow sequence generation")]
pub struct Cli {
    /// Config file (defaults to stepgen.toml, then the user config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Extract features and aligned labels for every charted song into a corpus
    Prepare {
        /// Directory of audio files (WAV, FLAC, MP3, OGG)
        #[arg(long)]
        audio_dir: PathBuf,

        /// Directory of `<name>.txt` timing files
        #[arg(long)]
        timing_dir: PathBuf,

        /// Corpus output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Difficulty whose onsets become the labels
        #[arg(long, default_value = "challenge")]
        difficulty: String,

        /// Standardize features with the training scalers of a `stats` report
        #[arg(long)]
        scalers: Option<PathBuf>,
    },

    /// Compute split, scalers and bias correction for a corpus
    Stats {
        #[arg(long)]
        corpus: PathBuf,

        /// JSON report path
        #[arg(short, long, default_value = "stats.json")]
        output: PathBuf,

        /// Stop scanning once this many samples are selected
        #[arg(long)]
        limit: Option<i64>,

        /// Split seed
        #[arg(long)]
        seed: Option<u64>,

        /// Also compute per-class weights
        #[arg(long)]
        class_weights: bool,
    },

    /// Fit the arrow prior on the training split of a corpus
    FitPrior {
        #[arg(long)]
        corpus: PathBuf,

        #[arg(short, long, default_value = "prior.json")]
        output: PathBuf,
    },

    /// Decode arrow sequences for onset lists
    Generate {
        /// Onset file (one timestamp in seconds per line) or a directory of them
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory for `<name>.arrows`
        #[arg(short, long)]
        output: PathBuf,

        /// Prior written by `fit-prior`
        #[arg(long)]
        prior: PathBuf,

        /// Context steps shown to the predictor
        #[arg(long)]
        lookback: Option<usize>,

        /// Sampling seed (random when omitted)
        #[arg(long)]
        seed: Option<u64>,
    },
}
