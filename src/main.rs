mod arrows;
mod audio;
mod chart;
mod cli;
mod config;
mod dataset;
mod error;
mod generate;
mod prepare;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::path::{Path, PathBuf};

use audio::features::SpectralFeatureExtractor;
use chart::align::TemporalAligner;
use chart::timing::parse_onset_times;
use cli::{Cli, Command};
use config::Config;
use dataset::scaler::ChannelScaler;
use dataset::stats::CorpusStatistics;
use dataset::{CorpusStatisticsEngine, CorpusWriter, FileCorpus};
use error::StepError;
use generate::{write_arrows, ArrowPrior, SequenceDecoder};
use prepare::{pair_songs, prepare_song};

const ONSET_EXTENSION: &str = "txt";
const ARROWS_EXTENSION: &str = "arrows";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let config = match config::discover_config(cli.config.as_deref()) {
        Some(path) => {
            let config = config::load_config(&path)?;
            log::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::default(),
    };

    match cli.command {
        Command::Prepare {
            audio_dir,
            timing_dir,
            output,
            difficulty,
            scalers,
        } => {
            let scalers = scalers
                .map(|path| {
                    CorpusStatistics::load(&path)
                        .map(|stats| stats.train_scalers)
                        .with_context(|| format!("Failed to load scalers from {}", path.display()))
                })
                .transpose()?;
            run_prepare(
                &config,
                &audio_dir,
                &timing_dir,
                &output,
                &difficulty.to_lowercase(),
                scalers.as_deref(),
            )
        }
        Command::Stats {
            corpus,
            output,
            limit,
            seed,
            class_weights,
        } => {
            let mut stats = config.stats.clone();
            if let Some(limit) = limit {
                stats.limit = limit;
            }
            if let Some(seed) = seed {
                stats.seed = seed;
            }
            stats.class_weights |= class_weights;
            run_stats(stats, &corpus, &output)
        }
        Command::FitPrior { corpus, output } => run_fit_prior(&config, &corpus, &output),
        Command::Generate {
            input,
            output,
            prior,
            lookback,
            seed,
        } => {
            let lookback = lookback.unwrap_or(config.generate.lookback);
            let seed = seed.or(config.generate.seed);
            run_generate(&input, &output, &prior, lookback, seed)
        }
    }
}

fn progress_bar(len: usize, unit: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    let template = format!("[{{elapsed_precise}}] {{bar:40.cyan/blue}} {{pos}}/{{len}} {} ({{eta}} remaining)", unit);
    if let Ok(style) = ProgressStyle::default_bar().template(&template) {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

fn run_prepare(
    config: &Config,
    audio_dir: &Path,
    timing_dir: &Path,
    output: &Path,
    difficulty: &str,
    scalers: Option<&[ChannelScaler]>,
) -> Result<()> {
    let jobs = pair_songs(audio_dir, timing_dir)?;
    if jobs.is_empty() {
        anyhow::bail!("No timing files with matching audio in {}", timing_dir.display());
    }
    log::info!("Preparing {} songs for difficulty '{}'", jobs.len(), difficulty);

    let extractor = SpectralFeatureExtractor::new(config.features.clone())?;
    log::info!("FFT lengths: {:?}", extractor.layout().fft_lengths);
    if scalers.is_some() {
        log::info!("Standardizing features with precomputed scalers");
    }
    let aligner = TemporalAligner::new(config.features.hop_length_secs, config.alignment.collision_policy);
    let mut writer = CorpusWriter::create(output, difficulty, extractor.frame_shape())?;

    let pb = progress_bar(jobs.len(), "songs");
    let batch_size = rayon::current_num_threads().max(1);
    let mut written = 0usize;
    let mut skipped = 0usize;

    for batch in jobs.chunks(batch_size) {
        let results: Vec<_> = batch
            .par_iter()
            .map(|job| (job, prepare_song(job, &extractor, &aligner, difficulty, scalers)))
            .collect();

        for (job, result) in results {
            match result {
                Ok(song) => {
                    writer.append_song(&song.name, &song.features, song.labels.as_ref())?;
                    written += 1;
                }
                Err(err) if err.downcast_ref::<StepError>().is_some_and(StepError::is_validation) => {
                    log::warn!("Skipping {}: {}", job.name, err);
                    skipped += 1;
                }
                Err(err) => {
                    return Err(err.context(format!("Failed to prepare {}", job.timing_path.display())));
                }
            }
            pb.inc(1);
        }
    }

    pb.finish_with_message("Preparation complete");
    writer.finish()?;
    log::info!("Done! {} songs written, {} skipped", written, skipped);
    Ok(())
}

fn run_stats(stats: config::StatsConfig, corpus: &Path, output: &Path) -> Result<()> {
    let report = CorpusStatisticsEngine::new(stats)
        .compute(&FileCorpus::new(corpus))
        .with_context(|| format!("Failed to compute statistics for {}", corpus.display()))?;

    let file = std::fs::File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), &report)?;
    log::info!("Wrote statistics to {}", output.display());
    Ok(())
}

fn run_fit_prior(config: &Config, corpus: &Path, output: &Path) -> Result<()> {
    let (mut store, split) = CorpusStatisticsEngine::new(config.stats.clone())
        .split(&FileCorpus::new(corpus))
        .with_context(|| format!("Failed to open corpus {}", corpus.display()))?;
    log::info!(
        "Fitting prior on '{}' charts of {} training songs",
        store.manifest().difficulty,
        split.train.len()
    );
    let prior = ArrowPrior::fit(&mut store, &split.train)?;
    drop(store);

    prior
        .save(output)
        .with_context(|| format!("Failed to write prior {}", output.display()))?;
    log::info!("Wrote arrow prior to {}", output.display());
    Ok(())
}

fn onset_files(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(input)
        .with_context(|| format!("Failed to read input directory: {}", input.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(ONSET_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn run_generate(input: &Path, output: &Path, prior: &Path, lookback: usize, seed: Option<u64>) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input not found: {}", input.display());
    }
    let mut predictor = ArrowPrior::load(prior)
        .with_context(|| format!("Failed to load prior {}", prior.display()))?;
    let decoder = SequenceDecoder::new(lookback)?;
    let files = onset_files(input)?;
    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create output directory: {}", output.display()))?;

    let mut rng = match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_os_rng(),
    };

    let pb = progress_bar(files.len(), "files");
    for path in &files {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let timestamps = parse_onset_times(&content)
            .with_context(|| format!("Invalid onset file {}", path.display()))?;
        let arrows = decoder
            .decode(&timestamps, &mut predictor, &mut rng)
            .with_context(|| format!("Decoding failed for {}", path.display()))?;

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
        let target = output.join(format!("{}.{}", stem, ARROWS_EXTENSION));
        write_arrows(&target, &arrows)?;
        log::debug!(
            "{}: {} steps ({} with arrows) -> {}",
            path.display(),
            arrows.len(),
            arrows.iter().filter(|a| !a.is_empty()).count(),
            target.display()
        );
        pb.inc(1);
    }
    pb.finish_with_message("Generation complete");

    log::info!("Done! Generated {} arrow sequences in {}", files.len(), output.display());
    Ok(())
}
