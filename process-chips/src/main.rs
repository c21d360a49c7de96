use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use flood_chips::{LocalStorage, Normalizer, PipelineConfig, Retrying};

#[derive(Parser, Debug)]
#[command(name = "process-chips", version = "0.1.0")]
struct Args {
    /// Directory acting as the storage bucket
    #[arg(long, default_value = ".")]
    bucket_root: PathBuf,

    /// Namespace holding the chips
    #[arg(long)]
    input: String,

    /// Namespace receiving processed_data/images.npy and masks.npy
    #[arg(long)]
    output: String,

    /// Pipeline configuration (TOML); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Expected chip edge length; other chips are skipped
    #[arg(long)]
    tile_size: Option<usize>,

    /// Keep only chips with at least one flooded pixel
    #[arg(long)]
    require_flooded: bool,

    /// Fixed land-cover classes, e.g. 10,20,30 (fit on the batch when empty)
    #[arg(long, value_delimiter = ',')]
    vocabulary: Vec<i64>,

    /// Fail on classes outside --vocabulary instead of using an extra channel
    #[arg(long)]
    no_other_bucket: bool,

    /// Shuffle chips with this seed before writing
    #[arg(long)]
    shuffle_seed: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
    info!("=== process-chips start ===");

    let args = Args::parse();
    info!("Parsed command-line args: {:?}", args);

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("Failed to load config {:?}", path))?,
        None => PipelineConfig::default(),
    };
    let normalizer = &mut config.normalizer;
    if let Some(size) = args.tile_size {
        normalizer.tile_size = size;
    }
    if args.require_flooded {
        normalizer.require_flooded = true;
    }
    if !args.vocabulary.is_empty() {
        normalizer.vocabulary = Some(args.vocabulary.clone());
    }
    if args.no_other_bucket {
        normalizer.other_bucket = false;
    }
    if args.shuffle_seed.is_some() {
        normalizer.shuffle_seed = args.shuffle_seed;
    }
    config.validate().context("Invalid configuration")?;

    let storage = Retrying::new(LocalStorage::new(&args.bucket_root), config.storage.retry);

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}/{len:3} {msg}")
            .context("Invalid progress template")?
            .progress_chars("##-"),
    );

    let report = Normalizer::new(&storage, config.normalizer)?
        .with_progress(pb.clone())
        .normalize(&args.input, &args.output, None)
        .with_context(|| format!("Normalizing {:?} into {:?} failed", args.input, args.output))?;
    pb.finish_with_message("done");

    match report {
        Some(r) => info!(
            "=== process-chips done: {} chips ({} skipped), images {:?}, masks {:?}, classes {:?} ===",
            r.tiles.len(),
            r.skipped.len(),
            r.images_shape,
            r.masks_shape,
            r.categories
        ),
        None => info!("=== process-chips done: no qualifying chips, nothing written ==="),
    }
    Ok(())
}
