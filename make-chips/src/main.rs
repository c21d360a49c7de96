use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};

use flood_chips::{DiscardRule, LocalStorage, PipelineConfig, Retrying, TileNaming, Tiler};

#[derive(Parser, Debug)]
#[command(name = "make-chips", version = "0.1.0")]
struct Args {
    /// Directory acting as the storage bucket
    #[arg(long, default_value = ".")]
    bucket_root: PathBuf,

    /// Namespace holding the composite rasters
    #[arg(long)]
    input: String,

    /// Namespace the chips are written to
    #[arg(long)]
    output: String,

    /// Pipeline configuration (TOML); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Chip edge length in pixels
    #[arg(long)]
    tile_size: Option<usize>,

    /// Which windows are dropped: mask-empty or tile-empty
    #[arg(long)]
    discard: Option<DiscardRule>,

    /// Chip filenames by window index or by pixel offset
    #[arg(long)]
    naming: Option<TileNaming>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
    info!("=== make-chips start ===");

    let args = Args::parse();
    info!("Parsed command-line args: {:?}", args);

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("Failed to load config {:?}", path))?,
        None => PipelineConfig::default(),
    };
    if let Some(size) = args.tile_size {
        config.tiler.tile_size = size;
    }
    if let Some(discard) = args.discard {
        config.tiler.discard = discard;
    }
    if let Some(naming) = args.naming {
        config.tiler.naming = naming;
    }
    config.validate().context("Invalid configuration")?;
    info!(
        "tile_size={} discard={} mask_band={} bands={:?}",
        config.tiler.tile_size,
        config.tiler.discard,
        config.tiler.mask_band,
        config.tiler.bands.names()
    );

    let storage = Retrying::new(LocalStorage::new(&args.bucket_root), config.storage.retry);

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}/{len:3} {msg}")
            .context("Invalid progress template")?
            .progress_chars("##-"),
    );

    let report = Tiler::new(&storage, config.tiler)?
        .with_progress(pb.clone())
        .tile(&args.input, &args.output)
        .with_context(|| format!("Tiling {:?} into {:?} failed", args.input, args.output))?;
    pb.finish_with_message("done");

    for (source, reason) in &report.failed {
        warn!("source={} not tiled: {}", source, reason);
    }
    info!(
        "=== make-chips done: {} sources, {} windows, {} bands decoded, {} chips written, {} failed ===",
        report.sources,
        report.candidate_windows,
        report.bands_decoded,
        report.tiles.len(),
        report.failed.len()
    );
    Ok(())
}
