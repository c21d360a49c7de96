use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};

use flood_chips::pipeline::pending_composites;
use flood_chips::{run_countries, LocalStorage, PipelineConfig, Retrying};

#[derive(Parser, Debug)]
#[command(name = "flood-pipeline", version = "0.1.0")]
struct Args {
    /// Countries to process
    #[arg(required = true)]
    countries: Vec<String>,

    /// Directory acting as the storage bucket
    #[arg(long, default_value = ".")]
    bucket_root: PathBuf,

    /// Pipeline configuration (TOML); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Countries processed at the same time
    #[arg(long)]
    workers: Option<usize>,

    /// Root of the raw/chips/processed namespaces
    #[arg(long)]
    base_path: Option<String>,

    /// Only list flood events that still lack a raw composite
    #[arg(long)]
    pending: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
    info!("=== flood-pipeline start ===");

    let args = Args::parse();
    info!("Parsed command-line args: {:?}", args);

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("Failed to load config {:?}", path))?,
        None => PipelineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(base) = &args.base_path {
        config.layout.base_path = base.clone();
    }
    config.validate().context("Invalid configuration")?;

    let storage = Retrying::new(LocalStorage::new(&args.bucket_root), config.storage.retry);

    if args.pending {
        for country in &args.countries {
            let events = pending_composites(&storage, &config, country)
                .with_context(|| format!("Listing pending events for {} failed", country))?;
            info!("country={} => {} events without a composite", country, events.len());
            for event in events {
                info!("  {} -> {} ({})", event.start, event.end, event.composite_prefix());
            }
        }
        return Ok(());
    }

    let pb = ProgressBar::new(args.countries.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}/{len:3} {msg}")
            .context("Invalid progress template")?
            .progress_chars("##-"),
    );

    let outcomes = run_countries(&storage, &config, &args.countries, &pb)?;
    pb.finish_with_message("done");

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(report) => {
                if !report.tiles.failed.is_empty() {
                    warn!(
                        "country={} => {} sources could not be tiled",
                        outcome.country,
                        report.tiles.failed.len()
                    );
                }
                info!(
                    "country={} => {} chips, processed={}",
                    outcome.country,
                    report.tiles.tiles.len(),
                    report.normalized.is_some()
                );
            }
            Err(e) => {
                failed += 1;
                error!("country={} => FAILED: {}", outcome.country, e);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} countries failed", failed, outcomes.len());
    }
    info!("=== flood-pipeline done ===");
    Ok(())
}
