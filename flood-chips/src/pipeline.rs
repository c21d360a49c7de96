//! Per-country runs: raw composites to chips to processed arrays.

use std::panic::{catch_unwind, AssertUnwindSafe};

use indicatif::ProgressBar;
use log::{error, info};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::config::{CountryNamespaces, PipelineConfig};
use crate::error::Result;
use crate::events::{self, FloodEvent};
use crate::normalizer::{NormalizeReport, Normalizer};
use crate::storage::{self, Storage};
use crate::tiler::{TileReport, Tiler};

#[derive(Debug, Clone, PartialEq)]
pub struct CountryReport {
    pub namespaces: CountryNamespaces,
    pub tiles: TileReport,
    /// `None` when no chip qualified for normalization.
    pub normalized: Option<NormalizeReport>,
}

#[derive(Debug)]
pub struct CountryOutcome {
    pub country: String,
    pub result: std::result::Result<CountryReport, String>,
}

impl CountryOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Tiles `raw` into `chips`, then normalizes `chips` into `processed`.
pub fn run_country(storage: &dyn Storage, config: &PipelineConfig, country: &str) -> Result<CountryReport> {
    let namespaces = config.layout.namespaces(country);
    info!("=== country={} start ===", country);

    let tiles = Tiler::new(storage, config.tiler.clone())?.tile(&namespaces.raw, &namespaces.chips)?;
    let normalized = Normalizer::new(storage, config.normalizer.clone())?.normalize(
        &namespaces.chips,
        &namespaces.processed,
        None,
    )?;

    info!(
        "=== country={} done: {} tiles, {} ===",
        country,
        tiles.tiles.len(),
        match &normalized {
            Some(r) => format!("images {:?}", r.images_shape),
            None => "nothing to normalize".to_string(),
        }
    );
    Ok(CountryReport {
        namespaces,
        tiles,
        normalized,
    })
}

/// Runs every country on a pool of `config.workers` threads. A failing or
/// panicking country is reported in its outcome; the others carry on.
/// Outcomes come back in input order.
pub fn run_countries(
    storage: &dyn Storage,
    config: &PipelineConfig,
    countries: &[String],
    progress: &ProgressBar,
) -> Result<Vec<CountryOutcome>> {
    let pool = ThreadPoolBuilder::new().num_threads(config.workers.max(1)).build()?;
    info!("Running {} countries on {} workers", countries.len(), config.workers.max(1));
    progress.set_length(countries.len() as u64);

    let outcomes = pool.install(|| {
        countries
            .par_iter()
            .map(|country| {
                let result = match catch_unwind(AssertUnwindSafe(|| run_country(storage, config, country))) {
                    Ok(Ok(report)) => Ok(report),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
                };
                if let Err(e) = &result {
                    error!("country={} failed: {}", country, e);
                }
                progress.inc(1);
                CountryOutcome {
                    country: country.clone(),
                    result,
                }
            })
            .collect()
    });
    Ok(outcomes)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Flood events of `country` whose composite is not in its raw namespace yet.
pub fn pending_composites(storage: &dyn Storage, config: &PipelineConfig, country: &str) -> Result<Vec<FloodEvent>> {
    let table = storage.read(&config.layout.events_table)?;
    let all = events::read_flood_events(table.as_slice(), country)?;

    let raw = config.layout.namespaces(country).raw;
    let listed = storage.list(&storage::namespace_prefix(&raw))?;
    let existing = events::existing_event_dates(listed.iter().map(|o| o.file_name()))?;
    Ok(events::pending_events(&all, &existing))
}
