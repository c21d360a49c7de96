//! Pipeline configuration.
//!
//! Every knob the stages use (tile size, discard rule, band layout, epsilon,
//! retry policy, namespace layout) lives here and is handed to each stage at
//! construction. Files are TOML; missing keys take the defaults below and
//! unknown keys are rejected.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ChipError, Result};

/// Band order of the composite rasters exported upstream.
pub const COMPOSITE_BANDS: [&str; 16] = [
    "elevation",
    "landcover",
    "slope",
    "built_up",
    "flow_direction",
    "stream_distance",
    "flow_accumulation",
    "spi",
    "sti",
    "cti",
    "tpi",
    "tri",
    "pcurv",
    "tcurv",
    "aspect",
    "flooded_mask",
];

pub const DEFAULT_TILE_SIZE: usize = 512;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub tiler: TilerConfig,
    pub normalizer: NormalizerConfig,
    pub storage: StorageConfig,
    pub layout: LayoutConfig,
    /// Countries processed concurrently by `run_countries`.
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tiler: TilerConfig::default(),
            normalizer: NormalizerConfig::default(),
            storage: StorageConfig::default(),
            layout: LayoutConfig::default(),
            workers: 2,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ChipError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ChipError::Config("workers must be at least 1".into()));
        }
        self.tiler.mask_index()?;
        self.normalizer.band_indices()?;
        self.storage.retry.validate()?;
        Ok(())
    }
}

/// Ordered band names; position in the list is the band index in the raster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct BandMap(Vec<String>);

impl Default for BandMap {
    fn default() -> Self {
        Self(COMPOSITE_BANDS.iter().map(|s| s.to_string()).collect())
    }
}

impl BandMap {
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.0
            .iter()
            .position(|b| b == name)
            .ok_or_else(|| ChipError::Config(format!("unknown band `{}`", name)))
    }
}

/// Which windows the tiler drops before persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardRule {
    /// Drop windows whose flood-mask band is all zero. Other bands are only
    /// read for windows that survive.
    MaskEmpty,
    /// Drop windows where every band is all zero.
    TileEmpty,
}

impl fmt::Display for DiscardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardRule::MaskEmpty => write!(f, "mask-empty"),
            DiscardRule::TileEmpty => write!(f, "tile-empty"),
        }
    }
}

impl FromStr for DiscardRule {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "mask_empty" => Ok(DiscardRule::MaskEmpty),
            "tile_empty" => Ok(DiscardRule::TileEmpty),
            other => Err(format!("unknown discard rule `{}` (mask-empty|tile-empty)", other)),
        }
    }
}

/// How tile filenames are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileNaming {
    /// `{stem}_tile_{i}.tif`, `i` counting every candidate window of the source.
    Index,
    /// `{stem}_tile_{row_off}_{col_off}.tif`.
    Offset,
}

impl FromStr for TileNaming {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "index" => Ok(TileNaming::Index),
            "offset" => Ok(TileNaming::Offset),
            other => Err(format!("unknown tile naming `{}` (index|offset)", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TilerConfig {
    pub tile_size: usize,
    pub discard: DiscardRule,
    pub naming: TileNaming,
    pub bands: BandMap,
    pub mask_band: String,
    pub raster_suffix: String,
}

impl Default for TilerConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            discard: DiscardRule::MaskEmpty,
            naming: TileNaming::Index,
            bands: BandMap::default(),
            mask_band: "flooded_mask".to_string(),
            raster_suffix: ".tif".to_string(),
        }
    }
}

impl TilerConfig {
    pub fn mask_index(&self) -> Result<usize> {
        if self.tile_size == 0 {
            return Err(ChipError::Config("tile_size must be positive".into()));
        }
        self.bands.index_of(&self.mask_band)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizerConfig {
    pub tile_size: usize,
    pub bands: BandMap,
    pub landcover_band: String,
    pub mask_band: String,
    /// Denominator used for channels whose max equals their min.
    pub epsilon: f32,
    /// Keep only tiles whose mask holds at least one flooded (1) pixel.
    pub require_flooded: bool,
    /// Fixed land-cover classes. `None` fits the classes seen in the batch.
    pub vocabulary: Option<Vec<i64>>,
    /// Route classes outside `vocabulary` to a trailing "other" channel.
    pub other_bucket: bool,
    pub shuffle_seed: Option<u64>,
    pub raster_suffix: String,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            bands: BandMap::default(),
            landcover_band: "landcover".to_string(),
            mask_band: "flooded_mask".to_string(),
            epsilon: 1e-10,
            require_flooded: false,
            vocabulary: None,
            other_bucket: true,
            shuffle_seed: None,
            raster_suffix: ".tif".to_string(),
        }
    }
}

impl NormalizerConfig {
    /// Resolves `(landcover, mask)` band indices.
    pub fn band_indices(&self) -> Result<(usize, usize)> {
        if self.tile_size == 0 {
            return Err(ChipError::Config("tile_size must be positive".into()));
        }
        if !(self.epsilon > 0.0) {
            return Err(ChipError::Config(format!(
                "epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        let landcover = self.bands.index_of(&self.landcover_band)?;
        let mask = self.bands.index_of(&self.mask_band)?;
        if landcover == mask {
            return Err(ChipError::Config(format!(
                "band `{}` cannot be both land cover and mask",
                self.mask_band
            )));
        }
        Ok((landcover, mask))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ChipError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Sleep before retry number `retry` (1-based), doubling each time.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutConfig {
    pub base_path: String,
    /// EM-DAT export (CSV) relative to the bucket root.
    pub events_table: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            base_path: "deep_learning".to_string(),
            events_table: "data/emdat/emdat_floods.csv".to_string(),
        }
    }
}

/// The three namespaces one country moves through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryNamespaces {
    pub raw: String,
    pub chips: String,
    pub processed: String,
}

impl LayoutConfig {
    pub fn namespaces(&self, country: &str) -> CountryNamespaces {
        let snake = snake_case(country);
        let base = self.base_path.trim_end_matches('/');
        CountryNamespaces {
            raw: format!("{}/data/raw/{}", base, snake),
            chips: format!("{}/data/chips/{}", base, snake),
            processed: format!("{}/data/processed/{}", base, snake),
        }
    }
}

pub fn snake_case(name: &str) -> String {
    name.trim().replace(' ', "_").to_lowercase()
}
