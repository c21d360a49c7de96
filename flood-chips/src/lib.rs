//! Flood training-data chip preparation.
//!
//! Composite rasters are cut into fixed-size chips by the [`tiler`], and the
//! chips under one namespace are stacked, encoded and scaled into `.npy`
//! bundles by the [`normalizer`]. Both stages talk to each other only through
//! a [`storage::Storage`] namespace.

pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod normalizer;
pub mod pipeline;
pub mod raster;
pub mod storage;
pub mod tiler;

pub use config::{BandMap, DiscardRule, NormalizerConfig, PipelineConfig, TileNaming, TilerConfig};
pub use encoder::OneHotEncoder;
pub use error::{ChipError, Result};
pub use events::FloodEvent;
pub use normalizer::{NormalizeReport, Normalizer};
pub use pipeline::{run_countries, run_country, CountryOutcome, CountryReport};
pub use storage::{LocalStorage, MemoryStorage, Retrying, Storage};
pub use tiler::{TileReport, Tiler};
