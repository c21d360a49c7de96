//! Cuts composite rasters into fixed-size chips.

use indicatif::ProgressBar;
use log::{debug, error, info, warn};
use ndarray::{s, Array3, ArrayView3};

use crate::config::{DiscardRule, TileNaming, TilerConfig};
use crate::error::{ChipError, Result};
use crate::raster::{self, RasterSource, Window};
use crate::storage::{self, ObjectInfo, Storage, TIFF_CONTENT_TYPE};

/// Outcome of one tiling run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileReport {
    /// Sources considered (after the suffix filter).
    pub sources: usize,
    /// `(source name, reason)` for sources that could not be tiled.
    pub failed: Vec<(String, String)>,
    pub candidate_windows: usize,
    /// Bands decoded across all sources. Dry windows under `mask_empty`
    /// only cost the mask band.
    pub bands_decoded: usize,
    /// Names of the persisted tiles, in write order.
    pub tiles: Vec<String>,
}

pub struct Tiler<'a> {
    storage: &'a dyn Storage,
    config: TilerConfig,
    mask_index: usize,
    progress: ProgressBar,
}

impl<'a> Tiler<'a> {
    pub fn new(storage: &'a dyn Storage, config: TilerConfig) -> Result<Self> {
        let mask_index = config.mask_index()?;
        Ok(Self {
            storage,
            config,
            mask_index,
            progress: ProgressBar::hidden(),
        })
    }

    /// Drive `pb` with one tick per source raster.
    pub fn with_progress(mut self, pb: ProgressBar) -> Self {
        self.progress = pb;
        self
    }

    /// Tiles every raster under `input` into `output`.
    ///
    /// Listing failures are fatal. A source that cannot be read or decoded
    /// is recorded in the report and the remaining sources still run.
    pub fn tile(&self, input: &str, output: &str) -> Result<TileReport> {
        let sources: Vec<ObjectInfo> = self
            .storage
            .list(&storage::namespace_prefix(input))?
            .into_iter()
            .filter(|o| o.name.ends_with(&self.config.raster_suffix))
            .collect();
        info!("Found {} source rasters under {:?}", sources.len(), input);
        self.tile_sources(&sources, output)
    }

    pub fn tile_sources(&self, sources: &[ObjectInfo], output: &str) -> Result<TileReport> {
        let mut report = TileReport {
            sources: sources.len(),
            ..Default::default()
        };
        self.progress.set_length(sources.len() as u64);

        for source in sources {
            match self.tile_source(source, output, &mut report) {
                Ok(n) => info!("source={} => persisted {} tiles", source.name, n),
                Err(ChipError::Storage(e)) if !is_read_of(&e, &source.name) => {
                    // writes and listings are not per-source problems
                    return Err(ChipError::Storage(e));
                }
                Err(e) => {
                    error!("source={} failed, skipping: {}", source.name, e);
                    report.failed.push((source.name.clone(), e.to_string()));
                }
            }
            self.progress.inc(1);
        }

        info!(
            "Tiling done: {} sources, {} failed, {} candidate windows, {} bands decoded, {} tiles written",
            report.sources,
            report.failed.len(),
            report.candidate_windows,
            report.bands_decoded,
            report.tiles.len()
        );
        Ok(report)
    }

    fn tile_source(&self, source: &ObjectInfo, output: &str, report: &mut TileReport) -> Result<usize> {
        let stem = source_stem(source.file_name(), &self.config.raster_suffix);
        debug!("source={} start, stem={}", source.name, stem);

        let bytes = self.storage.read(&source.name)?;
        let mut src = RasterSource::open(bytes)?;
        let meta = src.meta().clone();
        if self.mask_index >= meta.band_count {
            return Err(ChipError::Raster(format!(
                "mask band {} ({}) missing, raster has {} bands",
                self.mask_index, self.config.mask_band, meta.band_count
            )));
        }
        if meta.band_count != self.config.bands.len() {
            warn!(
                "source={} has {} bands, band map names {}",
                source.name,
                meta.band_count,
                self.config.bands.len()
            );
        }

        let size = self.config.tile_size;
        let mut persisted = 0;
        for (index, window) in windows(meta.width, meta.height, size).enumerate() {
            report.candidate_windows += 1;

            let data = match self.config.discard {
                DiscardRule::MaskEmpty => {
                    let mask = src.read_band_window(self.mask_index, &window)?;
                    if is_all_zero(mask.iter()) {
                        debug!("source={} window {:?}: empty mask, skipped", source.name, window);
                        continue;
                    }
                    src.read_window(&window)?
                }
                DiscardRule::TileEmpty => {
                    let data = src.read_window(&window)?;
                    if is_all_zero(data.iter()) {
                        debug!("source={} window {:?}: empty tile, skipped", source.name, window);
                        continue;
                    }
                    data
                }
            };

            let padded = pad_tile(data.view(), size);
            let tile_meta = meta.for_tile(&window, size);
            let encoded = raster::encode(&tile_meta, padded.view())?;

            let name = storage::join(output, &tile_name(&stem, self.config.naming, index, &window));
            self.storage.write(&name, &encoded, TIFF_CONTENT_TYPE)?;
            debug!("source={} window {:?} => {}", source.name, window, name);
            report.tiles.push(name);
            persisted += 1;
        }
        report.bands_decoded += src.decoded_bands();
        Ok(persisted)
    }
}

fn is_read_of(e: &storage::StorageError, name: &str) -> bool {
    match e {
        storage::StorageError::NotFound(n) | storage::StorageError::InvalidName(n) => n == name,
        storage::StorageError::Io { name: n, .. } => n == name,
    }
}

fn is_all_zero<'x>(mut values: impl Iterator<Item = &'x f32>) -> bool {
    values.all(|&v| v == 0.0)
}

/// Non-overlapping `size`x`size` windows in row-major order, clipped to the
/// raster extent.
pub fn windows(width: usize, height: usize, size: usize) -> impl Iterator<Item = Window> {
    let step = size.max(1);
    (0..height).step_by(step).flat_map(move |row_off| {
        (0..width).step_by(step).map(move |col_off| {
            Window::new(
                col_off,
                row_off,
                step.min(width - col_off),
                step.min(height - row_off),
            )
        })
    })
}

/// Zero-pads `[bands, h, w]` on the bottom and right to `[bands, size, size]`.
pub fn pad_tile(data: ArrayView3<f32>, size: usize) -> Array3<f32> {
    let (bands, h, w) = data.dim();
    let (h, w) = (h.min(size), w.min(size));
    let mut out = Array3::<f32>::zeros((bands, size, size));
    out.slice_mut(s![.., ..h, ..w])
        .assign(&data.slice(s![.., ..h, ..w]));
    out
}

pub fn tile_name(stem: &str, naming: TileNaming, index: usize, window: &Window) -> String {
    match naming {
        TileNaming::Index => format!("{}_tile_{}.tif", stem, index),
        TileNaming::Offset => format!("{}_tile_{}_{}.tif", stem, window.row_off, window.col_off),
    }
}

fn source_stem(file_name: &str, suffix: &str) -> String {
    file_name.strip_suffix(suffix).unwrap_or(file_name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::config::BandMap;
    use crate::raster::{GeoKeys, GeoTransform, Interleave, RasterMeta, SampleType};
    use crate::storage::MemoryStorage;
    use ndarray::Axis;

    const SIZE: usize = 8;

    fn names_are_unique(names: &[String]) -> bool {
        names.iter().collect::<BTreeSet<_>>().len() == names.len()
    }

    fn small_config(discard: DiscardRule, naming: TileNaming) -> TilerConfig {
        TilerConfig {
            tile_size: SIZE,
            discard,
            naming,
            bands: BandMap::new(["elevation", "landcover", "flooded_mask"]),
            ..Default::default()
        }
    }

    fn source_meta(data: &Array3<f32>) -> RasterMeta {
        let (bands, h, w) = data.dim();
        RasterMeta::new(w, h, bands, SampleType::F32, GeoTransform::north_up(10.0, 20.0, 1.0, 1.0))
    }

    fn put_with_meta(storage: &MemoryStorage, name: &str, meta: &RasterMeta, data: &Array3<f32>) {
        let bytes = raster::encode(meta, data.view()).unwrap();
        storage.write(name, &bytes, TIFF_CONTENT_TYPE).unwrap();
    }

    fn put_raster(storage: &MemoryStorage, name: &str, data: &Array3<f32>) {
        put_with_meta(storage, name, &source_meta(data), data);
    }

    #[test]
    fn window_grid_covers_extent() {
        for (w, h) in [(20, 17), (8, 8), (1, 30), (16, 9)] {
            let all: Vec<_> = windows(w, h, SIZE).collect();
            let expected = ((h + SIZE - 1) / SIZE) * ((w + SIZE - 1) / SIZE);
            assert_eq!(all.len(), expected, "{}x{}", w, h);
            let area: usize = all.iter().map(|win| win.width * win.height).sum();
            assert_eq!(area, w * h);
        }
        let first: Vec<_> = windows(20, 17, SIZE).take(4).collect();
        assert_eq!(first[0], Window::new(0, 0, 8, 8));
        assert_eq!(first[2], Window::new(16, 0, 4, 8));
        assert_eq!(first[3], Window::new(0, 8, 8, 8));
    }

    #[test]
    fn padding_is_top_left_aligned() {
        let data = Array3::from_elem((2, 3, 5), 7.0f32);
        let padded = pad_tile(data.view(), SIZE);
        assert_eq!(padded.dim(), (2, SIZE, SIZE));
        assert_eq!(padded[[1, 2, 4]], 7.0);
        assert_eq!(padded[[1, 3, 4]], 0.0);
        assert_eq!(padded[[1, 2, 5]], 0.0);
        assert_eq!(padded.iter().filter(|&&v| v == 7.0).count(), 2 * 3 * 5);
    }

    #[test]
    fn mask_empty_skips_windows_without_flooding() {
        let storage = MemoryStorage::new();
        // 12x20 raster => 2x3 windows; flood pixels in windows 1 and 5
        let mut data = Array3::from_elem((3, 12, 20), 1.0f32);
        data.index_axis_mut(Axis(0), 2).fill(0.0);
        data[[2, 3, 10]] = 1.0;
        data[[2, 11, 19]] = 1.0;
        put_raster(&storage, "raw/event_a.tif", &data);

        let tiler = Tiler::new(&storage, small_config(DiscardRule::MaskEmpty, TileNaming::Index)).unwrap();
        let report = tiler.tile("raw", "chips").unwrap();
        assert_eq!(report.sources, 1);
        assert_eq!(report.candidate_windows, 6);
        assert_eq!(
            report.tiles,
            vec!["chips/event_a_tile_1.tif", "chips/event_a_tile_5.tif"]
        );

        let (meta, tile) = raster::decode(storage.read("chips/event_a_tile_5.tif").unwrap()).unwrap();
        assert_eq!((meta.height, meta.width, meta.band_count), (SIZE, SIZE, 3));
        assert_eq!(meta.transform.c, 10.0 + 16.0);
        assert_eq!(meta.transform.f, 20.0 - 8.0);
        // 4x4 of real data, the rest padding
        assert_eq!(tile[[0, 3, 3]], 1.0);
        assert_eq!(tile[[0, 4, 3]], 0.0);
        assert_eq!(tile[[2, 3, 3]], 1.0);
    }

    #[test]
    fn discard_rules_disagree_on_dry_tiles_with_data() {
        let storage = MemoryStorage::new();
        // terrain everywhere, no flooding at all
        let mut data = Array3::from_elem((3, 8, 16), 5.0f32);
        data.index_axis_mut(Axis(0), 2).fill(0.0);
        data.slice_mut(s![.., .., 8..]).fill(0.0);
        put_raster(&storage, "raw/dry.tif", &data);

        let by_mask = Tiler::new(&storage, small_config(DiscardRule::MaskEmpty, TileNaming::Index))
            .unwrap()
            .tile("raw", "mask")
            .unwrap();
        assert!(by_mask.tiles.is_empty());

        let by_tile = Tiler::new(&storage, small_config(DiscardRule::TileEmpty, TileNaming::Index))
            .unwrap()
            .tile("raw", "full")
            .unwrap();
        assert_eq!(by_tile.tiles, vec!["full/dry_tile_0.tif"]);
        assert_eq!(by_mask.candidate_windows, by_tile.candidate_windows);
    }

    #[test]
    fn offset_names_are_unique_across_sources() {
        let storage = MemoryStorage::new();
        let data = Array3::from_elem((3, 16, 16), 1.0f32);
        put_raster(&storage, "raw/input_data_2020-01-01.tif", &data);
        put_raster(&storage, "raw/input_data_2021-06-30.tif", &data);

        let report = Tiler::new(&storage, small_config(DiscardRule::MaskEmpty, TileNaming::Offset))
            .unwrap()
            .tile("raw", "chips")
            .unwrap();
        assert_eq!(report.tiles.len(), 8);
        assert!(names_are_unique(&report.tiles));
        assert!(report.tiles.contains(&"chips/input_data_2021-06-30_tile_8_0.tif".to_string()));
    }

    #[test]
    fn unreadable_source_does_not_stop_the_run() {
        let storage = MemoryStorage::new();
        storage.write("raw/a_broken.tif", b"not a tiff", TIFF_CONTENT_TYPE).unwrap();
        storage.write("raw/notes.txt", b"ignored", "text/plain").unwrap();
        put_raster(&storage, "raw/b_good.tif", &Array3::from_elem((3, 8, 8), 1.0f32));

        let report = Tiler::new(&storage, small_config(DiscardRule::MaskEmpty, TileNaming::Index))
            .unwrap()
            .tile("raw", "chips")
            .unwrap();
        assert_eq!(report.sources, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "raw/a_broken.tif");
        assert_eq!(report.tiles, vec!["chips/b_good_tile_0.tif"]);
    }

    #[test]
    fn source_missing_the_mask_band_fails_alone() {
        let storage = MemoryStorage::new();
        put_raster(&storage, "raw/two_bands.tif", &Array3::from_elem((2, 8, 8), 1.0f32));
        let report = Tiler::new(&storage, small_config(DiscardRule::MaskEmpty, TileNaming::Index))
            .unwrap()
            .tile("raw", "chips")
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.tiles.is_empty());
    }

    #[test]
    fn all_zero_mask_yields_no_tiles_and_no_error() {
        let storage = MemoryStorage::new();
        let mut data = Array3::from_elem((3, 10, 10), 2.0f32);
        data.index_axis_mut(Axis(0), 2).fill(0.0);
        put_raster(&storage, "raw/quiet.tif", &data);
        let report = Tiler::new(&storage, small_config(DiscardRule::MaskEmpty, TileNaming::Index))
            .unwrap()
            .tile("raw", "chips")
            .unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.candidate_windows, 4);
        assert!(report.tiles.is_empty());
        assert_eq!(storage.list("chips/").unwrap().len(), 0);
    }

    #[test]
    fn dry_windows_only_decode_the_mask_band() {
        let storage = MemoryStorage::new();
        let mut data = Array3::from_elem((3, 16, 16), 4.0f32);
        data.index_axis_mut(Axis(0), 2).fill(0.0);
        let mut meta = source_meta(&data);
        meta.interleave = Interleave::Band;
        put_with_meta(&storage, "raw/dry.tif", &meta, &data);

        let by_mask = Tiler::new(&storage, small_config(DiscardRule::MaskEmpty, TileNaming::Index))
            .unwrap()
            .tile("raw", "mask")
            .unwrap();
        assert_eq!(by_mask.candidate_windows, 4);
        assert!(by_mask.tiles.is_empty());
        assert_eq!(by_mask.bands_decoded, 1);

        let by_tile = Tiler::new(&storage, small_config(DiscardRule::TileEmpty, TileNaming::Index))
            .unwrap()
            .tile("raw", "full")
            .unwrap();
        assert_eq!(by_tile.tiles.len(), 4);
        assert_eq!(by_tile.bands_decoded, 3);
    }

    #[test]
    fn tiles_keep_crs_nodata_and_layout_of_the_source() {
        let storage = MemoryStorage::new();
        let data = Array3::from_elem((3, 8, 8), 1.0f32);
        let geokeys = GeoKeys {
            directory: vec![1, 1, 0, 2, 1024, 0, 1, 2, 2048, 0, 1, 4326],
            doubles: Vec::new(),
            ascii: "WGS 84|".into(),
        };
        let mut meta = source_meta(&data);
        meta.geokeys = geokeys.clone();
        meta.nodata = Some("-32768".into());
        meta.interleave = Interleave::Band;
        put_with_meta(&storage, "raw/scene.tif", &meta, &data);

        let report = Tiler::new(&storage, small_config(DiscardRule::MaskEmpty, TileNaming::Index))
            .unwrap()
            .tile("raw", "chips")
            .unwrap();
        assert_eq!(report.tiles, vec!["chips/scene_tile_0.tif"]);

        let (tile_meta, _) = raster::decode(storage.read("chips/scene_tile_0.tif").unwrap()).unwrap();
        assert_eq!(tile_meta.geokeys, geokeys);
        assert_eq!(tile_meta.nodata.as_deref(), Some("-32768"));
        assert_eq!(tile_meta.interleave, Interleave::Band);
        assert_eq!(tile_meta.band_count, 3);
    }
}
