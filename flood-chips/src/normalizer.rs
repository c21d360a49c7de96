//! Turns a namespace of chips into model-ready `images` / `masks` arrays.
//!
//! All qualifying chips are stacked into one `[N, C, H, W]` batch. The mask
//! band becomes `masks` (`[N, 1, H, W]`, values untouched). The land-cover
//! band is one-hot encoded, every other band is min-max scaled per channel
//! over the whole batch, and `images` is the scaled bands followed by the
//! land-cover indicator channels.

use indicatif::ProgressBar;
use log::{debug, info, warn};
use ndarray::{concatenate, Array3, Array4, ArrayView4, Axis};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::config::NormalizerConfig;
use crate::encoder::OneHotEncoder;
use crate::error::{ChipError, Result};
use crate::raster::RasterSource;
use crate::storage::{self, Storage, NPY_CONTENT_TYPE};

pub const IMAGES_ARTIFACT: &str = "processed_data/images.npy";
pub const MASKS_ARTIFACT: &str = "processed_data/masks.npy";

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeReport {
    /// Chips in batch order.
    pub tiles: Vec<String>,
    /// `(chip name, reason)` for chips left out of the batch.
    pub skipped: Vec<(String, String)>,
    pub images_shape: [usize; 4],
    pub masks_shape: [usize; 4],
    pub categories: Vec<i64>,
    pub other_bucket: bool,
    /// Continuous bands whose max equalled their min.
    pub degenerate_channels: Vec<String>,
    pub images: String,
    pub masks: String,
}

/// Result of [`process_batch`].
#[derive(Debug, Clone)]
pub struct ProcessedBatch {
    pub images: Array4<f32>,
    pub masks: Array4<f32>,
    /// Source band index of every scaled channel, in output order.
    pub continuous_bands: Vec<usize>,
    /// Positions in `continuous_bands` that hit the epsilon denominator.
    pub degenerate: Vec<usize>,
}

pub struct Normalizer<'a> {
    storage: &'a dyn Storage,
    config: NormalizerConfig,
    landcover: usize,
    mask: usize,
    progress: ProgressBar,
}

struct LoadedBatch {
    batch: Array4<f32>,
    names: Vec<String>,
    skipped: Vec<(String, String)>,
}

impl<'a> Normalizer<'a> {
    pub fn new(storage: &'a dyn Storage, config: NormalizerConfig) -> Result<Self> {
        let (landcover, mask) = config.band_indices()?;
        Ok(Self {
            storage,
            config,
            landcover,
            mask,
            progress: ProgressBar::hidden(),
        })
    }

    pub fn with_progress(mut self, pb: ProgressBar) -> Self {
        self.progress = pb;
        self
    }

    /// Normalizes every chip under `input` and writes the two artifacts
    /// under `output`. Returns `None`, writing nothing, when no chip qualifies.
    ///
    /// `encoder` is used as is when given; otherwise the configured
    /// vocabulary, or else a fit over the batch's land-cover values.
    pub fn normalize(
        &self,
        input: &str,
        output: &str,
        encoder: Option<&OneHotEncoder>,
    ) -> Result<Option<NormalizeReport>> {
        let LoadedBatch {
            mut batch,
            mut names,
            skipped,
        } = match self.load_batch(input)? {
            Some(loaded) => loaded,
            None => return Ok(None),
        };
        let (n, c, h, w) = batch.dim();
        info!(
            "Found {} chips with {} bands, {}x{} pixels ({} skipped)",
            n,
            c,
            h,
            w,
            skipped.len()
        );

        if let Some(seed) = self.config.shuffle_seed {
            let mut perm: Vec<usize> = (0..n).collect();
            perm.shuffle(&mut StdRng::seed_from_u64(seed));
            batch = permute_batch(&batch, &perm);
            names = perm.iter().map(|&i| names[i].clone()).collect();
            debug!("shuffled batch with seed {}", seed);
        }

        let encoder = match (encoder, &self.config.vocabulary) {
            (Some(e), _) => e.clone(),
            (None, Some(vocab)) => OneHotEncoder::with_vocabulary(vocab, self.config.other_bucket)?,
            (None, None) => OneHotEncoder::fit(batch.index_axis(Axis(1), self.landcover).iter())?,
        };
        info!(
            "Encoding land cover into {} channels (classes {:?}{})",
            encoder.width(),
            encoder.categories(),
            if encoder.has_other_bucket() { " + other" } else { "" }
        );

        let processed = process_batch(batch.view(), self.landcover, self.mask, &encoder, self.config.epsilon)?;
        drop(batch);

        let degenerate_channels: Vec<String> = processed
            .degenerate
            .iter()
            .map(|&k| band_label(&self.config, processed.continuous_bands[k]))
            .collect();
        if !degenerate_channels.is_empty() {
            warn!("Constant channels scaled to zero: {:?}", degenerate_channels);
        }

        let images_name = storage::join(output, IMAGES_ARTIFACT);
        let masks_name = storage::join(output, MASKS_ARTIFACT);
        self.storage
            .write(&images_name, &encode_npy(&processed.images)?, NPY_CONTENT_TYPE)?;
        self.storage
            .write(&masks_name, &encode_npy(&processed.masks)?, NPY_CONTENT_TYPE)?;
        info!(
            "Saved images {:?} to {} and masks {:?} to {}",
            processed.images.shape(),
            images_name,
            processed.masks.shape(),
            masks_name
        );

        Ok(Some(NormalizeReport {
            tiles: names,
            skipped,
            images_shape: shape4(&processed.images),
            masks_shape: shape4(&processed.masks),
            categories: encoder.categories().to_vec(),
            other_bucket: encoder.has_other_bucket(),
            degenerate_channels,
            images: images_name,
            masks: masks_name,
        }))
    }

    fn load_batch(&self, input: &str) -> Result<Option<LoadedBatch>> {
        let objects: Vec<_> = self
            .storage
            .list(&storage::namespace_prefix(input))?
            .into_iter()
            .filter(|o| o.name.ends_with(&self.config.raster_suffix))
            .collect();
        self.progress.set_length(objects.len() as u64);

        let mut tiles = Vec::new();
        let mut names = Vec::new();
        let mut skipped = Vec::new();
        for object in &objects {
            self.progress.inc(1);
            match self.read_tile(&object.name) {
                Ok(tile) => {
                    tiles.push(tile);
                    names.push(object.name.clone());
                }
                Err(reason) => {
                    warn!("Skipping chip {}: {}", object.name, reason);
                    skipped.push((object.name.clone(), reason));
                }
            }
        }

        if tiles.is_empty() {
            info!(
                "No qualifying chips under {:?} ({} listed, {} skipped), nothing written",
                input,
                objects.len(),
                skipped.len()
            );
            return Ok(None);
        }
        let batch = stack_tiles(&tiles)?;
        Ok(Some(LoadedBatch { batch, names, skipped }))
    }

    /// One chip, or the reason it is left out.
    fn read_tile(&self, name: &str) -> std::result::Result<Array3<f32>, String> {
        let bytes = self.storage.read(name).map_err(|e| e.to_string())?;
        let mut src = RasterSource::open(bytes).map_err(|e| e.to_string())?;
        let meta = src.meta().clone();
        let size = self.config.tile_size;
        if meta.height != size || meta.width != size {
            return Err(format!(
                "incorrect dimensions {}x{}, expected {}x{}",
                meta.height, meta.width, size, size
            ));
        }
        if meta.band_count != self.config.bands.len() {
            return Err(format!(
                "{} bands, band map has {}",
                meta.band_count,
                self.config.bands.len()
            ));
        }
        let tile = src.read_all().map_err(|e| e.to_string())?;
        if self.config.require_flooded
            && !tile.index_axis(Axis(0), self.mask).iter().any(|&v| v == 1.0)
        {
            return Err("no flooded pixels".to_string());
        }
        Ok(tile)
    }
}

fn band_label(config: &NormalizerConfig, band: usize) -> String {
    config
        .bands
        .name(band)
        .map(str::to_string)
        .unwrap_or_else(|| format!("band_{}", band))
}

fn shape4(arr: &Array4<f32>) -> [usize; 4] {
    let (a, b, c, d) = arr.dim();
    [a, b, c, d]
}

/// Encodes, drops and scales one stacked batch. Pure; no storage access.
pub fn process_batch(
    batch: ArrayView4<f32>,
    landcover: usize,
    mask: usize,
    encoder: &OneHotEncoder,
    epsilon: f32,
) -> Result<ProcessedBatch> {
    let bands = batch.len_of(Axis(1));
    if landcover >= bands || mask >= bands || landcover == mask {
        return Err(ChipError::Config(format!(
            "land-cover band {} / mask band {} invalid for {} bands",
            landcover, mask, bands
        )));
    }

    let masks = batch.index_axis(Axis(1), mask).insert_axis(Axis(1)).to_owned();
    let landcover_encoded = encoder.transform(batch.index_axis(Axis(1), landcover))?;

    let continuous_bands: Vec<usize> = (0..bands).filter(|&b| b != landcover && b != mask).collect();
    let mut scaled = batch.select(Axis(1), &continuous_bands);
    let bounds = channel_min_max(scaled.view());

    let mut degenerate = Vec::new();
    for (k, (&(lo, hi), mut channel)) in bounds.iter().zip(scaled.axis_iter_mut(Axis(1))).enumerate() {
        let range = if hi > lo {
            hi - lo
        } else {
            degenerate.push(k);
            epsilon
        };
        channel.par_mapv_inplace(|v| (v - lo) / range);
    }

    let images = concatenate(Axis(1), &[scaled.view(), landcover_encoded.view()])?;
    Ok(ProcessedBatch {
        images,
        masks,
        continuous_bands,
        degenerate,
    })
}

/// Per-channel `(min, max)` over the batch and spatial axes, ignoring NaN.
/// A channel without any non-NaN value reports `(0, 0)`.
pub fn channel_min_max(batch: ArrayView4<f32>) -> Vec<(f32, f32)> {
    batch
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|channel| {
            let (lo, hi) = channel
                .iter()
                .filter(|v| !v.is_nan())
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            if lo > hi {
                (0.0, 0.0)
            } else {
                (lo, hi)
            }
        })
        .collect()
}

/// Stacks equally shaped `[C, H, W]` chips into `[N, C, H, W]`.
pub fn stack_tiles(tiles: &[Array3<f32>]) -> Result<Array4<f32>> {
    let first = match tiles.first() {
        Some(t) => t.dim(),
        None => return Ok(Array4::zeros((0, 0, 0, 0))),
    };
    if let Some(bad) = tiles.iter().find(|t| t.dim() != first) {
        return Err(ChipError::Raster(format!(
            "cannot stack chip of shape {:?} onto {:?}",
            bad.dim(),
            first
        )));
    }
    let (c, h, w) = first;
    let mut out = Array4::<f32>::zeros((tiles.len(), c, h, w));
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(tiles.par_iter())
        .for_each(|(mut dst, src)| dst.assign(src));
    Ok(out)
}

/// Reorders the leading axis: row `i` of the result is row `perm[i]` of `batch`.
pub fn permute_batch(batch: &Array4<f32>, perm: &[usize]) -> Array4<f32> {
    let mut out = Array4::<f32>::zeros(batch.raw_dim());
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut dst)| dst.assign(&batch.index_axis(Axis(0), perm[i])));
    out
}

pub fn encode_npy(arr: &Array4<f32>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    arr.write_npy(&mut buf)?;
    Ok(buf)
}

pub fn decode_npy(bytes: &[u8]) -> Result<Array4<f32>> {
    Ok(Array4::<f32>::read_npy(bytes)?)
}
