//! Multi-band GeoTIFF codec.
//!
//! A raster is one TIFF image with a sample per band, pixel interleaved
//! (`PlanarConfiguration = 1`) or band sequential (`= 2`), in strips or
//! tiles. Uncompressed, LZW, Deflate and PackBits data is read, with or without
//! the horizontal predictor. Files holding one single-sample page per band are
//! read as well. Bands are held as `f32` in memory and cast back to the stored
//! sample type on write; written rasters are uncompressed strips.
//!
//! The affine transform is carried in the tie-point/pixel-scale tags, or in
//! the model transformation tag when it has rotation terms. The GeoKey
//! directory and the GDAL nodata tag are copied through untouched.

use std::io::{Cursor, Read, Seek, Write};

use flate2::read::ZlibDecoder;
use log::debug;
use ndarray::{s, Array2, Array3, ArrayView3, Axis};
use tiff::decoder::ifd::Value;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKind, TiffValue};
use tiff::tags::Tag;

use crate::error::{ChipError, Result};

/// Target size of one written strip.
const STRIP_BYTES: usize = 64 * 1024;

/// Affine pixel-to-map transform, GDAL/rasterio term order:
/// `x = c + a*col + b*row`, `y = f + d*col + e*row`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl GeoTransform {
    pub fn identity() -> Self {
        Self { a: 1.0, b: 0.0, c: 0.0, d: 0.0, e: 1.0, f: 0.0 }
    }

    /// North-up transform with square-ish pixels of `(x_res, y_res)`.
    pub fn north_up(origin_x: f64, origin_y: f64, x_res: f64, y_res: f64) -> Self {
        Self { a: x_res, b: 0.0, c: origin_x, d: 0.0, e: -y_res, f: origin_y }
    }

    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.c + self.a * col + self.b * row,
            self.f + self.d * col + self.e * row,
        )
    }

    /// Transform of a window whose top-left pixel is `(row_off, col_off)`.
    pub fn for_window(&self, window: &Window) -> Self {
        let (c, f) = self.apply(window.col_off as f64, window.row_off as f64);
        Self { c, f, ..*self }
    }

    fn is_rotated(&self) -> bool {
        self.b != 0.0 || self.d != 0.0
    }
}

/// Pixel window, offsets and extent in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn new(col_off: usize, row_off: usize, width: usize, height: usize) -> Self {
        Self { col_off, row_off, width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    U8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl SampleType {
    fn from_tiff(bits: u16, format: u16) -> Result<Self> {
        // SampleFormat: 1 = unsigned, 2 = signed, 3 = IEEE float
        match (format, bits) {
            (1, 8) => Ok(SampleType::U8),
            (1, 16) => Ok(SampleType::U16),
            (1, 32) => Ok(SampleType::U32),
            (2, 16) => Ok(SampleType::I16),
            (2, 32) => Ok(SampleType::I32),
            (3, 32) => Ok(SampleType::F32),
            (3, 64) => Ok(SampleType::F64),
            _ => Err(ChipError::Raster(format!(
                "unsupported sample layout: format={} bits={}",
                format, bits
            ))),
        }
    }

    fn bits(self) -> u16 {
        match self {
            SampleType::U8 => 8,
            SampleType::U16 | SampleType::I16 => 16,
            SampleType::U32 | SampleType::I32 | SampleType::F32 => 32,
            SampleType::F64 => 64,
        }
    }

    fn format(self) -> u16 {
        match self {
            SampleType::U8 | SampleType::U16 | SampleType::U32 => 1,
            SampleType::I16 | SampleType::I32 => 2,
            SampleType::F32 | SampleType::F64 => 3,
        }
    }

    fn bytes(self) -> usize {
        usize::from(self.bits() / 8)
    }

    /// Value of a sample from its raw bit pattern.
    fn to_f32(self, raw: u64) -> f32 {
        match self {
            SampleType::U8 => f32::from(raw as u8),
            SampleType::U16 => f32::from(raw as u16),
            SampleType::I16 => f32::from(raw as u16 as i16),
            SampleType::U32 => raw as u32 as f32,
            SampleType::I32 => raw as u32 as i32 as f32,
            SampleType::F32 => f32::from_bits(raw as u32),
            SampleType::F64 => f64::from_bits(raw) as f32,
        }
    }
}

/// How the bands of a raster are laid out in the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Interleave {
    /// Samples of one pixel are adjacent.
    #[default]
    Pixel,
    /// Every band is a plane of its own, decoded independently.
    Band,
}

/// GeoTIFF georeferencing keys, kept verbatim. Empty means absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoKeys {
    /// `GeoKeyDirectoryTag` including its four-entry header.
    pub directory: Vec<u16>,
    pub doubles: Vec<f64>,
    pub ascii: String,
}

impl GeoKeys {
    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }
}

/// Everything needed to write a raster besides its pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterMeta {
    pub width: usize,
    pub height: usize,
    pub band_count: usize,
    pub sample_type: SampleType,
    pub transform: GeoTransform,
    pub interleave: Interleave,
    pub geokeys: GeoKeys,
    /// `GDAL_NODATA` as written by GDAL, e.g. `"-9999"` or `"nan"`.
    pub nodata: Option<String>,
}

impl RasterMeta {
    /// Pixel-interleaved raster without CRS or nodata.
    pub fn new(
        width: usize,
        height: usize,
        band_count: usize,
        sample_type: SampleType,
        transform: GeoTransform,
    ) -> Self {
        Self {
            width,
            height,
            band_count,
            sample_type,
            transform,
            interleave: Interleave::default(),
            geokeys: GeoKeys::default(),
            nodata: None,
        }
    }

    /// Metadata of a `size`x`size` tile cut at `window`.
    pub fn for_tile(&self, window: &Window, size: usize) -> Self {
        Self {
            width: size,
            height: size,
            transform: self.transform.for_window(window),
            ..self.clone()
        }
    }
}

/// Strip or tile locations of a single-image raster.
#[derive(Debug)]
struct Chunks {
    little_endian: bool,
    compression: u16,
    predictor: u16,
    tiled: bool,
    width: usize,
    height: usize,
    offsets: Vec<u64>,
    byte_counts: Vec<u64>,
}

#[derive(Debug)]
enum Layout {
    Chunks(Chunks),
    /// IFD index of every band page.
    Pages(Vec<usize>),
}

/// An encoded raster whose bands are decoded on first access.
///
/// Band-interleaved rasters decode one band per access. Pixel-interleaved
/// rasters decode all bands together on the first access.
pub struct RasterSource {
    bytes: Vec<u8>,
    meta: RasterMeta,
    layout: Layout,
    bands: Vec<Option<Array2<f32>>>,
}

impl RasterSource {
    pub fn open(bytes: Vec<u8>) -> Result<Self> {
        let (meta, layout) = read_header(&bytes)?;
        debug!("opened raster {:?}", meta);
        let bands = vec![None; meta.band_count];
        Ok(Self { bytes, meta, layout, bands })
    }

    pub fn meta(&self) -> &RasterMeta {
        &self.meta
    }

    /// How many bands have been decoded so far.
    pub fn decoded_bands(&self) -> usize {
        self.bands.iter().filter(|b| b.is_some()).count()
    }

    fn load(&mut self, index: usize) -> Result<()> {
        let shape = (self.meta.height, self.meta.width);
        match &self.layout {
            Layout::Pages(pages) => {
                let band = decode_page(&self.bytes, pages[index], shape)?;
                self.bands[index] = Some(band);
            }
            Layout::Chunks(chunks) if self.meta.interleave == Interleave::Band => {
                let mut plane = [Array2::<f32>::zeros(shape)];
                chunks.decode_plane(&self.bytes, &self.meta, index, &mut plane)?;
                let [band] = plane;
                self.bands[index] = Some(band);
            }
            Layout::Chunks(chunks) => {
                let mut all: Vec<Array2<f32>> = vec![Array2::zeros(shape); self.meta.band_count];
                chunks.decode_plane(&self.bytes, &self.meta, 0, &mut all)?;
                self.bands = all.into_iter().map(Some).collect();
            }
        }
        Ok(())
    }

    fn band(&mut self, index: usize) -> Result<&Array2<f32>> {
        if index >= self.meta.band_count {
            return Err(ChipError::Raster(format!(
                "band {} out of range, raster has {} bands",
                index, self.meta.band_count
            )));
        }
        if self.bands[index].is_none() {
            self.load(index)?;
        }
        self.bands[index]
            .as_ref()
            .ok_or_else(|| ChipError::Raster(format!("band {} not decoded", index)))
    }

    fn check_window(&self, window: &Window) -> Result<()> {
        if window.col_off + window.width > self.meta.width
            || window.row_off + window.height > self.meta.height
        {
            return Err(ChipError::Raster(format!(
                "window {:?} exceeds raster extent {}x{}",
                window, self.meta.width, self.meta.height
            )));
        }
        Ok(())
    }

    pub fn read_band_window(&mut self, index: usize, window: &Window) -> Result<Array2<f32>> {
        self.check_window(window)?;
        let band = self.band(index)?;
        Ok(band
            .slice(s![
                window.row_off..window.row_off + window.height,
                window.col_off..window.col_off + window.width
            ])
            .to_owned())
    }

    /// All bands for `window`, shape `[bands, height, width]`.
    pub fn read_window(&mut self, window: &Window) -> Result<Array3<f32>> {
        self.check_window(window)?;
        let mut out = Array3::<f32>::zeros((self.meta.band_count, window.height, window.width));
        for b in 0..self.meta.band_count {
            let band = self.read_band_window(b, window)?;
            out.index_axis_mut(Axis(0), b).assign(&band);
        }
        Ok(out)
    }

    pub fn read_all(&mut self) -> Result<Array3<f32>> {
        let full = Window::new(0, 0, self.meta.width, self.meta.height);
        self.read_window(&full)
    }
}

/// Decodes a whole raster.
pub fn decode(bytes: Vec<u8>) -> Result<(RasterMeta, Array3<f32>)> {
    let mut source = RasterSource::open(bytes)?;
    let data = source.read_all()?;
    Ok((source.meta, data))
}

/// Encodes `data` (`[bands, height, width]`) as one image with a sample per
/// band, using `meta`'s sample type, interleave and georeferencing.
pub fn encode(meta: &RasterMeta, data: ArrayView3<f32>) -> Result<Vec<u8>> {
    let expected = (meta.band_count, meta.height, meta.width);
    if data.dim() != expected {
        return Err(ChipError::Raster(format!(
            "data shape {:?} does not match metadata {:?}",
            data.dim(),
            expected
        )));
    }
    if meta.band_count == 0 {
        return Err(ChipError::Raster("cannot encode a raster without bands".into()));
    }

    match meta.sample_type {
        SampleType::U8 => encode_as(meta, data, |v| v as u8),
        SampleType::U16 => encode_as(meta, data, |v| v as u16),
        SampleType::I16 => encode_as(meta, data, |v| v as i16),
        SampleType::U32 => encode_as(meta, data, |v| v as u32),
        SampleType::I32 => encode_as(meta, data, |v| v as i32),
        SampleType::F32 => encode_as(meta, data, |v| v),
        SampleType::F64 => encode_as(meta, data, f64::from),
    }
}

fn encode_as<T>(meta: &RasterMeta, data: ArrayView3<f32>, cast: impl Fn(f32) -> T) -> Result<Vec<u8>>
where
    [T]: TiffValue,
{
    let (bands, height, width) = data.dim();
    let planar = meta.interleave == Interleave::Band && bands > 1;
    let row_bytes = width * meta.sample_type.bytes() * if planar { 1 } else { bands };
    let rows_per_strip = (STRIP_BYTES / row_bytes.max(1)).clamp(1, height.max(1));

    let mut strips: Vec<Vec<T>> = Vec::new();
    if planar {
        for band in data.outer_iter() {
            for r0 in (0..height).step_by(rows_per_strip) {
                let r1 = (r0 + rows_per_strip).min(height);
                strips.push(band.slice(s![r0..r1, ..]).iter().map(|&v| cast(v)).collect());
            }
        }
    } else {
        for r0 in (0..height).step_by(rows_per_strip) {
            let r1 = (r0 + rows_per_strip).min(height);
            let rows = data.slice(s![.., r0..r1, ..]).permuted_axes([1, 2, 0]);
            strips.push(rows.iter().map(|&v| cast(v)).collect());
        }
    }

    let too_large = || ChipError::Raster(format!("{}x{}x{} raster is too large for TIFF", bands, height, width));
    let samples = u16::try_from(bands).map_err(|_| too_large())?;
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut tiff = TiffEncoder::new(&mut cursor)?;
        let mut dir = tiff.new_directory()?;

        let mut offsets = Vec::with_capacity(strips.len());
        let mut byte_counts = Vec::with_capacity(strips.len());
        for strip in &strips {
            let offset = dir.write_data(strip.as_slice())?;
            offsets.push(u32::try_from(offset).map_err(|_| too_large())?);
            byte_counts.push(u32::try_from(strip.len() * meta.sample_type.bytes()).map_err(|_| too_large())?);
        }

        dir.write_tag(Tag::ImageWidth, u32::try_from(width).map_err(|_| too_large())?)?;
        dir.write_tag(Tag::ImageLength, u32::try_from(height).map_err(|_| too_large())?)?;
        dir.write_tag(Tag::BitsPerSample, &vec![meta.sample_type.bits(); bands][..])?;
        dir.write_tag(Tag::Compression, 1u16)?;
        // BlackIsZero, the extra samples are plain bands
        dir.write_tag(Tag::PhotometricInterpretation, 1u16)?;
        dir.write_tag(Tag::StripOffsets, &offsets[..])?;
        dir.write_tag(Tag::SamplesPerPixel, samples)?;
        dir.write_tag(Tag::RowsPerStrip, rows_per_strip as u32)?;
        dir.write_tag(Tag::StripByteCounts, &byte_counts[..])?;
        dir.write_tag(Tag::PlanarConfiguration, if planar { 2u16 } else { 1u16 })?;
        if bands > 1 {
            dir.write_tag(Tag::ExtraSamples, &vec![0u16; bands - 1][..])?;
        }
        dir.write_tag(Tag::SampleFormat, &vec![meta.sample_type.format(); bands][..])?;
        write_georeference(&mut dir, meta)?;
        dir.finish()?;
    }
    Ok(cursor.into_inner())
}

fn write_georeference<W: Write + Seek, K: TiffKind>(
    dir: &mut DirectoryEncoder<'_, W, K>,
    meta: &RasterMeta,
) -> Result<()> {
    let t = &meta.transform;
    if t.is_rotated() {
        let matrix = [
            t.a, t.b, 0.0, t.c, //
            t.d, t.e, 0.0, t.f, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ];
        dir.write_tag(Tag::ModelTransformationTag, &matrix[..])?;
    } else {
        let tie_point = [0.0, 0.0, 0.0, t.c, t.f, 0.0];
        let scale = [t.a, -t.e, 0.0];
        dir.write_tag(Tag::ModelTiepointTag, &tie_point[..])?;
        dir.write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
    }

    let keys = &meta.geokeys;
    if !keys.directory.is_empty() {
        dir.write_tag(Tag::GeoKeyDirectoryTag, &keys.directory[..])?;
    }
    if !keys.doubles.is_empty() {
        dir.write_tag(Tag::GeoDoubleParamsTag, &keys.doubles[..])?;
    }
    if !keys.ascii.is_empty() {
        dir.write_tag(Tag::GeoAsciiParamsTag, keys.ascii.as_str())?;
    }
    if let Some(nodata) = &meta.nodata {
        dir.write_tag(Tag::GdalNodata, nodata.as_str())?;
    }
    Ok(())
}

fn read_header(bytes: &[u8]) -> Result<(RasterMeta, Layout)> {
    let mut decoder = Decoder::new(Cursor::new(bytes))?.with_limits(Limits::unlimited());
    let little_endian = match bytes.get(..2) {
        Some(b"II") => true,
        Some(b"MM") => false,
        _ => return Err(ChipError::Raster("missing TIFF byte-order mark".into())),
    };
    let (width, height) = decoder.dimensions()?;

    let samples = decoder.find_tag_unsigned::<u16>(Tag::SamplesPerPixel)?.unwrap_or(1);
    let bits = unsigned_list(&mut decoder, Tag::BitsPerSample)?.unwrap_or_default();
    let formats = unsigned_list(&mut decoder, Tag::SampleFormat)?.unwrap_or_default();
    // the decoder has already rejected mixed sample layouts
    let sample_type = SampleType::from_tiff(
        bits.first().map_or(1, |&b| b as u16),
        formats.first().map_or(1, |&f| f as u16),
    )?;
    let planar = decoder.find_tag_unsigned::<u16>(Tag::PlanarConfiguration)?.unwrap_or(1) == 2;
    let transform = read_transform(&mut decoder)?;
    let geokeys = read_geokeys(&mut decoder)?;
    let nodata = decoder.find_tag(Tag::GdalNodata)?.map(|v| v.into_string()).transpose()?;
    let chunks = read_chunks(&mut decoder, little_endian, width, height)?;

    let mut meta = RasterMeta {
        width: width as usize,
        height: height as usize,
        band_count: usize::from(samples),
        sample_type,
        transform,
        interleave: if planar && samples > 1 { Interleave::Band } else { Interleave::Pixel },
        geokeys,
        nodata,
    };
    if samples > 1 {
        return Ok((meta, Layout::Chunks(chunks)));
    }

    // A single-sample first page: either a one-band raster or a page per band.
    // Overview (bit 0) and mask (bit 2) pages are skipped.
    let mut pages = vec![0];
    let mut ifd = 0;
    while decoder.more_images() {
        decoder.next_image()?;
        ifd += 1;
        let subfile = decoder.find_tag_unsigned::<u32>(Tag::NewSubfileType)?.unwrap_or(0);
        if subfile & 0b101 != 0 {
            continue;
        }
        let dims = decoder.dimensions()?;
        if dims != (width, height) {
            return Err(ChipError::Raster(format!(
                "band {} is {}x{}, band 0 is {}x{}",
                pages.len(),
                dims.0,
                dims.1,
                width,
                height
            )));
        }
        let page_samples = decoder.find_tag_unsigned::<u16>(Tag::SamplesPerPixel)?.unwrap_or(1);
        if page_samples != 1 {
            return Err(ChipError::Raster(format!(
                "page {} has {} samples, expected one per band page",
                ifd, page_samples
            )));
        }
        pages.push(ifd);
    }

    if pages.len() == 1 {
        return Ok((meta, Layout::Chunks(chunks)));
    }
    meta.band_count = pages.len();
    meta.interleave = Interleave::Band;
    Ok((meta, Layout::Pages(pages)))
}

fn read_chunks<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    little_endian: bool,
    width: u32,
    height: u32,
) -> Result<Chunks> {
    let compression = decoder.find_tag_unsigned::<u16>(Tag::Compression)?.unwrap_or(1);
    let predictor = decoder.find_tag_unsigned::<u16>(Tag::Predictor)?.unwrap_or(1);

    let (tiled, chunk_width, chunk_height) = match decoder.find_tag_unsigned::<u32>(Tag::TileWidth)? {
        Some(tile_width) => {
            let tile_height = decoder
                .find_tag_unsigned::<u32>(Tag::TileLength)?
                .ok_or_else(|| ChipError::Raster("tiled raster without TileLength".into()))?;
            (true, tile_width, tile_height)
        }
        None => {
            let rows = decoder.find_tag_unsigned::<u32>(Tag::RowsPerStrip)?.unwrap_or(height);
            (false, width, rows.min(height))
        }
    };
    let (offsets_tag, counts_tag) = if tiled {
        (Tag::TileOffsets, Tag::TileByteCounts)
    } else {
        (Tag::StripOffsets, Tag::StripByteCounts)
    };
    let missing = |tag: Tag| ChipError::Raster(format!("raster has no {:?} tag", tag));
    let offsets = unsigned_list(decoder, offsets_tag)?.ok_or_else(|| missing(offsets_tag))?;
    let byte_counts = unsigned_list(decoder, counts_tag)?.ok_or_else(|| missing(counts_tag))?;

    Ok(Chunks {
        little_endian,
        compression,
        predictor,
        tiled,
        width: chunk_width as usize,
        height: chunk_height as usize,
        offsets,
        byte_counts,
    })
}

impl Chunks {
    /// Decodes every chunk of `plane` into `bands`. Each chunk pixel holds
    /// `bands.len()` adjacent samples.
    fn decode_plane(
        &self,
        bytes: &[u8],
        meta: &RasterMeta,
        plane: usize,
        bands: &mut [Array2<f32>],
    ) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ChipError::Raster("raster chunks have no extent".into()));
        }
        let per_pixel = bands.len();
        let sample_bytes = meta.sample_type.bytes();
        let across = meta.width.div_ceil(self.width);
        let down = meta.height.div_ceil(self.height);

        for cy in 0..down {
            for cx in 0..across {
                let index = plane * across * down + cy * across + cx;
                let (row0, col0) = (cy * self.height, cx * self.width);
                let rows = if self.tiled {
                    self.height
                } else {
                    self.height.min(meta.height - row0)
                };
                let row_samples = self.width * per_pixel;
                let chunk = self.chunk(bytes, index, rows * row_samples * sample_bytes)?;
                let chunk = self.undo_predictor(chunk, row_samples, per_pixel, sample_bytes)?;

                let valid_rows = rows.min(meta.height - row0);
                let valid_cols = self.width.min(meta.width - col0);
                for r in 0..valid_rows {
                    for c in 0..valid_cols {
                        let pixel = (r * self.width + c) * per_pixel;
                        for (b, band) in bands.iter_mut().enumerate() {
                            let at = (pixel + b) * sample_bytes;
                            let raw = read_uint(&chunk[at..at + sample_bytes], self.little_endian);
                            band[[row0 + r, col0 + c]] = meta.sample_type.to_f32(raw);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Decompressed bytes of chunk `index`, exactly `expected` long.
    fn chunk(&self, bytes: &[u8], index: usize, expected: usize) -> Result<Vec<u8>> {
        let located = self
            .offsets
            .get(index)
            .zip(self.byte_counts.get(index))
            .and_then(|(&offset, &count)| {
                let start = usize::try_from(offset).ok()?;
                let end = start.checked_add(usize::try_from(count).ok()?)?;
                bytes.get(start..end)
            });
        let raw = located.ok_or_else(|| ChipError::Raster(format!("chunk {} lies outside the file", index)))?;

        let mut data = match self.compression {
            1 => raw.to_vec(),
            5 => weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
                .decode(raw)
                .map_err(|e| ChipError::Raster(format!("chunk {}: {}", index, e)))?,
            8 | 32946 => {
                let mut out = Vec::with_capacity(expected);
                ZlibDecoder::new(raw).read_to_end(&mut out)?;
                out
            }
            32773 => unpack_bits(raw, expected),
            other => {
                return Err(ChipError::Raster(format!("unsupported compression {}", other)));
            }
        };
        if data.len() < expected {
            return Err(ChipError::Raster(format!(
                "chunk {} decodes to {} bytes, expected {}",
                index,
                data.len(),
                expected
            )));
        }
        data.truncate(expected);
        Ok(data)
    }

    fn undo_predictor(
        &self,
        mut data: Vec<u8>,
        row_samples: usize,
        per_pixel: usize,
        sample_bytes: usize,
    ) -> Result<Vec<u8>> {
        match self.predictor {
            1 => {}
            2 => {
                for row in data.chunks_mut(row_samples * sample_bytes) {
                    for i in per_pixel..row.len() / sample_bytes {
                        let prev = read_uint(&row[(i - per_pixel) * sample_bytes..][..sample_bytes], self.little_endian);
                        let cur = &mut row[i * sample_bytes..][..sample_bytes];
                        let sum = read_uint(cur, self.little_endian).wrapping_add(prev);
                        write_uint(cur, sum, self.little_endian);
                    }
                }
            }
            other => return Err(ChipError::Raster(format!("unsupported predictor {}", other))),
        }
        Ok(data)
    }
}

fn read_uint(raw: &[u8], little_endian: bool) -> u64 {
    let fold = |acc: u64, &b: &u8| (acc << 8) | u64::from(b);
    if little_endian {
        raw.iter().rev().fold(0, fold)
    } else {
        raw.iter().fold(0, fold)
    }
}

/// Stores the low `raw.len()` bytes of `value`.
fn write_uint(raw: &mut [u8], mut value: u64, little_endian: bool) {
    let n = raw.len();
    for i in 0..n {
        let at = if little_endian { i } else { n - 1 - i };
        raw[at] = value as u8;
        value >>= 8;
    }
}

fn unpack_bits(raw: &[u8], expected: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(expected);
    let mut i = 0;
    while i < raw.len() && out.len() < expected {
        let header = raw[i] as i8;
        i += 1;
        if header >= 0 {
            let end = (i + header as usize + 1).min(raw.len());
            out.extend_from_slice(&raw[i..end]);
            i = end;
        } else if header != -128 {
            if let Some(&byte) = raw.get(i) {
                let run = (1 - isize::from(header)) as usize;
                out.extend(std::iter::repeat(byte).take(run));
            }
            i += 1;
        }
    }
    out
}

/// An unsigned scalar or list tag as a list.
fn unsigned_list<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Result<Option<Vec<u64>>> {
    match decoder.find_tag(tag)? {
        None => Ok(None),
        Some(Value::List(items)) => Ok(Some(
            items
                .into_iter()
                .map(|v| v.into_u64())
                .collect::<std::result::Result<_, _>>()?,
        )),
        Some(value) => Ok(Some(vec![value.into_u64()?])),
    }
}

fn decode_page(bytes: &[u8], ifd: usize, (height, width): (usize, usize)) -> Result<Array2<f32>> {
    let mut decoder = Decoder::new(Cursor::new(bytes))?.with_limits(Limits::unlimited());
    for _ in 0..ifd {
        decoder.next_image()?;
    }
    let samples = samples_to_f32(decoder.read_image()?)?;
    if samples.len() != width * height {
        return Err(ChipError::Raster(format!(
            "page {} holds {} samples, expected {}",
            ifd,
            samples.len(),
            width * height
        )));
    }
    Ok(Array2::from_shape_vec((height, width), samples)?)
}

fn read_geokeys<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<GeoKeys> {
    Ok(GeoKeys {
        directory: decoder
            .find_tag(Tag::GeoKeyDirectoryTag)?
            .map(|v| v.into_u16_vec())
            .transpose()?
            .unwrap_or_default(),
        doubles: decoder
            .find_tag(Tag::GeoDoubleParamsTag)?
            .map(|v| v.into_f64_vec())
            .transpose()?
            .unwrap_or_default(),
        ascii: decoder
            .find_tag(Tag::GeoAsciiParamsTag)?
            .map(|v| v.into_string())
            .transpose()?
            .unwrap_or_default(),
    })
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<GeoTransform> {
    if let Some(value) = decoder.find_tag(Tag::ModelTransformationTag)? {
        let m = value.into_f64_vec()?;
        if m.len() < 8 {
            return Err(ChipError::Raster(format!(
                "model transformation has {} terms, expected 16",
                m.len()
            )));
        }
        return Ok(GeoTransform { a: m[0], b: m[1], c: m[3], d: m[4], e: m[5], f: m[7] });
    }

    let tie_point = decoder.find_tag(Tag::ModelTiepointTag)?;
    let scale = decoder.find_tag(Tag::ModelPixelScaleTag)?;
    match (tie_point, scale) {
        (Some(tp), Some(sc)) => {
            let tp = tp.into_f64_vec()?;
            let sc = sc.into_f64_vec()?;
            if tp.len() < 6 || sc.len() < 2 {
                return Err(ChipError::Raster("truncated tie point or pixel scale".into()));
            }
            let (i, j, x, y) = (tp[0], tp[1], tp[3], tp[4]);
            let (sx, sy) = (sc[0], sc[1]);
            Ok(GeoTransform {
                a: sx,
                b: 0.0,
                c: x - i * sx,
                d: 0.0,
                e: -sy,
                f: y + j * sy,
            })
        }
        _ => Ok(GeoTransform::identity()),
    }
}

fn samples_to_f32(result: DecodingResult) -> Result<Vec<f32>> {
    Ok(match result {
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        other => {
            return Err(ChipError::Raster(format!(
                "unsupported decoding result {:?}",
                std::mem::discriminant(&other)
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tiff::encoder::colortype;
    use tiff::encoder::compression::{Deflate, Lzw, Packbits};

    fn meta(bands: usize, h: usize, w: usize, sample_type: SampleType) -> RasterMeta {
        RasterMeta::new(w, h, bands, sample_type, GeoTransform::north_up(-84.0, 11.0, 0.0008, 0.0008))
    }

    fn ramp(bands: usize, h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((bands, h, w), |(b, r, c)| (b * 100 + r * w + c) as f32)
    }

    /// `[bands, h, w]` from pixel-interleaved samples.
    fn deinterleave(samples: &[f32], bands: usize, h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((bands, h, w), |(b, r, c)| samples[(r * w + c) * bands + b])
    }

    fn wgs84() -> GeoKeys {
        GeoKeys {
            // version 1.1.0, 3 keys: model type geographic, raster is area, EPSG:4326
            directory: vec![1, 1, 0, 3, 1024, 0, 1, 2, 1025, 0, 1, 1, 2048, 0, 1, 4326],
            doubles: vec![6378137.0, 298.257223563],
            ascii: "WGS 84|".into(),
        }
    }

    #[test]
    fn encode_decode_preserves_bands_and_georeference() {
        let m = meta(3, 7, 5, SampleType::I16);
        let data = ramp(3, 7, 5) - 50.0;
        let bytes = encode(&m, data.view()).unwrap();

        let (got_meta, got) = decode(bytes).unwrap();
        assert_eq!(got_meta.band_count, 3);
        assert_eq!((got_meta.height, got_meta.width), (7, 5));
        assert_eq!(got_meta.sample_type, SampleType::I16);
        assert_eq!(got_meta.interleave, Interleave::Pixel);
        assert_relative_eq!(got_meta.transform.a, 0.0008);
        assert_relative_eq!(got_meta.transform.e, -0.0008);
        assert_relative_eq!(got_meta.transform.c, -84.0);
        assert_relative_eq!(got_meta.transform.f, 11.0);
        assert_eq!(got, data);
    }

    #[test]
    fn written_raster_is_one_image_with_a_sample_per_band() {
        let bytes = encode(&meta(16, 9, 9, SampleType::F32), ramp(16, 9, 9).view()).unwrap();
        let mut decoder = Decoder::new(Cursor::new(bytes.as_slice())).unwrap();
        assert_eq!(decoder.find_tag_unsigned::<u16>(Tag::SamplesPerPixel).unwrap(), Some(16));
        assert_eq!(decoder.find_tag_unsigned::<u16>(Tag::PlanarConfiguration).unwrap(), Some(1));
        assert_eq!(unsigned_list(&mut decoder, Tag::ExtraSamples).unwrap().map(|v| v.len()), Some(15));
        assert!(!decoder.more_images());
    }

    #[test]
    fn band_interleaved_raster_decodes_one_band_at_a_time() {
        let mut m = meta(4, 6, 6, SampleType::U16);
        m.interleave = Interleave::Band;
        let data = ramp(4, 6, 6);
        let bytes = encode(&m, data.view()).unwrap();

        {
            let mut decoder = Decoder::new(Cursor::new(bytes.as_slice())).unwrap();
            assert_eq!(decoder.find_tag_unsigned::<u16>(Tag::PlanarConfiguration).unwrap(), Some(2));
            assert!(!decoder.more_images());
        }

        let mut src = RasterSource::open(bytes).unwrap();
        assert_eq!(src.meta().interleave, Interleave::Band);
        assert_eq!(src.decoded_bands(), 0);
        let win = src.read_band_window(3, &Window::new(2, 1, 3, 2)).unwrap();
        assert_eq!(src.decoded_bands(), 1);
        assert_eq!(win.dim(), (2, 3));
        assert_eq!(win[[0, 0]], 300.0 + 6.0 + 2.0);
        assert_eq!(src.read_all().unwrap(), data);
    }

    #[test]
    fn pixel_interleaved_raster_decodes_all_bands_at_once() {
        let bytes = encode(&meta(4, 6, 6, SampleType::F32), ramp(4, 6, 6).view()).unwrap();
        let mut src = RasterSource::open(bytes).unwrap();
        src.read_band_window(0, &Window::new(0, 0, 1, 1)).unwrap();
        assert_eq!(src.decoded_bands(), 4);
    }

    #[test]
    fn reads_rgb_image_from_another_writer() {
        let samples: Vec<u8> = (0..4 * 4 * 3).map(|v| v as u8).collect();
        let mut cursor = Cursor::new(Vec::new());
        TiffEncoder::new(&mut cursor)
            .unwrap()
            .write_image::<colortype::RGB8>(4, 4, &samples)
            .unwrap();

        let (got_meta, got) = decode(cursor.into_inner()).unwrap();
        assert_eq!(got_meta.band_count, 3);
        assert_eq!(got_meta.sample_type, SampleType::U8);
        assert_eq!(got_meta.transform, GeoTransform::identity());
        let expected: Vec<f32> = samples.iter().map(|&v| f32::from(v)).collect();
        assert_eq!(got, deinterleave(&expected, 3, 4, 4));
    }

    #[test]
    fn reads_compressed_multi_strip_images() {
        let (w, h) = (5, 7);
        let samples: Vec<u16> = (0..w * h * 3).map(|v| (v * 311 % 65_000) as u16).collect();
        let expected: Vec<f32> = samples.iter().map(|&v| f32::from(v)).collect();
        let expected = deinterleave(&expected, 3, h, w);

        let mut deflated = Cursor::new(Vec::new());
        {
            let mut tiff = TiffEncoder::new(&mut deflated).unwrap();
            let mut image = tiff
                .new_image_with_compression::<colortype::RGB16, _>(w as u32, h as u32, Deflate::default())
                .unwrap();
            image.rows_per_strip(2).unwrap();
            image.write_data(&samples).unwrap();
        }
        assert_eq!(decode(deflated.into_inner()).unwrap().1, expected);

        let mut lzw = Cursor::new(Vec::new());
        TiffEncoder::new(&mut lzw)
            .unwrap()
            .write_image_with_compression::<colortype::RGB16, _>(w as u32, h as u32, Lzw, &samples)
            .unwrap();
        assert_eq!(decode(lzw.into_inner()).unwrap().1, expected);

        let mut packed = Cursor::new(Vec::new());
        TiffEncoder::new(&mut packed)
            .unwrap()
            .write_image_with_compression::<colortype::RGB16, _>(w as u32, h as u32, Packbits, &samples)
            .unwrap();
        assert_eq!(decode(packed.into_inner()).unwrap().1, expected);
    }

    /// Two-band u16 raster in 16x16 tiles, band sequential, with horizontal
    /// differencing.
    fn tiled_planar_with_predictor(data: &Array3<f32>) -> Vec<u8> {
        const TILE: usize = 16;
        let (bands, height, width) = data.dim();
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut tiff = TiffEncoder::new(&mut cursor).unwrap();
            let mut dir = tiff.new_directory().unwrap();
            let mut offsets = Vec::new();
            let mut counts = Vec::new();
            for band in data.outer_iter() {
                for ty in (0..height).step_by(TILE) {
                    for tx in (0..width).step_by(TILE) {
                        let mut tile = vec![0u16; TILE * TILE];
                        for r in 0..TILE.min(height - ty) {
                            for c in 0..TILE.min(width - tx) {
                                tile[r * TILE + c] = band[[ty + r, tx + c]] as u16;
                            }
                        }
                        for row in tile.chunks_mut(TILE) {
                            for c in (1..TILE).rev() {
                                row[c] = row[c].wrapping_sub(row[c - 1]);
                            }
                        }
                        offsets.push(dir.write_data(tile.as_slice()).unwrap() as u32);
                        counts.push((tile.len() * 2) as u32);
                    }
                }
            }
            dir.write_tag(Tag::ImageWidth, width as u32).unwrap();
            dir.write_tag(Tag::ImageLength, height as u32).unwrap();
            dir.write_tag(Tag::BitsPerSample, &vec![16u16; bands][..]).unwrap();
            dir.write_tag(Tag::Compression, 1u16).unwrap();
            dir.write_tag(Tag::PhotometricInterpretation, 1u16).unwrap();
            dir.write_tag(Tag::SamplesPerPixel, bands as u16).unwrap();
            dir.write_tag(Tag::PlanarConfiguration, 2u16).unwrap();
            dir.write_tag(Tag::Predictor, 2u16).unwrap();
            dir.write_tag(Tag::TileWidth, TILE as u32).unwrap();
            dir.write_tag(Tag::TileLength, TILE as u32).unwrap();
            dir.write_tag(Tag::TileOffsets, &offsets[..]).unwrap();
            dir.write_tag(Tag::TileByteCounts, &counts[..]).unwrap();
            dir.write_tag(Tag::ExtraSamples, &vec![0u16; bands - 1][..]).unwrap();
            dir.write_tag(Tag::SampleFormat, &vec![1u16; bands][..]).unwrap();
            dir.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn reads_tiled_band_interleaved_image_with_predictor() {
        let data = Array3::from_shape_fn((2, 18, 20), |(b, r, c)| ((b * 7919 + r * 131 + c * 17) % 60_000) as f32);
        let mut src = RasterSource::open(tiled_planar_with_predictor(&data)).unwrap();
        assert_eq!(src.meta().band_count, 2);
        assert_eq!(src.meta().interleave, Interleave::Band);
        assert_eq!(src.read_band_window(1, &Window::new(0, 0, 20, 18)).unwrap(), data.index_axis(Axis(0), 1));
        assert_eq!(src.decoded_bands(), 1);
        assert_eq!(src.read_all().unwrap(), data);
    }

    #[test]
    fn band_pages_are_still_read() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut tiff = TiffEncoder::new(&mut cursor).unwrap();
            for b in 0..3 {
                let band: Vec<f32> = (0..12).map(|v| (b * 100 + v) as f32).collect();
                tiff.write_image::<colortype::Gray32Float>(4, 3, &band).unwrap();
            }
        }
        let mut src = RasterSource::open(cursor.into_inner()).unwrap();
        assert_eq!(src.meta().band_count, 3);
        assert_eq!(src.read_band_window(2, &Window::new(1, 1, 1, 1)).unwrap()[[0, 0]], 205.0);
        assert_eq!(src.decoded_bands(), 1);
        assert_eq!(src.read_all().unwrap(), ramp(3, 3, 4));
    }

    #[test]
    fn crs_and_nodata_survive_a_roundtrip() {
        let mut m = meta(2, 3, 3, SampleType::I16);
        m.geokeys = wgs84();
        m.nodata = Some("-9999".into());
        let (got_meta, _) = decode(encode(&m, Array3::zeros((2, 3, 3)).view()).unwrap()).unwrap();
        assert_eq!(got_meta.geokeys, wgs84());
        assert_eq!(got_meta.nodata.as_deref(), Some("-9999"));

        let plain = decode(encode(&meta(1, 2, 2, SampleType::U8), Array3::zeros((1, 2, 2)).view()).unwrap()).unwrap();
        assert!(plain.0.geokeys.is_empty());
        assert_eq!(plain.0.nodata, None);
    }

    #[test]
    fn float_samples_survive_unchanged() {
        let m = meta(2, 4, 4, SampleType::F32);
        let data = Array3::from_shape_fn((2, 4, 4), |(b, r, c)| 0.125 * (b + r) as f32 - c as f32 / 3.0);
        let (got_meta, got) = decode(encode(&m, data.view()).unwrap()).unwrap();
        assert_eq!(got_meta.sample_type, SampleType::F32);
        assert_eq!(got, data);
    }

    #[test]
    fn integer_output_keeps_source_dtype() {
        let m = meta(1, 2, 2, SampleType::U8);
        let data = Array3::from_shape_vec((1, 2, 2), vec![0.0, 1.0, 254.6, 300.0]).unwrap();
        let (got_meta, got) = decode(encode(&m, data.view()).unwrap()).unwrap();
        assert_eq!(got_meta.sample_type, SampleType::U8);
        // float-to-int casts truncate and saturate
        assert_eq!(got.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 254.0, 255.0]);
    }

    #[test]
    fn tall_rasters_span_several_strips() {
        // 16 f32 bands, 64 bytes a pixel: rows of 512 pixels give 2 rows a strip
        let data = ramp(16, 5, 512);
        let bytes = encode(&meta(16, 5, 512, SampleType::F32), data.view()).unwrap();
        {
            let mut decoder = Decoder::new(Cursor::new(bytes.as_slice())).unwrap();
            assert_eq!(decoder.strip_count().unwrap(), 3);
        }
        assert_eq!(decode(bytes).unwrap().1, data);
    }

    #[test]
    fn rotated_transform_roundtrips() {
        let mut m = meta(1, 3, 3, SampleType::F32);
        m.transform = GeoTransform { a: 10.0, b: 2.0, c: 500.0, d: -1.5, e: -10.0, f: 900.0 };
        let (got_meta, _) = decode(encode(&m, Array3::zeros((1, 3, 3)).view()).unwrap()).unwrap();
        assert_eq!(got_meta.transform, m.transform);
    }

    #[test]
    fn window_transform_shifts_origin() {
        let t = GeoTransform::north_up(100.0, 50.0, 2.0, 3.0);
        let w = t.for_window(&Window::new(512, 1024, 512, 512));
        assert_relative_eq!(w.c, 100.0 + 2.0 * 512.0);
        assert_relative_eq!(w.f, 50.0 - 3.0 * 1024.0);
        assert_relative_eq!(w.a, 2.0);
        assert_relative_eq!(w.e, -3.0);
    }

    #[test]
    fn packbits_runs_and_literals() {
        let raw = [0xfe, 0xaa, 0x02, 0x80, 0x00, 0x2a, 0x80, 0xfd, 0x01];
        assert_eq!(unpack_bits(&raw, 10), vec![0xaa, 0xaa, 0xaa, 0x80, 0x00, 0x2a, 0x01, 0x01, 0x01, 0x01]);
    }

    #[test]
    fn out_of_range_reads_fail() {
        let m = meta(2, 4, 4, SampleType::U16);
        let mut src = RasterSource::open(encode(&m, Array3::zeros((2, 4, 4)).view()).unwrap()).unwrap();
        assert!(src.read_band_window(2, &Window::new(0, 0, 4, 4)).is_err());
        assert!(src.read_window(&Window::new(2, 2, 4, 4)).is_err());
    }

    #[test]
    fn garbage_is_not_a_raster() {
        assert!(RasterSource::open(b"definitely not a tiff".to_vec()).is_err());
    }

    #[test]
    fn encode_checks_shape_against_meta() {
        let m = meta(2, 4, 4, SampleType::F32);
        assert!(encode(&m, Array3::zeros((3, 4, 4)).view()).is_err());
    }
}
