//! Full-size tiling and normalization over a synthetic 16-band composite.

use approx::assert_relative_eq;
use flood_chips::config::COMPOSITE_BANDS;
use flood_chips::normalizer::{self, IMAGES_ARTIFACT, MASKS_ARTIFACT};
use flood_chips::raster::{self, GeoTransform, RasterMeta, SampleType};
use flood_chips::storage::TIFF_CONTENT_TYPE;
use flood_chips::{
    DiscardRule, LocalStorage, MemoryStorage, NormalizerConfig, Normalizer, Storage, Tiler, TilerConfig,
};
use ndarray::{s, Array3, Axis};
use tiff::tags::Tag;

const EXTENT: usize = 600;
const MASK: usize = 15;

fn transform() -> GeoTransform {
    GeoTransform::north_up(-85.0, 11.0, 0.0008, 0.0008)
}

/// 600x600 composite with a flood mask over `rows` x `cols`.
fn composite(rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) -> Array3<f32> {
    let mut data = Array3::from_shape_fn((COMPOSITE_BANDS.len(), EXTENT, EXTENT), |(b, r, c)| {
        ((b + 1) * 7 + (r * 13 + c * 5) % 101) as f32
    });
    data.index_axis_mut(Axis(0), 1)
        .indexed_iter_mut()
        .for_each(|((r, c), v)| *v = (((r / 100 + c / 100) % 3 + 1) * 10) as f32);
    let mut mask = data.index_axis_mut(Axis(0), MASK);
    mask.fill(0.0);
    mask.slice_mut(s![rows, cols]).fill(1.0);
    data
}

fn put(storage: &dyn Storage, name: &str, data: &Array3<f32>) {
    let meta = RasterMeta::new(EXTENT, EXTENT, COMPOSITE_BANDS.len(), SampleType::I16, transform());
    storage
        .write(name, &raster::encode(&meta, data.view()).unwrap(), TIFF_CONTENT_TYPE)
        .unwrap();
}

#[test]
fn flooded_top_left_yields_one_tile_then_one_batch() {
    let storage = MemoryStorage::new();
    let source = composite(0..300, 0..300);
    put(&storage, "raw/input_data_2020-11-02.tif", &source);

    let report = Tiler::new(&storage, TilerConfig::default())
        .unwrap()
        .tile("raw", "chips")
        .unwrap();
    assert_eq!(report.candidate_windows, 4);
    assert!(report.failed.is_empty());
    assert_eq!(report.tiles, vec!["chips/input_data_2020-11-02_tile_0.tif"]);

    // GDAL sees a single 16-band image
    let bytes = storage.read(&report.tiles[0]).unwrap();
    {
        let mut decoder = tiff::decoder::Decoder::new(std::io::Cursor::new(bytes.as_slice())).unwrap();
        assert_eq!(decoder.find_tag_unsigned::<u16>(Tag::SamplesPerPixel).unwrap(), Some(16));
        assert!(!decoder.more_images());
    }

    let (meta, tile) = raster::decode(bytes).unwrap();
    assert_eq!((meta.band_count, meta.height, meta.width), (16, 512, 512));
    assert_eq!(meta.sample_type, SampleType::I16);
    assert_eq!(meta.transform, transform());
    assert_eq!(tile, source.slice(s![.., ..512, ..512]));

    let batch = Normalizer::new(&storage, NormalizerConfig::default())
        .unwrap()
        .normalize("chips", "processed", None)
        .unwrap()
        .unwrap();
    assert_eq!(batch.categories, vec![10, 20, 30]);
    assert_eq!(batch.images_shape, [1, (16 - 2) + 3, 512, 512]);
    assert_eq!(batch.masks_shape, [1, 1, 512, 512]);

    let images = normalizer::decode_npy(&storage.read(&format!("processed/{}", IMAGES_ARTIFACT)).unwrap()).unwrap();
    let masks = normalizer::decode_npy(&storage.read(&format!("processed/{}", MASKS_ARTIFACT)).unwrap()).unwrap();
    assert_eq!(images.dim(), (1, 17, 512, 512));
    assert_eq!(masks.sum(), (300 * 300) as f32);
    for channel in images.slice(s![0, ..14, .., ..]).outer_iter() {
        let max = channel.fold(f32::MIN, |m, &v| m.max(v));
        let min = channel.fold(f32::MAX, |m, &v| m.min(v));
        assert_relative_eq!(min, 0.0);
        assert_relative_eq!(max, 1.0);
    }
    assert_eq!(storage.content_type("processed/processed_data/masks.npy").as_deref(), Some("application/octet-stream"));
}

#[test]
fn border_tile_is_zero_padded() {
    let storage = MemoryStorage::new();
    let source = composite(550..600, 520..560);
    put(&storage, "raw/scene.tif", &source);

    let report = Tiler::new(&storage, TilerConfig::default())
        .unwrap()
        .tile("raw", "chips")
        .unwrap();
    assert_eq!(report.tiles, vec!["chips/scene_tile_3.tif"]);

    let (meta, tile) = raster::decode(storage.read(&report.tiles[0]).unwrap()).unwrap();
    assert_eq!((meta.height, meta.width), (512, 512));
    let (x, y) = transform().apply(512.0, 512.0);
    assert_relative_eq!(meta.transform.c, x);
    assert_relative_eq!(meta.transform.f, y);

    let valid = EXTENT - 512;
    assert_eq!(tile.slice(s![.., ..valid, ..valid]), source.slice(s![.., 512.., 512..]));
    assert!(tile.slice(s![.., valid.., ..]).iter().all(|&v| v == 0.0));
    assert!(tile.slice(s![.., .., valid..]).iter().all(|&v| v == 0.0));
}

#[test]
fn tile_empty_rule_keeps_dry_windows_with_data() {
    let storage = MemoryStorage::new();
    put(&storage, "raw/scene.tif", &composite(0..300, 0..300));

    let config = TilerConfig {
        discard: DiscardRule::TileEmpty,
        ..Default::default()
    };
    let report = Tiler::new(&storage, config).unwrap().tile("raw", "chips").unwrap();
    assert_eq!(report.tiles.len(), 4);
}

#[test]
fn local_bucket_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(root.path());
    put(&storage, "deep_learning/data/raw/peru/input_data_2021-01-05.tif", &composite(0..300, 0..300));

    let report = Tiler::new(&storage, TilerConfig::default())
        .unwrap()
        .tile("deep_learning/data/raw/peru", "deep_learning/data/chips/peru")
        .unwrap();
    assert_eq!(report.tiles.len(), 1);
    assert!(root.path().join("deep_learning/data/chips/peru/input_data_2021-01-05_tile_0.tif").is_file());

    let batch = Normalizer::new(&storage, NormalizerConfig::default())
        .unwrap()
        .normalize("deep_learning/data/chips/peru", "deep_learning/data/processed/peru", None)
        .unwrap()
        .unwrap();
    assert_eq!(batch.tiles.len(), 1);
    assert!(root.path().join("deep_learning/data/processed/peru/processed_data/images.npy").is_file());
}
