//! End-to-end tests across fetcher, acquirer, kernels and scheduler.
//!
//! Tests cover:
//! 1. NDVI product from local band files through the scheduler
//! 2. Predefined index over a partially available asset
//! 3. Custom formulas, valid and invalid
//! 4. Visual product from a full local copy
//! 5. Concurrent writers to one destination
//! 6. False color determinism across runs
//! 7. Custom names that would escape the cache directory

use crate::aoi::Aoi;
use crate::asset::RasterAsset;
use crate::calc::{Coefficients, PredefinedIndex, OUTPUT_NODATA};
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::io::geotiff::fixtures;
use crate::io::{read_band, RasterSource};
use crate::pipeline::{
    CalculationScheduler, CogFetcher, Metrics, ProductKind, ProductProcessor, TaskEvent, TaskKey, TaskOutcome,
};
use crate::window::GeoTransform;
use ndarray::{Array2, Array3};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

const ASSET_ID: &str = "S2B_MSIL2A_20240612";

fn grid() -> GeoTransform {
    GeoTransform::north_up(0.0, 64.0, 1.0, 1.0)
}

fn aoi() -> Aoi {
    Aoi::new(8.0, 8.0, 40.0, 40.0, "EPSG:4326").unwrap()
}

/// Write 64x64 band files and an asset record pointing at them.
fn write_asset(dir: &Path, bands: &[(&str, f32)]) -> RasterAsset {
    let mut properties = serde_json::json!({ "stac_id": ASSET_ID, "cloud": 1.5 });
    for (name, scale) in bands {
        let path = dir.join(format!("{}.tif", name));
        let data = Array2::from_shape_fn((64, 64), |(r, c)| (1 + r + c) as f32 * scale);
        fixtures::write_band_f32(&path, &data, grid(), Some(0.0));
        properties[format!("asset_{}", name)] = serde_json::Value::String(path.display().to_string());
    }
    RasterAsset::from_json(&properties.to_string()).unwrap()
}

fn setup(cache: &Path) -> (Arc<ProductProcessor>, CalculationScheduler, mpsc::UnboundedReceiver<TaskEvent>, Arc<Metrics>) {
    let mut config = Config::default();
    config.cache.dir = cache.to_path_buf();
    let metrics = Metrics::new();
    let processor = Arc::new(ProductProcessor::new(Arc::new(config.clone()), metrics.clone(), Handle::current()));
    let (tx, rx) = mpsc::unbounded_channel();
    let scheduler = CalculationScheduler::new(config.calculation, Handle::current())
        .with_events(tx)
        .with_metrics(metrics.clone());
    (processor, scheduler, rx, metrics)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn progress(events: &[TaskEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ndvi_product_end_to_end() {
    let src = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let asset = write_asset(src.path(), &[("nir", 3.0), ("red", 1.0)]);
    let (processor, scheduler, mut rx, metrics) = setup(cache.path());

    let handle = processor.submit(&scheduler, asset, ProductKind::Ndvi, aoi());
    assert_eq!(handle.key(), &TaskKey::new(ASSET_ID, "ndvi"));
    let outcome = scheduler.await_completion(handle, Duration::from_secs(60)).await;

    let path = match outcome {
        TaskOutcome::Completed(path) => path,
        other => panic!("expected completion, got {:?}", other),
    };
    assert!(path.starts_with(cache.path().join(ASSET_ID)));

    // (3x - x) / (3x + x) = 0.5 everywhere
    let ndvi = read_band(&path).unwrap();
    assert_eq!(ndvi.shape(), (32, 32));
    assert_eq!(ndvi.nodata, Some(OUTPUT_NODATA));
    assert!(ndvi.data.iter().all(|v| (v - 0.5).abs() < 1e-6));
    assert_eq!(ndvi.geo_transform, GeoTransform::north_up(8.0, 40.0, 1.0, 1.0));

    // Cropped bands stay in the cache under their canonical names
    assert!(cache.path().join(ASSET_ID).join(format!("{}_nir_aoi.tif", ASSET_ID)).exists());
    assert!(cache.path().join(ASSET_ID).join(format!("{}_red_aoi.tif", ASSET_ID)).exists());

    let events = drain(&mut rx);
    assert_eq!(progress(&events), [10, 20, 40, 70, 90, 100]);
    assert!(matches!(events.last(), Some(TaskEvent::Completed { .. })));

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.bands_fetched, 2);
    assert_eq!(snapshot.products_written, 1);
    assert_eq!(snapshot.calculations_completed, 1);

    assert_eq!(processor.find_cached_product(ASSET_ID, "ndvi"), Some(path));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_band_fails_with_key() {
    let src = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    // No blue band in the record
    let asset = write_asset(src.path(), &[("nir", 3.0), ("red", 1.0)]);
    let (processor, scheduler, mut rx, _) = setup(cache.path());

    let handle = processor.submit(&scheduler, asset, ProductKind::Predefined(PredefinedIndex::Evi), aoi());
    let outcome = scheduler.await_completion(handle, Duration::from_secs(60)).await;
    assert_eq!(outcome, TaskOutcome::Failed("missing required bands: blue".to_string()));

    let failed = drain(&mut rx).into_iter().find_map(|e| match e {
        TaskEvent::Failed { key, message } => Some((key, message)),
        _ => None,
    });
    assert_eq!(
        failed,
        Some((TaskKey::new(ASSET_ID, "evi"), "missing required bands: blue".to_string()))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_formula_after_acquire_writes_no_product() {
    let src = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let asset = write_asset(src.path(), &[("nir", 3.0), ("red", 1.0)]);
    let (processor, scheduler, _rx, _) = setup(cache.path());

    let kind = ProductKind::Custom {
        name: "wetness".to_string(),
        formula: "ndwi + 1".to_string(),
        coefficients: Coefficients::new(),
        bands: vec!["nir".to_string(), "red".to_string()],
    };
    let handle = processor.submit(&scheduler, asset, kind, aoi());
    match scheduler.await_completion(handle, Duration::from_secs(60)).await {
        TaskOutcome::Failed(message) => assert!(message.contains("ndwi"), "{}", message),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(processor.find_cached_product(ASSET_ID, "wetness"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_custom_formula_with_coefficients() {
    let src = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let asset = write_asset(src.path(), &[("nir", 3.0), ("red", 1.0), ("green", 2.0)]);
    let (processor, scheduler, _rx, _) = setup(cache.path());

    let mut coefficients = Coefficients::new();
    coefficients.insert("gain".to_string(), 0.5);
    let kind = ProductKind::Custom {
        name: "ratio".to_string(),
        formula: "gain * nir / green".to_string(),
        coefficients,
        bands: vec!["nir".to_string(), "green".to_string()],
    };
    let handle = processor.submit(&scheduler, asset, kind, aoi());
    let path = match scheduler.await_completion(handle, Duration::from_secs(60)).await {
        TaskOutcome::Completed(path) => path,
        other => panic!("expected completion, got {:?}", other),
    };
    // 0.5 * 3x / 2x = 0.75
    let out = read_band(&path).unwrap();
    assert!(out.data.iter().all(|v| (v - 0.75).abs() < 1e-6));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_visual_product_from_local_copy() {
    let cache = tempfile::tempdir().unwrap();
    let asset = RasterAsset::from_json(&format!(
        r#"{{"stac_id": "{}", "visual": "https://example.invalid/tiles/TCI.tif"}}"#,
        ASSET_ID
    ))
    .unwrap();

    // A full local copy short-circuits the (unreachable) URL
    let local = asset.local_path(cache.path(), "visual").unwrap();
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    let rgb = Array3::from_shape_fn((3, 64, 64), |(b, r, c)| ((b * 80 + r + c) % 256) as u8);
    fixtures::write_tiled(&local, &rgb, grid(), "EPSG:4326", None);

    let (processor, scheduler, mut rx, _) = setup(cache.path());
    let handle = processor.submit(&scheduler, asset, ProductKind::Visual, aoi());
    let path = match scheduler.await_completion(handle, Duration::from_secs(60)).await {
        TaskOutcome::Completed(path) => path,
        other => panic!("expected completion, got {:?}", other),
    };

    let ds = gdal::Dataset::open(&path).unwrap();
    assert_eq!(ds.raster_count(), 3);
    assert_eq!(ds.raster_size(), (32, 32));

    // No kernel stage: straight from the resolved source to the written crop
    assert_eq!(progress(&drain(&mut rx)), [10, 20, 70, 90, 100]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_custom_name_cannot_escape_cache() {
    let src = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let cache = root.path().join("cache");
    let asset = write_asset(src.path(), &[("nir", 3.0), ("red", 1.0)]);
    let (processor, scheduler, mut rx, _) = setup(&cache);

    let kind = ProductKind::Custom {
        name: "../../x".to_string(),
        formula: "nir / red".to_string(),
        coefficients: Coefficients::new(),
        bands: vec!["nir".to_string(), "red".to_string()],
    };
    let handle = processor.submit(&scheduler, asset, kind, aoi());
    match scheduler.await_completion(handle, Duration::from_secs(60)).await {
        TaskOutcome::Failed(message) => assert!(message.starts_with("validation failed"), "{}", message),
        other => panic!("expected failure, got {:?}", other),
    }
    // Rejected before any band was fetched or file written
    assert!(progress(&drain(&mut rx)).is_empty());
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_false_color_product_is_deterministic() {
    let src = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let asset = write_asset(src.path(), &[("nir", 3.0), ("red", 1.0), ("green", 2.0)]);
    let (processor, scheduler, _rx, _) = setup(cache.path());

    let mut outputs = Vec::new();
    for _ in 0..2 {
        let handle = processor.submit(&scheduler, asset.clone(), ProductKind::FalseColor, aoi());
        match scheduler.await_completion(handle, Duration::from_secs(60)).await {
            TaskOutcome::Completed(path) => {
                let ds = gdal::Dataset::open(&path).unwrap();
                let pixels: Vec<Vec<u8>> = (1..=3)
                    .map(|b| {
                        ds.rasterband(b)
                            .unwrap()
                            .read_as::<u8>((0, 0), (32, 32), (32, 32), None)
                            .unwrap()
                            .data()
                            .to_vec()
                    })
                    .collect();
                outputs.push(pixels);
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_writers_same_destination() {
    let src = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let path = src.path().join("nir.tif");
    let data = Array2::from_shape_fn((64, 64), |(r, c)| (r * 64 + c) as f32);
    fixtures::write_band_f32(&path, &data, grid(), None);

    let fetcher = Arc::new(CogFetcher::new(&Config::default()));
    let dest = cache.path().join("shared_aoi.tif");
    let source = RasterSource::Local(path);

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let fetcher = fetcher.clone();
            let source = source.clone();
            let dest = dest.clone();
            tokio::spawn(async move {
                fetcher
                    .fetch_cropped(&source, &aoi(), &dest, &CancellationToken::new())
                    .await
                    .map(|o| o.path)
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), dest);
    }

    let out = read_band(&dest).unwrap();
    assert_eq!(out.shape(), (32, 32));
    // Destination plus nothing else: no stray partial files
    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 1);
}
