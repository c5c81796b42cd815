//! AOI crops of single rasters.
//!
//! ## Flow
//!
//! 1. Open the source and read its georeferencing
//! 2. Compute the AOI window (empty window: `NoIntersection`, nothing written)
//! 3. Read only that window
//! 4. Optionally resample to the configured resolution
//! 5. Stage the GeoTIFF next to the destination and rename it into place
//!
//! Cancellation is checked after open, after read, and before the rename.
//! Writers to the same destination are serialized by a per-path lock.

use crate::aoi::Aoi;
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::crs::ProjCache;
use crate::error::{BandCalcError, Result};
use crate::io::{geotiff, CogReader, GeoTiffOptions, RasterData, RasterProfile, RasterSource, StagedFile};
use crate::pipeline::Metrics;
use crate::transform::{resample, target_grid};
use crate::window::{compute_window, GeoTransform, PixelWindow};
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A written crop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchOutcome {
    pub path: PathBuf,
    /// Window read from the source, in source pixels
    pub window: PixelWindow,
    /// Written raster size (differs from the window when resampled)
    pub width: usize,
    pub height: usize,
    pub resampled: bool,
}

/// Pixels of one window plus everything needed to georeference them.
struct Crop {
    data: RasterData,
    window: PixelWindow,
    geo_transform: GeoTransform,
    crs: String,
    nodata: Option<f64>,
    tags: Vec<(String, String)>,
}

/// Crops remote or local rasters to an AOI and writes them as GeoTIFF.
pub struct CogFetcher {
    reader: CogReader,
    options: GeoTiffOptions,
    target_resolution: Option<f64>,
    metrics: Option<Arc<Metrics>>,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl CogFetcher {
    pub fn new(config: &Config) -> Self {
        Self {
            reader: CogReader::new(config.network.clone(), config.fetch.metadata_cache_entries),
            options: GeoTiffOptions::from_config(&config.output),
            target_resolution: config.fetch.target_resolution,
            metrics: None,
            locks: DashMap::new(),
        }
    }

    pub fn with_metrics(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            reader: CogReader::with_metrics(
                config.network.clone(),
                config.fetch.metadata_cache_entries,
                metrics.clone(),
            ),
            options: GeoTiffOptions::from_config(&config.output),
            target_resolution: config.fetch.target_resolution,
            metrics: Some(metrics),
            locks: DashMap::new(),
        }
    }

    /// Override the resampling target (`None` keeps native resolution).
    pub fn with_target_resolution(mut self, target_resolution: Option<f64>) -> Self {
        self.target_resolution = target_resolution;
        self
    }

    /// Crop `source` to `aoi` and write the result to `dest`.
    ///
    /// Reads go through range requests, so only the tiles under the AOI are
    /// transferred.
    pub async fn fetch_cropped(
        &self,
        source: &RasterSource,
        aoi: &Aoi,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let source_id = source.to_string();
        tracing::info!("Fetching {} -> {}", source_id, dest.display());

        let result = async {
            let crop = self.read_remote_crop(source, &source_id, aoi, cancel).await?;
            self.persist_crop(&source_id, crop, dest, cancel).await
        }
        .await;

        self.finish(&source_id, result, dest).await
    }

    /// Crop an already-downloaded raster. No network access.
    pub async fn crop_local_file_to_aoi(
        &self,
        local_path: &Path,
        aoi: &Aoi,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let source_id = local_path.display().to_string();
        tracing::info!("Cropping local {} -> {}", source_id, dest.display());

        let result = async {
            let path = local_path.to_path_buf();
            let aoi = aoi.clone();
            let token = cancel.clone();
            let crop = tokio::task::spawn_blocking(move || read_local_crop(&path, &aoi, &token))
                .await
                .map_err(|e| BandCalcError::open(&source_id, format!("read task failed: {}", e)))??;
            cancel.check()?;
            self.persist_crop(&source_id, crop, dest, cancel).await
        }
        .await;

        self.finish(&source_id, result, dest).await
    }

    async fn read_remote_crop(
        &self,
        source: &RasterSource,
        source_id: &str,
        aoi: &Aoi,
        cancel: &CancellationToken,
    ) -> Result<Crop> {
        let cog = self
            .reader
            .open(source)
            .await
            .map_err(|e| BandCalcError::open(source_id, format!("{:#}", e)))?;
        cancel.check()?;

        let meta = cog.metadata();
        let geo_transform = meta
            .geo_transform
            .ok_or_else(|| BandCalcError::open(source_id, "raster has no georeferencing"))?;
        let crs = raster_crs(source_id, meta.crs.as_deref(), aoi);
        let window = window_for(source_id, &crs, &geo_transform, (meta.width, meta.height), aoi)?;

        let data = self
            .reader
            .read_window(&cog, window)
            .await
            .map_err(|e| BandCalcError::open(source_id, format!("{:#}", e)))?;
        cancel.check()?;

        Ok(Crop {
            data,
            window,
            geo_transform: geo_transform.windowed(window.col_off, window.row_off),
            crs,
            nodata: meta.nodata,
            tags: meta.tags.clone(),
        })
    }

    /// Resample if configured, then stage and commit under the destination lock.
    async fn persist_crop(
        &self,
        source_id: &str,
        crop: Crop,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let _guard = self.lock_dest(dest).await;
        cancel.check()?;

        let start = Instant::now();
        let window = crop.window;
        let options = self.options.clone();
        let target_resolution = self.target_resolution;
        let target = dest.to_path_buf();
        let token = cancel.clone();
        let source = source_id.to_string();
        let (width, height, resampled) =
            tokio::task::spawn_blocking(move || write_crop(&source, crop, target_resolution, &target, &options, &token))
                .await
                .map_err(|e| BandCalcError::write(dest, format!("write task failed: {}", e)))??;

        if let Some(ref m) = self.metrics {
            m.add_write_time(start.elapsed());
        }
        tracing::info!(
            "Wrote {}x{} crop of {} to {}{}",
            width,
            height,
            source_id,
            dest.display(),
            if resampled { " (resampled)" } else { "" }
        );

        Ok(FetchOutcome {
            path: dest.to_path_buf(),
            window,
            width,
            height,
            resampled,
        })
    }

    /// Record the outcome. A canceled fetch leaves no file at `dest`.
    async fn finish(&self, source_id: &str, result: Result<FetchOutcome>, dest: &Path) -> Result<FetchOutcome> {
        match &result {
            Ok(_) => {
                if let Some(ref m) = self.metrics {
                    m.add_band_fetched();
                }
            }
            Err(BandCalcError::NoIntersection { .. }) => {
                tracing::info!("AOI does not intersect {}, skipping", source_id);
                if let Some(ref m) = self.metrics {
                    m.add_window_empty();
                }
            }
            Err(BandCalcError::Canceled) => {
                let _guard = self.lock_dest(dest).await;
                match tokio::fs::remove_file(dest).await {
                    Ok(()) => tracing::debug!("Removed {} after cancel", dest.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!("Failed to remove {} after cancel: {}", dest.display(), e),
                }
                tracing::warn!("Fetch of {} canceled", source_id);
            }
            Err(_) => {
                if let Some(ref m) = self.metrics {
                    m.add_band_failed();
                }
            }
        }
        result
    }

    async fn lock_dest(&self, dest: &Path) -> DestGuard<'_> {
        let lock = self.locks.entry(dest.to_path_buf()).or_default().clone();
        DestGuard {
            locks: &self.locks,
            dest: dest.to_path_buf(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

/// Exclusive hold on one destination path.
///
/// On release the path's lock leaves the map unless another writer still
/// holds a clone of it, so the map only tracks paths in use.
struct DestGuard<'a> {
    locks: &'a DashMap<PathBuf, Arc<Mutex<()>>>,
    dest: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DestGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.remove_if(&self.dest, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// The raster's CRS, falling back to the AOI's when the raster declares none.
fn raster_crs(source_id: &str, crs: Option<&str>, aoi: &Aoi) -> String {
    match crs {
        Some(crs) => crs.to_string(),
        None => {
            tracing::warn!("{} has no CRS, assuming AOI CRS {}", source_id, aoi.crs());
            aoi.crs().to_string()
        }
    }
}

/// AOI window on a raster. Builds its own `ProjCache` so none is held across an await.
fn window_for(
    source_id: &str,
    raster_crs: &str,
    transform: &GeoTransform,
    size: (usize, usize),
    aoi: &Aoi,
) -> Result<PixelWindow> {
    let proj_cache = ProjCache::new();
    let window = compute_window(raster_crs, transform, size, aoi, &proj_cache)?;
    if window.is_empty() {
        return Err(BandCalcError::NoIntersection {
            source_id: source_id.to_string(),
        });
    }
    tracing::debug!("Window for {}: {}", source_id, window);
    Ok(window)
}

/// GDAL read of a local file's AOI window. Works for untiled files too.
fn read_local_crop(path: &Path, aoi: &Aoi, cancel: &CancellationToken) -> Result<Crop> {
    let source_id = path.display().to_string();
    let info = geotiff::describe(path).map_err(|e| BandCalcError::open(&source_id, format!("{:#}", e)))?;
    cancel.check()?;

    let geo_transform = info
        .geo_transform
        .ok_or_else(|| BandCalcError::open(&source_id, "raster has no georeferencing"))?;
    let crs = raster_crs(&source_id, info.crs.as_deref(), aoi);
    let window = window_for(&source_id, &crs, &geo_transform, (info.width, info.height), aoi)?;

    let data = geotiff::read_window(path, window).map_err(|e| BandCalcError::open(&source_id, format!("{:#}", e)))?;

    Ok(Crop {
        data,
        window,
        geo_transform: geo_transform.windowed(window.col_off, window.row_off),
        crs,
        nodata: info.nodata,
        tags: info.tags,
    })
}

/// Returns the written `(width, height, resampled)`.
fn write_crop(
    source_id: &str,
    crop: Crop,
    target_resolution: Option<f64>,
    dest: &Path,
    options: &GeoTiffOptions,
    cancel: &CancellationToken,
) -> Result<(usize, usize, bool)> {
    let (_, height, width) = crop.data.dim();
    let grid = target_resolution.and_then(|res| target_grid(&crop.geo_transform, width, height, res));

    let (data, geo_transform, resampled) = match grid {
        Some(grid) => match resample(&crop.data, &crop.geo_transform, Some(&crop.crs), crop.nodata, &grid) {
            Ok(data) => (data, grid.geo_transform, true),
            Err(e) => {
                tracing::warn!(
                    "Resampling {} to {}x{} failed, keeping native resolution: {:#}",
                    source_id,
                    grid.width,
                    grid.height,
                    e
                );
                (crop.data, crop.geo_transform, false)
            }
        },
        None => (crop.data, crop.geo_transform, false),
    };

    let (bands, out_height, out_width) = data.dim();
    let options = if bands == 3 && matches!(data, RasterData::UInt8(_)) {
        options.clone().rgb()
    } else {
        options.clone()
    };
    let profile = RasterProfile::new(geo_transform, Some(crop.crs))
        .with_nodata(crop.nodata)
        .with_tags(crop.tags);

    let staged = StagedFile::new(dest).map_err(|e| BandCalcError::write(dest, format!("{:#}", e)))?;
    geotiff::write_raster(staged.path(), &data, &profile, &options)
        .map_err(|e| BandCalcError::write(dest, format!("{:#}", e)))?;
    cancel.check()?;
    staged
        .commit()
        .map_err(|e| BandCalcError::write(dest, format!("{:#}", e)))?;

    Ok((out_width, out_height, resampled))
}
