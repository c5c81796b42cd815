//! Zonal statistics over the AOI window of a single-band raster.

use crate::aoi::Aoi;
use crate::crs::ProjCache;
use crate::error::{BandCalcError, Result};
use crate::io::geotiff;
use crate::window::compute_window;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZonalStats {
    /// Valid (non-nodata, finite) pixels inside the window
    pub count: usize,
    /// 0.0 when `count` is 0
    pub mean: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Summarize band 1 of `path` within the AOI.
pub fn zonal_stats(path: &Path, aoi: &Aoi, proj_cache: &ProjCache) -> Result<ZonalStats> {
    let source_id = path.display().to_string();
    let info = geotiff::describe(path).map_err(|e| BandCalcError::open(&source_id, format!("{:#}", e)))?;
    let transform = info
        .geo_transform
        .ok_or_else(|| BandCalcError::open(&source_id, "raster is not georeferenced"))?;
    let crs = info.crs.clone().unwrap_or_else(|| aoi.crs().to_string());

    let window = compute_window(&crs, &transform, (info.width, info.height), aoi, proj_cache)?;
    if window.is_empty() {
        return Err(BandCalcError::NoIntersection { source_id });
    }

    let data = geotiff::read_window(path, window).map_err(|e| BandCalcError::open(&source_id, format!("{:#}", e)))?;
    let band = data
        .band_f64(0)
        .ok_or_else(|| BandCalcError::open(&source_id, "raster has no bands"))?;

    let mut stats = ZonalStats {
        count: 0,
        mean: 0.0,
        min: None,
        max: None,
    };
    let mut sum = 0.0;
    for &v in band.iter() {
        if !v.is_finite() || info.nodata == Some(v) {
            continue;
        }
        stats.count += 1;
        sum += v;
        stats.min = Some(stats.min.map_or(v, |m| m.min(v)));
        stats.max = Some(stats.max.map_or(v, |m| m.max(v)));
    }
    if stats.count > 0 {
        stats.mean = sum / stats.count as f64;
    }

    tracing::debug!("Zonal stats for {} over {}: {:?}", source_id, window, stats);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::geotiff::fixtures;
    use crate::window::GeoTransform;
    use ndarray::Array2;

    #[test]
    fn test_stats_inside_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ndvi.tif");
        // 10x10 at origin (0, 10); value = col, nodata on row 0
        let mut data = Array2::from_shape_fn((10, 10), |(_, c)| c as f32);
        data.row_mut(0).fill(-9999.0);
        fixtures::write_band_f32(&path, &data, GeoTransform::north_up(0.0, 10.0, 1.0, 1.0), Some(-9999.0));

        // Rows 0..2, cols 2..4
        let aoi = Aoi::new(2.0, 8.0, 4.0, 10.0, "EPSG:4326").unwrap();
        let stats = zonal_stats(&path, &aoi, &ProjCache::new()).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean, 2.5);
        assert_eq!(stats.min, Some(2.0));
        assert_eq!(stats.max, Some(3.0));
    }

    #[test]
    fn test_stats_no_valid_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tif");
        let data = Array2::from_elem((4, 4), -9999.0f32);
        fixtures::write_band_f32(&path, &data, GeoTransform::north_up(0.0, 4.0, 1.0, 1.0), Some(-9999.0));

        let aoi = Aoi::new(0.0, 0.0, 4.0, 4.0, "EPSG:4326").unwrap();
        let stats = zonal_stats(&path, &aoi, &ProjCache::new()).unwrap();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.mean, 0.0);
        assert_eq!(stats.min, None);
    }

    #[test]
    fn test_stats_outside_raster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.tif");
        fixtures::write_band_f32(&path, &Array2::zeros((4, 4)), GeoTransform::north_up(0.0, 4.0, 1.0, 1.0), None);

        let aoi = Aoi::new(50.0, 50.0, 60.0, 60.0, "EPSG:4326").unwrap();
        let err = zonal_stats(&path, &aoi, &ProjCache::new()).unwrap_err();
        assert!(matches!(err, BandCalcError::NoIntersection { .. }));
    }
}
