//! AOI to pixel-window conversion.
//!
//! Given a raster's CRS, affine transform and size, [`compute_window`] finds
//! the pixel rectangle covered by an AOI:
//! 1. Reproject the AOI bounds into the raster CRS (densified edges)
//! 2. Map the bounds to fractional (col, row) through the inverse transform
//! 3. Floor the start, ceil the end
//! 4. Clamp to `[0, width] x [0, height]`
//!
//! A window with no area is returned as [`PixelWindow::EMPTY`], never as an error.

use crate::aoi::Aoi;
use crate::crs::{self, Bounds, ProjCache};
use crate::error::{BandCalcError, Result};
use serde::Serialize;

/// Tolerance for snapping fractional pixel edges to the nearest integer.
const EDGE_SNAP: f64 = 1e-6;

/// Affine geotransform for converting between pixel and world coordinates.
///
/// ```text
/// x_world = a * col + b * row + c
/// y_world = d * col + e * row + f
/// ```
///
/// - `a` is the pixel width
/// - `e` is the pixel height (negative for north-up images)
/// - `c`, `f` are the world coordinates of the upper-left corner of pixel (0, 0)
/// - `b` and `d` are rotation terms, zero for north-up rasters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl GeoTransform {
    /// North-up transform from an origin and pixel size.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            a: pixel_width,
            b: 0.0,
            c: origin_x,
            d: 0.0,
            e: -pixel_height.abs(),
            f: origin_y,
        }
    }

    /// Create a GeoTransform from the 16-element ModelTransformationTag matrix.
    ///
    /// The matrix is a 4x4 affine transform in row-major order:
    /// ```text
    /// | a  b  0  c |
    /// | d  e  0  f |
    /// | 0  0  0  0 |
    /// | 0  0  0  1 |
    /// ```
    pub fn from_model_transformation(matrix: &[f64]) -> Option<Self> {
        if matrix.len() < 8 {
            return None;
        }
        Some(Self {
            a: matrix[0],
            b: matrix[1],
            c: matrix[3],
            d: matrix[4],
            e: matrix[5],
            f: matrix[7],
        })
    }

    /// Create a GeoTransform from ModelPixelScaleTag + ModelTiepointTag.
    ///
    /// This is what GDAL writes for north-up rasters. The tiepoint ties raster
    /// point `(i, j)` to world point `(x, y)`; the y scale is stored positive.
    pub fn from_pixel_scale_tiepoint(scale: &[f64], tiepoint: &[f64]) -> Option<Self> {
        if scale.len() < 2 || tiepoint.len() < 6 {
            return None;
        }
        let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
        Some(Self {
            a: scale[0],
            b: 0.0,
            c: x - i * scale[0],
            d: 0.0,
            e: -scale[1],
            f: y + j * scale[1],
        })
    }

    /// From GDAL order `[c, a, b, f, d, e]`.
    pub fn from_gdal(gt: &[f64; 6]) -> Self {
        Self {
            a: gt[1],
            b: gt[2],
            c: gt[0],
            d: gt[4],
            e: gt[5],
            f: gt[3],
        }
    }

    /// To GDAL order `[c, a, b, f, d, e]`.
    pub fn to_gdal(&self) -> [f64; 6] {
        [self.c, self.a, self.b, self.f, self.d, self.e]
    }

    /// Convert world coordinates to pixel coordinates.
    ///
    /// Returns (column, row) as floating point for sub-pixel precision.
    #[inline]
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        // Inverse of affine transform (assuming no rotation, b=0, d=0)
        let col = (x - self.c) / self.a;
        let row = (y - self.f) / self.e;
        (col, row)
    }

    /// Convert pixel coordinates to world coordinates.
    #[inline]
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        let x = self.a * col + self.b * row + self.c;
        let y = self.d * col + self.e * row + self.f;
        (x, y)
    }

    /// Transform of a sub-window whose pixel (0, 0) is `(col_off, row_off)` here.
    pub fn windowed(&self, col_off: usize, row_off: usize) -> Self {
        let (c, f) = self.pixel_to_world(col_off as f64, row_off as f64);
        Self { c, f, ..*self }
    }

    /// Transform for the same extent sampled `factor_x`/`factor_y` times denser.
    pub fn scaled(&self, factor_x: f64, factor_y: f64) -> Self {
        Self {
            a: self.a / factor_x,
            b: self.b / factor_y,
            d: self.d / factor_x,
            e: self.e / factor_y,
            ..*self
        }
    }

    /// Absolute pixel size `(x, y)`.
    pub fn resolution(&self) -> (f64, f64) {
        (self.a.abs(), self.e.abs())
    }

    #[inline]
    pub fn is_north_up(&self) -> bool {
        self.b == 0.0 && self.d == 0.0
    }
}

/// A pixel window within a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl PixelWindow {
    /// Sentinel for "AOI does not intersect raster".
    pub const EMPTY: PixelWindow = PixelWindow {
        col_off: 0,
        row_off: 0,
        width: 0,
        height: 0,
    };

    pub fn new(col_off: usize, row_off: usize, width: usize, height: usize) -> Self {
        Self {
            col_off,
            row_off,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// World bounds `[min_x, min_y, max_x, max_y]` of this window.
    pub fn bounds(&self, transform: &GeoTransform) -> Bounds {
        let (x0, y0) = transform.pixel_to_world(self.col_off as f64, self.row_off as f64);
        let (x1, y1) = transform.pixel_to_world(
            (self.col_off + self.width) as f64,
            (self.row_off + self.height) as f64,
        );
        [x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)]
    }
}

impl std::fmt::Display for PixelWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "col={} row={} {}x{}",
            self.col_off, self.row_off, self.width, self.height
        )
    }
}

/// Compute the pixel window an AOI covers on a raster.
///
/// Pure coordinate math: no I/O, deterministic. Errors only when the AOI
/// cannot be projected into the raster CRS or the raster is rotated.
pub fn compute_window(
    raster_crs: &str,
    transform: &GeoTransform,
    raster_size: (usize, usize),
    aoi: &Aoi,
    proj_cache: &ProjCache,
) -> Result<PixelWindow> {
    if !transform.is_north_up() {
        return Err(BandCalcError::Crs(format!(
            "rotated rasters are not supported (b={}, d={})",
            transform.b, transform.d
        )));
    }
    if transform.a == 0.0 || transform.e == 0.0 {
        return Err(BandCalcError::Crs("raster transform has zero pixel size".to_string()));
    }

    let bounds = crs::transform_bounds_with_densification(
        aoi.bounds(),
        aoi.crs(),
        raster_crs,
        proj_cache,
        crs::DEFAULT_DENSIFY_SAMPLES,
    )
    .map_err(|e| BandCalcError::Crs(format!("{:#}", e)))?;

    let (c0, r0) = transform.world_to_pixel(bounds[0], bounds[3]);
    let (c1, r1) = transform.world_to_pixel(bounds[2], bounds[1]);

    let col_start = snap(c0.min(c1)).floor();
    let col_end = snap(c0.max(c1)).ceil();
    let row_start = snap(r0.min(r1)).floor();
    let row_end = snap(r0.max(r1)).ceil();

    let (width, height) = raster_size;
    let col_start = col_start.max(0.0);
    let row_start = row_start.max(0.0);
    let col_end = col_end.min(width as f64);
    let row_end = row_end.min(height as f64);

    if !(col_end > col_start && row_end > row_start) {
        tracing::debug!("AOI {} does not intersect {}x{} raster", aoi, width, height);
        return Ok(PixelWindow::EMPTY);
    }

    let window = PixelWindow::new(
        col_start as usize,
        row_start as usize,
        (col_end - col_start) as usize,
        (row_end - row_start) as usize,
    );
    tracing::debug!("AOI {} -> window {}", aoi, window);
    Ok(window)
}

fn snap(v: f64) -> f64 {
    let rounded = v.round();
    if (v - rounded).abs() < EDGE_SNAP {
        rounded
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::codes;

    fn unit_grid(origin_y: f64) -> GeoTransform {
        GeoTransform::north_up(0.0, origin_y, 1.0, 1.0)
    }

    #[test]
    fn test_contained_aoi_round_trips_within_a_pixel() {
        let cache = ProjCache::new();
        let gt = unit_grid(1000.0);
        let aoi = Aoi::new(100.0, 100.0, 200.0, 200.0, codes::WGS84).unwrap();

        let window = compute_window(codes::WGS84, &gt, (1000, 1000), &aoi, &cache).unwrap();
        assert_eq!(window, PixelWindow::new(100, 800, 100, 100));

        let back = window.bounds(&gt);
        for (got, want) in back.iter().zip(aoi.bounds()) {
            assert!((got - want).abs() <= 1.0, "{:?} vs {:?}", back, aoi.bounds());
        }
    }

    #[test]
    fn test_literal_origin_does_not_contain_aoi() {
        // Origin y=100 with rows going south covers y in [-900, 100].
        let cache = ProjCache::new();
        let gt = unit_grid(100.0);
        let aoi = Aoi::new(100.0, 100.0, 200.0, 200.0, codes::WGS84).unwrap();

        let window = compute_window(codes::WGS84, &gt, (1000, 1000), &aoi, &cache).unwrap();
        assert!(window.is_empty());
        assert_eq!(window, PixelWindow::EMPTY);
    }

    #[test]
    fn test_fractional_edges_expand_outward() {
        let cache = ProjCache::new();
        let gt = GeoTransform::north_up(0.0, 100.0, 10.0, 10.0);
        let aoi = Aoi::new(15.0, 55.0, 34.0, 81.0, codes::WGS84).unwrap();

        let window = compute_window(codes::WGS84, &gt, (10, 10), &aoi, &cache).unwrap();
        // cols 1.5..3.4 -> 1..4, rows 1.9..4.5 -> 1..5
        assert_eq!(window, PixelWindow::new(1, 1, 3, 4));
    }

    #[test]
    fn test_partial_overlap_is_clamped() {
        let cache = ProjCache::new();
        let gt = unit_grid(100.0);
        let aoi = Aoi::new(-50.0, 50.0, 30.0, 150.0, codes::WGS84).unwrap();

        let window = compute_window(codes::WGS84, &gt, (100, 100), &aoi, &cache).unwrap();
        assert_eq!(window, PixelWindow::new(0, 0, 30, 50));
    }

    #[test]
    fn test_outside_aoi_is_empty() {
        let cache = ProjCache::new();
        let gt = unit_grid(100.0);
        let aoi = Aoi::new(500.0, 500.0, 600.0, 600.0, codes::WGS84).unwrap();
        let window = compute_window(codes::WGS84, &gt, (100, 100), &aoi, &cache).unwrap();
        assert!(window.is_empty());
    }

    #[test]
    fn test_touching_edge_is_empty() {
        let cache = ProjCache::new();
        let gt = unit_grid(100.0);
        let aoi = Aoi::new(100.0, 0.0, 150.0, 50.0, codes::WGS84).unwrap();
        let window = compute_window(codes::WGS84, &gt, (100, 100), &aoi, &cache).unwrap();
        assert!(window.is_empty());
    }

    #[test]
    fn test_bottom_up_transform() {
        let cache = ProjCache::new();
        let gt = GeoTransform { a: 1.0, b: 0.0, c: 0.0, d: 0.0, e: 1.0, f: 0.0 };
        let aoi = Aoi::new(10.0, 20.0, 30.0, 50.0, codes::WGS84).unwrap();
        let window = compute_window(codes::WGS84, &gt, (100, 100), &aoi, &cache).unwrap();
        assert_eq!(window, PixelWindow::new(10, 20, 20, 30));
    }

    #[test]
    fn test_reprojected_aoi() {
        let cache = ProjCache::new();
        // 10m UTM 10N grid around San Francisco
        let gt = GeoTransform::north_up(540000.0, 4200000.0, 10.0, 10.0);
        let aoi = Aoi::new(-122.5, 37.85, -122.45, 37.9, codes::WGS84).unwrap();

        let window = compute_window("EPSG:32610", &gt, (10000, 10000), &aoi, &cache).unwrap();
        assert!(!window.is_empty());
        // ~0.05 deg lon at 37.9N is ~4.4km, 0.05 deg lat is ~5.5km
        assert!(window.width > 400 && window.width < 480, "{}", window);
        assert!(window.height > 520 && window.height < 590, "{}", window);
    }

    #[test]
    fn test_rotated_transform_rejected() {
        let cache = ProjCache::new();
        let gt = GeoTransform { a: 1.0, b: 0.5, c: 0.0, d: 0.0, e: -1.0, f: 0.0 };
        let aoi = Aoi::new(0.0, -5.0, 5.0, 0.0, codes::WGS84).unwrap();
        assert!(matches!(
            compute_window(codes::WGS84, &gt, (10, 10), &aoi, &cache),
            Err(BandCalcError::Crs(_))
        ));
    }

    #[test]
    fn test_geotransform_from_model_transformation() {
        let matrix: [f64; 16] = [
            10.0, 0.0, 0.0, 500000.0,
            0.0, -10.0, 0.0, 4259840.0,
            0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let gt = GeoTransform::from_model_transformation(&matrix).unwrap();
        assert_eq!(gt.a, 10.0);
        assert_eq!(gt.c, 500000.0);
        assert_eq!(gt.e, -10.0);
        assert_eq!(gt.f, 4259840.0);
        assert!(GeoTransform::from_model_transformation(&matrix[..4]).is_none());
    }

    #[test]
    fn test_geotransform_from_pixel_scale_tiepoint() {
        let scale = [10.0, 10.0, 0.0];
        let tiepoint = [0.0, 0.0, 0.0, 500000.0, 4259840.0, 0.0];
        let gt = GeoTransform::from_pixel_scale_tiepoint(&scale, &tiepoint).unwrap();
        assert_eq!(gt, GeoTransform::north_up(500000.0, 4259840.0, 10.0, 10.0));

        // Tiepoint anchored at a non-origin pixel
        let tiepoint = [2.0, 3.0, 0.0, 500020.0, 4259810.0, 0.0];
        let gt = GeoTransform::from_pixel_scale_tiepoint(&scale, &tiepoint).unwrap();
        assert_eq!(gt.c, 500000.0);
        assert_eq!(gt.f, 4259840.0);
    }

    #[test]
    fn test_gdal_round_trip_and_windowed() {
        let gt = GeoTransform::from_gdal(&[500000.0, 10.0, 0.0, 4259840.0, 0.0, -10.0]);
        assert_eq!(gt.to_gdal(), [500000.0, 10.0, 0.0, 4259840.0, 0.0, -10.0]);

        let sub = gt.windowed(100, 50);
        assert_eq!(sub.c, 501000.0);
        assert_eq!(sub.f, 4259340.0);
        assert_eq!(sub.resolution(), (10.0, 10.0));

        let fine = gt.scaled(2.0, 2.0);
        assert_eq!(fine.resolution(), (5.0, 5.0));
        assert_eq!(fine.c, gt.c);
    }

    #[test]
    fn test_world_pixel_round_trip() {
        let gt = GeoTransform::north_up(500000.0, 4259840.0, 10.0, 10.0);
        let (col, row) = gt.world_to_pixel(552853.07, 4181018.26);
        let (x, y) = gt.pixel_to_world(col, row);
        assert!((x - 552853.07).abs() < 1e-6);
        assert!((y - 4181018.26).abs() < 1e-6);
    }
}
