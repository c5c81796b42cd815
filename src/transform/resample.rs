//! Resampling cropped windows to a target resolution using GDAL.
//!
//! Source and destination are in-memory (MEM) datasets on the same CRS; GDAL's
//! warper does bilinear interpolation between them.

use crate::io::RasterData;
use crate::window::GeoTransform;
use anyhow::{Context, Result};
use gdal::raster::{Buffer, GdalType};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use ndarray::{Array3, ArrayView3, Axis};

/// Relative resolution difference below which no resampling happens.
const RESOLUTION_TOLERANCE: f64 = 1e-9;

/// Destination grid for a resampled window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResampleGrid {
    pub geo_transform: GeoTransform,
    pub width: usize,
    pub height: usize,
}

/// Grid for resampling a `width` x `height` window at `transform` to `target_resolution`.
///
/// Returns `None` when the native x resolution already matches. Dimensions are
/// scaled by `native / target`, rounded, and never below 1.
pub fn target_grid(
    transform: &GeoTransform,
    width: usize,
    height: usize,
    target_resolution: f64,
) -> Option<ResampleGrid> {
    let (native_x, _) = transform.resolution();
    if native_x <= 0.0 || target_resolution <= 0.0 {
        return None;
    }
    if ((native_x - target_resolution) / native_x).abs() <= RESOLUTION_TOLERANCE {
        return None;
    }

    let scale = native_x / target_resolution;
    let new_width = ((width as f64 * scale).round() as usize).max(1);
    let new_height = ((height as f64 * scale).round() as usize).max(1);

    Some(ResampleGrid {
        geo_transform: transform.scaled(scale, scale),
        width: new_width,
        height: new_height,
    })
}

/// Bilinear resample of every band onto `grid`.
pub fn resample(
    data: &RasterData,
    src_transform: &GeoTransform,
    crs: Option<&str>,
    nodata: Option<f64>,
    grid: &ResampleGrid,
) -> Result<RasterData> {
    let job = MemWarp {
        src_transform,
        crs,
        nodata,
        grid,
    };
    let out = match data {
        RasterData::UInt8(a) => RasterData::UInt8(job.run(a.view())?),
        RasterData::Int8(a) => RasterData::Int8(job.run(a.mapv(i16::from).view())?.mapv(|v| v as i8)),
        RasterData::UInt16(a) => RasterData::UInt16(job.run(a.view())?),
        RasterData::Int16(a) => RasterData::Int16(job.run(a.view())?),
        RasterData::UInt32(a) => RasterData::UInt32(job.run(a.view())?),
        RasterData::Int32(a) => RasterData::Int32(job.run(a.view())?),
        RasterData::Float32(a) => RasterData::Float32(job.run(a.view())?),
        RasterData::Float64(a) => RasterData::Float64(job.run(a.view())?),
    };
    Ok(out)
}

struct MemWarp<'a> {
    src_transform: &'a GeoTransform,
    crs: Option<&'a str>,
    nodata: Option<f64>,
    grid: &'a ResampleGrid,
}

impl MemWarp<'_> {
    fn run<T: GdalType + Copy + Default>(&self, data: ArrayView3<T>) -> Result<Array3<T>> {
        let (bands, src_height, src_width) = data.dim();
        let (dst_width, dst_height) = (self.grid.width, self.grid.height);

        tracing::debug!(
            "GDAL resample: {}x{} -> {}x{} ({} bands)",
            src_width, src_height, dst_width, dst_height, bands
        );

        let mem_driver = DriverManager::get_driver_by_name("MEM").context("Failed to get MEM driver")?;

        let mut src_dataset = mem_driver
            .create_with_band_type::<T, _>("", src_width, src_height, bands)
            .context("Failed to create source dataset")?;
        self.georeference(&mut src_dataset, self.src_transform)?;

        for (b, plane) in data.axis_iter(Axis(0)).enumerate() {
            let mut band = src_dataset.rasterband(b + 1).context("Failed to get source band")?;
            if let Some(nodata) = self.nodata {
                band.set_no_data_value(Some(nodata))?;
            }
            let values: Vec<T> = plane.iter().copied().collect();
            band.write((0, 0), (src_width, src_height), &mut Buffer::new((src_width, src_height), values))
                .context("Failed to write source band")?;
        }

        let mut dst_dataset = mem_driver
            .create_with_band_type::<T, _>("", dst_width, dst_height, bands)
            .context("Failed to create destination dataset")?;
        self.georeference(&mut dst_dataset, &self.grid.geo_transform)?;

        if let Some(nodata) = self.nodata {
            for b in 0..bands {
                let mut band = dst_dataset.rasterband(b + 1)?;
                band.set_no_data_value(Some(nodata))?;
                band.fill(nodata, None)?;
            }
        }

        gdal::raster::reproject(&src_dataset, &dst_dataset).context("GDAL resample failed")?;

        let mut output = Array3::<T>::default((bands, dst_height, dst_width));
        for (b, mut plane) in output.axis_iter_mut(Axis(0)).enumerate() {
            let band = dst_dataset.rasterband(b + 1).context("Failed to get destination band")?;
            let buffer = band
                .read_as::<T>((0, 0), (dst_width, dst_height), (dst_width, dst_height), None)
                .context("Failed to read destination band")?;
            for (dst, src) in plane.iter_mut().zip(buffer.data()) {
                *dst = *src;
            }
        }

        Ok(output)
    }

    fn georeference(&self, dataset: &mut Dataset, transform: &GeoTransform) -> Result<()> {
        dataset
            .set_geo_transform(&transform.to_gdal())
            .context("Failed to set geotransform")?;
        if let Some(crs) = self.crs {
            let srs = SpatialRef::from_definition(crs).with_context(|| format!("Invalid CRS {}", crs))?;
            dataset.set_spatial_ref(&srs).context("Failed to set CRS")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gt() -> GeoTransform {
        GeoTransform::north_up(500000.0, 4200000.0, 10.0, 10.0)
    }

    #[test]
    fn test_target_grid_scales_dimensions() {
        let grid = target_grid(&gt(), 100, 50, 20.0).unwrap();
        assert_eq!((grid.width, grid.height), (50, 25));
        assert_eq!(grid.geo_transform.resolution(), (20.0, 20.0));
        assert_eq!(grid.geo_transform.c, 500000.0);
        assert_eq!(grid.geo_transform.f, 4200000.0);

        let fine = target_grid(&gt(), 3, 3, 4.0).unwrap();
        assert_eq!((fine.width, fine.height), (8, 8));
    }

    #[test]
    fn test_target_grid_same_resolution_is_none() {
        assert!(target_grid(&gt(), 100, 100, 10.0).is_none());
        assert!(target_grid(&gt(), 100, 100, 10.0 + 1e-12).is_none());
    }

    #[test]
    fn test_target_grid_never_collapses() {
        let grid = target_grid(&gt(), 2, 1, 1000.0).unwrap();
        assert_eq!((grid.width, grid.height), (1, 1));
    }

    #[test]
    fn test_resample_constant_field() {
        let data = RasterData::Float32(Array3::from_elem((2, 10, 10), 7.5));
        let grid = target_grid(&gt(), 10, 10, 20.0).unwrap();

        let out = resample(&data, &gt(), Some("EPSG:32610"), None, &grid).unwrap();
        assert_eq!(out.dim(), (2, 5, 5));
        let band = out.band_f64(1).unwrap();
        assert!(band.iter().all(|v| (v - 7.5).abs() < 1e-4));
    }

    #[test]
    fn test_resample_keeps_type() {
        let data = RasterData::UInt16(Array3::from_elem((1, 4, 4), 300));
        let grid = target_grid(&gt(), 4, 4, 5.0).unwrap();
        let out = resample(&data, &gt(), Some("EPSG:32610"), Some(0.0), &grid).unwrap();
        assert_eq!(out.type_name(), "uint16");
        assert_eq!(out.dim(), (1, 8, 8));
    }
}
