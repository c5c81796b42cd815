//! GeoTIFF reading and writing through GDAL.
//!
//! Outputs are tiled, compressed GeoTIFFs carrying the geotransform, CRS,
//! nodata, band descriptions and dataset tags of the product they hold.

use crate::config::OutputConfig;
use crate::io::RasterData;
use crate::window::{GeoTransform, PixelWindow};
use anyhow::{Context, Result};
use gdal::raster::{Buffer, GdalDataType, GdalType, RasterCreationOptions};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use std::path::Path;

/// GTiff creation settings.
#[derive(Debug, Clone)]
pub struct GeoTiffOptions {
    pub compression: String,
    pub block_size: usize,
    /// Write `PHOTOMETRIC=RGB` (3-band composites)
    pub photometric_rgb: bool,
}

impl Default for GeoTiffOptions {
    fn default() -> Self {
        Self::from_config(&OutputConfig::default())
    }
}

impl GeoTiffOptions {
    pub fn from_config(output: &OutputConfig) -> Self {
        Self {
            compression: output.compression.clone(),
            block_size: output.block_size,
            photometric_rgb: false,
        }
    }

    pub fn rgb(mut self) -> Self {
        self.photometric_rgb = true;
        self
    }

    fn creation_options(&self) -> Result<RasterCreationOptions> {
        let mut options = RasterCreationOptions::new();
        options.set_name_value("TILED", "YES")?;
        options.set_name_value("COMPRESS", &self.compression)?;
        options.set_name_value("BLOCKXSIZE", &self.block_size.to_string())?;
        options.set_name_value("BLOCKYSIZE", &self.block_size.to_string())?;
        if self.photometric_rgb {
            options.set_name_value("PHOTOMETRIC", "RGB")?;
        }
        Ok(options)
    }
}

/// Georeferencing and descriptive metadata written alongside pixel data.
#[derive(Debug, Clone)]
pub struct RasterProfile {
    pub geo_transform: GeoTransform,
    /// `EPSG:<code>` or WKT
    pub crs: Option<String>,
    pub nodata: Option<f64>,
    /// One per band, in band order. Missing entries leave the band undescribed.
    pub band_descriptions: Vec<String>,
    /// Dataset-level metadata items
    pub tags: Vec<(String, String)>,
    /// `(min, max)` per band, written as STATISTICS_MINIMUM/MAXIMUM
    pub band_statistics: Vec<Option<(f64, f64)>>,
}

impl RasterProfile {
    pub fn new(geo_transform: GeoTransform, crs: Option<String>) -> Self {
        Self {
            geo_transform,
            crs,
            nodata: None,
            band_descriptions: Vec::new(),
            tags: Vec::new(),
            band_statistics: Vec::new(),
        }
    }

    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    pub fn with_descriptions<I, S>(mut self, descriptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.band_descriptions = descriptions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags(mut self, tags: Vec<(String, String)>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_statistics(mut self, statistics: Vec<Option<(f64, f64)>>) -> Self {
        self.band_statistics = statistics;
        self
    }
}

/// Write any typed raster.
///
/// 8-bit signed data is written as Int16 with the same values: GDAL only
/// gained a signed byte type in 3.7, and older builds cannot store it.
pub fn write_raster(path: &Path, data: &RasterData, profile: &RasterProfile, options: &GeoTiffOptions) -> Result<()> {
    match data {
        RasterData::UInt8(a) => write_array(path, a.view(), profile, options),
        RasterData::Int8(a) => write_array(path, a.mapv(i16::from).view(), profile, options),
        RasterData::UInt16(a) => write_array(path, a.view(), profile, options),
        RasterData::Int16(a) => write_array(path, a.view(), profile, options),
        RasterData::UInt32(a) => write_array(path, a.view(), profile, options),
        RasterData::Int32(a) => write_array(path, a.view(), profile, options),
        RasterData::Float32(a) => write_array(path, a.view(), profile, options),
        RasterData::Float64(a) => write_array(path, a.view(), profile, options),
    }
}

/// Write a single-band raster.
pub fn write_band<T: GdalType + Copy>(
    path: &Path,
    data: ArrayView2<T>,
    profile: &RasterProfile,
    options: &GeoTiffOptions,
) -> Result<()> {
    write_array(path, data.insert_axis(Axis(0)), profile, options)
}

/// Write a `(bands, height, width)` array as a GeoTIFF.
pub fn write_array<T: GdalType + Copy>(
    path: &Path,
    data: ArrayView3<T>,
    profile: &RasterProfile,
    options: &GeoTiffOptions,
) -> Result<()> {
    let (bands, height, width) = data.dim();
    if bands == 0 || height == 0 || width == 0 {
        anyhow::bail!("Refusing to write empty raster {}x{}x{}", bands, height, width);
    }

    let driver = DriverManager::get_driver_by_name("GTiff").context("Failed to get GTiff driver")?;
    let mut dataset = driver
        .create_with_band_type_with_options::<T, _>(path, width, height, bands, &options.creation_options()?)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    dataset
        .set_geo_transform(&profile.geo_transform.to_gdal())
        .context("Failed to set geotransform")?;

    if let Some(ref crs) = profile.crs {
        let srs = SpatialRef::from_definition(crs).with_context(|| format!("Invalid CRS {}", crs))?;
        dataset.set_spatial_ref(&srs).context("Failed to set CRS")?;
    }

    for (key, value) in &profile.tags {
        dataset
            .set_metadata_item(key, value, "")
            .with_context(|| format!("Failed to set tag {}", key))?;
    }

    for (b, plane) in data.axis_iter(Axis(0)).enumerate() {
        let mut band = dataset.rasterband(b + 1).context("Failed to get output band")?;

        if let Some(nodata) = profile.nodata {
            band.set_no_data_value(Some(nodata)).context("Failed to set nodata")?;
        }
        if let Some(description) = profile.band_descriptions.get(b) {
            band.set_description(description).context("Failed to set band description")?;
        }
        if let Some(Some((min, max))) = profile.band_statistics.get(b) {
            band.set_metadata_item("STATISTICS_MINIMUM", &min.to_string(), "")?;
            band.set_metadata_item("STATISTICS_MAXIMUM", &max.to_string(), "")?;
        }

        let values: Vec<T> = plane.iter().copied().collect();
        band.write((0, 0), (width, height), &mut Buffer::new((width, height), values))
            .with_context(|| format!("Failed to write band {}", b + 1))?;
    }

    dataset.flush_cache().context("Failed to flush output")?;
    tracing::debug!("Wrote {}x{}x{} raster to {}", bands, height, width, path.display());
    Ok(())
}

/// First band of a raster widened to f64, with its georeferencing.
#[derive(Debug, Clone)]
pub struct BandRaster {
    pub data: Array2<f64>,
    pub nodata: Option<f64>,
    pub geo_transform: GeoTransform,
    pub crs: Option<String>,
}

impl BandRaster {
    /// `(height, width)`
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// True when `value` is this band's nodata or NaN.
    #[inline]
    pub fn is_nodata(&self, value: f64) -> bool {
        value.is_nan() || self.nodata.is_some_and(|nd| value == nd)
    }

    pub fn profile(&self) -> RasterProfile {
        RasterProfile::new(self.geo_transform, self.crs.clone())
    }
}

/// Read band 1 of a raster file as f64.
pub fn read_band(path: &Path) -> Result<BandRaster> {
    let dataset = Dataset::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let (width, height) = dataset.raster_size();
    let band = dataset.rasterband(1).context("Raster has no bands")?;
    let buffer = band
        .read_as::<f64>((0, 0), (width, height), (width, height), None)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let data = Array2::from_shape_vec((height, width), buffer.data().to_vec())?;

    let geo_transform = dataset
        .geo_transform()
        .map(|gt| GeoTransform::from_gdal(&gt))
        .with_context(|| format!("{} has no geotransform", path.display()))?;

    Ok(BandRaster {
        data,
        nodata: band.no_data_value(),
        geo_transform,
        crs: crs_of(&dataset),
    })
}

/// Header-level description of a raster file.
#[derive(Debug, Clone)]
pub struct RasterInfo {
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub data_type: GdalDataType,
    pub geo_transform: Option<GeoTransform>,
    pub crs: Option<String>,
    pub nodata: Option<f64>,
    pub tags: Vec<(String, String)>,
}

/// Read a raster's header without touching pixel data.
pub fn describe(path: &Path) -> Result<RasterInfo> {
    let dataset = Dataset::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let (width, height) = dataset.raster_size();
    let bands = dataset.raster_count();
    if width == 0 || height == 0 || bands == 0 {
        anyhow::bail!("{} has no pixels: {}x{} with {} bands", path.display(), width, height, bands);
    }
    let band = dataset.rasterband(1)?;

    let tags = dataset
        .metadata_domain("")
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    Ok(RasterInfo {
        width,
        height,
        bands,
        data_type: band.band_type(),
        geo_transform: dataset.geo_transform().ok().map(|gt| GeoTransform::from_gdal(&gt)),
        crs: crs_of(&dataset),
        nodata: band.no_data_value(),
        tags,
    })
}

/// Read a pixel window of every band, keeping the file's sample type.
pub fn read_window(path: &Path, window: PixelWindow) -> Result<RasterData> {
    let dataset = Dataset::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let bands = dataset.raster_count();
    let data_type = dataset.rasterband(1)?.band_type();
    let (w, h) = (window.width, window.height);
    let offset = (window.col_off as isize, window.row_off as isize);

    macro_rules! read_as {
        ($t:ty) => {{
            let mut out = Array3::<$t>::default((bands, h, w));
            for (b, mut plane) in out.axis_iter_mut(Axis(0)).enumerate() {
                let band = dataset.rasterband(b + 1)?;
                let buffer = band
                    .read_as::<$t>(offset, (w, h), (w, h), None)
                    .with_context(|| format!("Failed to read window {} of {}", window, path.display()))?;
                plane.assign(&ArrayView2::from_shape((h, w), buffer.data())?);
            }
            out
        }};
    }

    let data = match data_type {
        GdalDataType::UInt8 => RasterData::UInt8(read_as!(u8)),
        GdalDataType::Int8 => RasterData::Int8(read_as!(i16).mapv(|v| v as i8)),
        GdalDataType::UInt16 => RasterData::UInt16(read_as!(u16)),
        GdalDataType::Int16 => RasterData::Int16(read_as!(i16)),
        GdalDataType::UInt32 => RasterData::UInt32(read_as!(u32)),
        GdalDataType::Int32 => RasterData::Int32(read_as!(i32)),
        GdalDataType::Float32 => RasterData::Float32(read_as!(f32)),
        GdalDataType::Float64 => RasterData::Float64(read_as!(f64)),
        other => anyhow::bail!("Unsupported sample type {:?} in {}", other, path.display()),
    };
    Ok(data)
}

/// True when GDAL can open the file and it has pixels and bands.
pub fn is_valid_raster(path: &Path) -> bool {
    match Dataset::open(path) {
        Ok(dataset) => {
            let (width, height) = dataset.raster_size();
            width > 0 && height > 0 && dataset.raster_count() > 0
        }
        Err(e) => {
            tracing::debug!("{} is not a valid raster: {}", path.display(), e);
            false
        }
    }
}

/// `EPSG:<code>` when the CRS has an EPSG authority, WKT otherwise.
fn crs_of(dataset: &Dataset) -> Option<String> {
    let srs = dataset.spatial_ref().ok()?;
    match (srs.auth_name(), srs.auth_code()) {
        (Some(name), Ok(code)) if name.eq_ignore_ascii_case("EPSG") => Some(format!("EPSG:{}", code)),
        _ => srs.to_wkt().ok().filter(|wkt| !wkt.is_empty()),
    }
}

/// Tiled GeoTIFF fixtures for tests. Small blocks so windows span several tiles.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn write_tiled<T: GdalType + Copy>(
        path: &Path,
        data: &Array3<T>,
        geo_transform: GeoTransform,
        crs: &str,
        nodata: Option<f64>,
    ) {
        let profile = RasterProfile::new(geo_transform, Some(crs.to_string())).with_nodata(nodata);
        let options = GeoTiffOptions {
            compression: "LZW".to_string(),
            block_size: 16,
            photometric_rgb: false,
        };
        write_array(path, data.view(), &profile, &options).unwrap();
    }

    pub fn write_band_f32(path: &Path, data: &Array2<f32>, geo_transform: GeoTransform, nodata: Option<f64>) {
        write_tiled(path, &data.clone().insert_axis(Axis(0)), geo_transform, "EPSG:4326", nodata);
    }
}
