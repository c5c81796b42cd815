use super::{check_shape, load_band, valid_range, CalcOutcome, IndexCalculator, OUTPUT_NODATA};
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::io::geotiff;
use crate::pipeline::BandSet;
use ndarray::{Array2, Zip};
use std::path::Path;

/// Guards the denominator against exact zero on dead pixels.
const NDVI_EPSILON: f64 = 1e-10;

/// NDVI for one pixel pair; `None` means the output pixel is nodata.
#[inline]
fn ndvi_pixel(nir: f64, red: f64) -> Option<f32> {
    if nir + red == 0.0 {
        return None;
    }
    let ndvi = (nir - red) / (nir + red + NDVI_EPSILON);
    if ndvi.is_nan() {
        return None;
    }
    Some(ndvi.clamp(-1.0, 1.0) as f32)
}

impl IndexCalculator {
    /// Compute NDVI from the `nir` and `red` bands.
    ///
    /// Pixels where either input is nodata (or NaN), or where `nir + red == 0`,
    /// become -9999; all others are clamped to [-1, 1].
    pub fn calculate_ndvi(&self, bands: &BandSet, dest: &Path, cancel: &CancellationToken) -> Result<CalcOutcome> {
        tracing::info!("Calculating NDVI -> {}", dest.display());

        let nir = load_band(bands, "nir")?;
        let red = load_band(bands, "red")?;
        check_shape("red", nir.shape(), &red)?;
        cancel.check()?;

        let ndvi: Array2<f32> = Zip::from(&nir.data).and(&red.data).par_map_collect(|&n, &r| {
            if nir.is_nodata(n) || red.is_nodata(r) {
                return OUTPUT_NODATA as f32;
            }
            ndvi_pixel(n, r).unwrap_or(OUTPUT_NODATA as f32)
        });
        cancel.check()?;

        let range = valid_range(ndvi.iter().map(|v| *v as f64), Some(OUTPUT_NODATA));
        let profile = nir
            .profile()
            .with_nodata(Some(OUTPUT_NODATA))
            .with_descriptions(["NDVI"])
            .with_statistics(vec![range]);

        let path = self.persist(dest, cancel, |tmp, options| {
            geotiff::write_band(tmp, ndvi.view(), &profile, options)
        })?;

        let message = match range {
            Some((min, max)) => format!("NDVI range [{:.4}, {:.4}]", min, max),
            None => "NDVI has no valid pixels".to_string(),
        };
        tracing::info!("{} ({})", message, path.display());

        Ok(CalcOutcome {
            path,
            message: Some(message),
        })
    }
}
