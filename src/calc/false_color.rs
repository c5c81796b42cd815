use super::{check_shape, load_band, CalcOutcome, IndexCalculator};
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::io::{geotiff, BandRaster, RasterData, RasterProfile};
use crate::pipeline::BandSet;
use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;
use std::path::Path;

/// Lower and upper stretch percentiles.
const STRETCH_LOW: f64 = 0.02;
const STRETCH_HIGH: f64 = 0.98;

/// Input band feeding each output channel, in R, G, B order.
const CHANNELS: [(&str, &str); 3] = [("nir", "NIR"), ("red", "Red"), ("green", "Green")];

/// Linear-interpolated percentile of sorted values, `q` in [0, 1].
///
/// Position is `(n - 1) * q` between closest ranks.
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let h = (sorted.len() - 1) as f64 * q.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    Some(sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo]))
}

/// Stretch one band to u8 between its 2nd and 98th percentile of positive values.
///
/// A band with no positive pixels becomes all zero. When the percentiles
/// coincide the band is clipped to [0, 255] without stretching.
fn stretch_band(band: &Array2<f64>) -> Array2<u8> {
    let mut positive: Vec<f64> = band.iter().copied().filter(|v| *v > 0.0).collect();
    if positive.is_empty() {
        return Array2::zeros(band.dim());
    }
    positive.par_sort_unstable_by(|a, b| a.total_cmp(b));

    let (low, high) = match (percentile(&positive, STRETCH_LOW), percentile(&positive, STRETCH_HIGH)) {
        (Some(low), Some(high)) => (low, high),
        _ => return Array2::zeros(band.dim()),
    };

    band.mapv(|v| {
        if v.is_nan() {
            return 0;
        }
        let scaled = if high > low {
            (v - low) / (high - low) * 255.0
        } else {
            v
        };
        scaled.clamp(0.0, 255.0).round() as u8
    })
}

impl IndexCalculator {
    /// False-color composite: NIR, Red and Green mapped to R, G and B.
    ///
    /// Each channel is stretched independently; the output is 3-band u8
    /// with RGB photometric interpretation and no nodata.
    pub fn create_false_color(&self, bands: &BandSet, dest: &Path, cancel: &CancellationToken) -> Result<CalcOutcome> {
        tracing::info!("Creating false color composite -> {}", dest.display());

        let inputs = CHANNELS
            .iter()
            .map(|(name, _)| load_band(bands, name))
            .collect::<Result<Vec<BandRaster>>>()?;
        let shape = inputs[0].shape();
        for ((name, _), band) in CHANNELS.iter().zip(&inputs).skip(1) {
            check_shape(name, shape, band)?;
        }
        cancel.check()?;

        let channels: Vec<Array2<u8>> = inputs.par_iter().map(|band| stretch_band(&band.data)).collect();
        let views: Vec<_> = channels.iter().map(|c| c.view()).collect();
        let composite: Array3<u8> = ndarray::stack(Axis(0), &views)
            .map_err(|e| crate::error::BandCalcError::write(dest, e))?;
        cancel.check()?;

        let profile = RasterProfile::new(inputs[0].geo_transform, inputs[0].crs.clone())
            .with_descriptions(CHANNELS.iter().map(|(_, desc)| *desc));
        let data = RasterData::UInt8(composite);

        let path = self.persist(dest, cancel, |tmp, options| {
            geotiff::write_raster(tmp, &data, &profile, &options.clone().rgb())
        })?;
        tracing::info!("False color composite written to {}", path.display());

        Ok(CalcOutcome {
            path,
            message: Some("False color composite (NIR, Red, Green)".to_string()),
        })
    }
}
