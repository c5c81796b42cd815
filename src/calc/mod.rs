//! Index calculation kernels.
//!
//! Every kernel consumes a [`BandSet`] of single-band rasters cropped to the
//! same AOI and writes one derived GeoTIFF:
//!
//! - **NDVI**: `(nir - red) / (nir + red + 1e-10)`, masked and clamped to [-1, 1]
//! - **False color**: NIR/Red/Green percentile-stretched to 8-bit RGB
//! - **Formula**: user band math over a closed expression grammar
//! - **Predefined indices**: named formulas run through the formula kernel

mod expr;
mod false_color;
mod formula;
mod indices;
mod ndvi;
mod stats;

pub use expr::{Coefficients, Formula, Func};
pub use false_color::percentile;
pub use indices::{PredefinedIndex, PREDEFINED_INDICES};
pub use stats::{zonal_stats, ZonalStats};

use crate::cancel::CancellationToken;
use crate::error::{BandCalcError, Result};
use crate::io::{read_band, BandRaster, GeoTiffOptions, StagedFile};
use crate::pipeline::{BandSet, Metrics};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Nodata value of float outputs (NDVI and formula results).
pub const OUTPUT_NODATA: f64 = -9999.0;

/// Result of a successful kernel run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalcOutcome {
    pub path: PathBuf,
    pub message: Option<String>,
}

/// Runs the numeric kernels and writes their outputs.
///
/// Kernels are synchronous and CPU-bound; async callers run them on the
/// blocking pool.
#[derive(Debug, Clone, Default)]
pub struct IndexCalculator {
    options: GeoTiffOptions,
    metrics: Option<Arc<Metrics>>,
}

impl IndexCalculator {
    pub fn new(options: GeoTiffOptions) -> Self {
        Self { options, metrics: None }
    }

    pub fn with_metrics(options: GeoTiffOptions, metrics: Arc<Metrics>) -> Self {
        Self {
            options,
            metrics: Some(metrics),
        }
    }

    /// Write through a staged partial file, committing only if not canceled.
    fn persist<F>(&self, dest: &Path, cancel: &CancellationToken, write: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path, &GeoTiffOptions) -> anyhow::Result<()>,
    {
        let start = Instant::now();
        let staged = StagedFile::new(dest).map_err(|e| BandCalcError::write(dest, format!("{:#}", e)))?;
        write(staged.path(), &self.options).map_err(|e| BandCalcError::write(dest, format!("{:#}", e)))?;
        cancel.check()?;
        let path = staged
            .commit()
            .map_err(|e| BandCalcError::write(dest, format!("{:#}", e)))?;

        if let Some(ref m) = self.metrics {
            m.add_write_time(start.elapsed());
            m.add_product_written();
        }
        Ok(path)
    }
}

/// Load one named band, failing with `PartialBandFailure` if it is absent.
fn load_band(bands: &BandSet, name: &str) -> Result<BandRaster> {
    let path = bands.get(name).ok_or_else(|| BandCalcError::PartialBandFailure {
        missing: vec![name.to_string()],
    })?;
    read_band(path).map_err(|e| BandCalcError::open(path.display().to_string(), format!("{:#}", e)))
}

/// All bands must share the reference band's pixel grid.
fn check_shape(name: &str, expected: (usize, usize), band: &BandRaster) -> Result<()> {
    let found = band.shape();
    if found != expected {
        return Err(BandCalcError::ShapeMismatch {
            band: name.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

/// `(min, max)` over values that are finite and not `nodata`.
fn valid_range<I>(values: I, nodata: Option<f64>) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = f64>,
{
    values
        .into_iter()
        .filter(|v| v.is_finite() && nodata.map_or(true, |nd| *v != nd))
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}
