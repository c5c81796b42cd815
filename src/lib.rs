//! AOI band calculation
//!
//! Fetches only the pixels of remote Cloud-Optimized GeoTIFF bands that fall
//! inside an area of interest, then derives products (NDVI, false color,
//! custom formulas, predefined indices) from the cropped bands.
//!
//! # Architecture
//!
//! - **Window**: AOI to pixel window on a raster's grid, across CRSs
//! - **I/O**: Range-request COG reads through object_store, GeoTIFF output via GDAL
//! - **Calc**: Per-pixel kernels and a formula evaluator over named bands
//! - **Pipeline**: Fetcher, band-set acquirer, and the calculation scheduler
//!
//! # Usage
//!
//! ```no_run
//! use aoi_bandcalc::{Aoi, CalculationScheduler, Config, Metrics, ProductKind, ProductProcessor, RasterAsset};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::default());
//!     let asset = RasterAsset::from_json_file("asset.json".as_ref())?;
//!     let aoi = Aoi::new(106.80, -6.25, 106.85, -6.20, "EPSG:4326")?;
//!
//!     let handle = tokio::runtime::Handle::current();
//!     let processor = Arc::new(ProductProcessor::new(config.clone(), Metrics::new(), handle.clone()));
//!     let scheduler = CalculationScheduler::new(config.calculation.clone(), handle);
//!
//!     let task = processor.submit(&scheduler, asset, ProductKind::Ndvi, aoi);
//!     println!("{:?}", scheduler.await_completion(task, Duration::from_secs(300)).await);
//!     Ok(())
//! }
//! ```

pub mod aoi;
pub mod asset;
pub mod calc;
pub mod cancel;
pub mod config;
pub mod crs;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod transform;
pub mod window;

pub use aoi::Aoi;
pub use asset::RasterAsset;
pub use calc::{Coefficients, IndexCalculator, PredefinedIndex, ZonalStats};
pub use cancel::CancellationToken;
pub use config::Config;
pub use error::{BandCalcError, Result};
pub use io::{CogReader, RasterSource};
pub use pipeline::{
    Acquisition, BandSet, BandSetAcquirer, CalculationScheduler, CogFetcher, FetchOutcome, Metrics, ProductKind,
    ProductProcessor, TaskEvent, TaskHandle, TaskKey, TaskOutcome,
};
pub use window::{compute_window, GeoTransform, PixelWindow};

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool used by the calculation kernels.
pub fn init_rayon(threads: Option<usize>) -> anyhow::Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
