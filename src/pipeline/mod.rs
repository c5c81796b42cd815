//! Band acquisition and scheduled calculation.
//!
//! - [`CogFetcher`]: crop one raster to an AOI
//! - [`BandSetAcquirer`]: fetch an asset's bands concurrently, tolerating failures
//! - [`CalculationScheduler`]: run calculations off-thread with progress, cancel and timeout
//! - [`ProductProcessor`]: tie the above together per product kind

mod acquirer;
mod fetcher;
mod metrics;
mod products;
mod scheduler;

#[cfg(test)]
mod pipeline_integration_tests;

pub use acquirer::{band_cache_path, Acquisition, BandSet, BandSetAcquirer};
pub use fetcher::{CogFetcher, FetchOutcome};
pub use metrics::{Metrics, MetricsSnapshot};
pub use products::{ProductKind, ProductProcessor};
pub use scheduler::{CalculationScheduler, TaskContext, TaskEvent, TaskHandle, TaskKey, TaskOutcome};
