//! Lock-free counters shared by the reader, fetcher, calculator and scheduler.
//!
//! One [`Metrics`] is created per process (or per test) and handed around as
//! `Arc<Metrics>`; components that are built without one simply skip counting.

use serde::{Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Metrics {
    // Source reads
    pub bytes_read: AtomicU64,
    pub tiles_read: AtomicU64,
    pub metadata_cache_hits: AtomicU64,
    pub metadata_cache_misses: AtomicU64,
    /// Microseconds spent in COG window reads
    pub read_us: AtomicU64,

    // Band crops
    pub bands_fetched: AtomicU64,
    pub bands_failed: AtomicU64,
    /// AOI missed the raster
    pub windows_empty: AtomicU64,

    // Outputs
    pub products_written: AtomicU64,
    /// Microseconds spent writing GeoTIFFs
    pub write_us: AtomicU64,

    // Scheduled calculations, one terminal state each
    pub calculations_completed: AtomicU64,
    pub calculations_failed: AtomicU64,
    pub calculations_canceled: AtomicU64,
    pub calculations_timed_out: AtomicU64,

    started: Option<Instant>,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn micros_to_secs(counter: &AtomicU64) -> f64 {
    load(counter) as f64 / 1e6
}

impl Metrics {
    /// Counters at zero, clock started now.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_bytes_read(&self, bytes: u64) {
        bump(&self.bytes_read, bytes);
    }

    pub fn add_tiles_read(&self, count: u64) {
        bump(&self.tiles_read, count);
    }

    pub fn add_metadata_cache_hit(&self) {
        bump(&self.metadata_cache_hits, 1);
    }

    pub fn add_metadata_cache_miss(&self) {
        bump(&self.metadata_cache_misses, 1);
    }

    pub fn add_read_time(&self, duration: Duration) {
        bump(&self.read_us, duration.as_micros() as u64);
    }

    pub fn add_band_fetched(&self) {
        bump(&self.bands_fetched, 1);
    }

    pub fn add_band_failed(&self) {
        bump(&self.bands_failed, 1);
    }

    pub fn add_window_empty(&self) {
        bump(&self.windows_empty, 1);
    }

    pub fn add_product_written(&self) {
        bump(&self.products_written, 1);
    }

    pub fn add_write_time(&self, duration: Duration) {
        bump(&self.write_us, duration.as_micros() as u64);
    }

    pub fn add_calculation_completed(&self) {
        bump(&self.calculations_completed, 1);
    }

    pub fn add_calculation_failed(&self) {
        bump(&self.calculations_failed, 1);
    }

    pub fn add_calculation_canceled(&self) {
        bump(&self.calculations_canceled, 1);
    }

    pub fn add_calculation_timed_out(&self) {
        bump(&self.calculations_timed_out, 1);
    }

    /// Zero when built through `Default` rather than [`Metrics::new`].
    pub fn elapsed(&self) -> Duration {
        self.started.map_or(Duration::ZERO, |t| t.elapsed())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_read: load(&self.bytes_read),
            tiles_read: load(&self.tiles_read),
            metadata_cache_hits: load(&self.metadata_cache_hits),
            metadata_cache_misses: load(&self.metadata_cache_misses),
            read_secs: micros_to_secs(&self.read_us),
            bands_fetched: load(&self.bands_fetched),
            bands_failed: load(&self.bands_failed),
            windows_empty: load(&self.windows_empty),
            products_written: load(&self.products_written),
            write_secs: micros_to_secs(&self.write_us),
            calculations_completed: load(&self.calculations_completed),
            calculations_failed: load(&self.calculations_failed),
            calculations_canceled: load(&self.calculations_canceled),
            calculations_timed_out: load(&self.calculations_timed_out),
            elapsed: self.elapsed(),
        }
    }
}

/// Plain copy of the counters, serializable for reports.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_read: u64,
    pub tiles_read: u64,
    pub metadata_cache_hits: u64,
    pub metadata_cache_misses: u64,
    pub read_secs: f64,
    pub bands_fetched: u64,
    pub bands_failed: u64,
    pub windows_empty: u64,
    pub products_written: u64,
    pub write_secs: f64,
    pub calculations_completed: u64,
    pub calculations_failed: u64,
    pub calculations_canceled: u64,
    pub calculations_timed_out: u64,
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl MetricsSnapshot {
    /// Write the snapshot as pretty JSON.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::info!("Metrics written to {}", path.display());
        Ok(())
    }

    /// Percentage of TIFF header lookups served from cache.
    pub fn metadata_hit_rate(&self) -> f64 {
        match self.metadata_cache_hits + self.metadata_cache_misses {
            0 => 0.0,
            total => self.metadata_cache_hits as f64 * 100.0 / total as f64,
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bands {} ok / {} failed / {} outside AOI; {} tiles, {:.1} MB in {:.1}s (header cache {:.0}%); \
             {} products in {:.1}s; calculations {} ok / {} failed / {} canceled / {} timed out; {:.1}s elapsed",
            self.bands_fetched,
            self.bands_failed,
            self.windows_empty,
            self.tiles_read,
            self.bytes_read as f64 / (1024.0 * 1024.0),
            self.read_secs,
            self.metadata_hit_rate(),
            self.products_written,
            self.write_secs,
            self.calculations_completed,
            self.calculations_failed,
            self.calculations_canceled,
            self.calculations_timed_out,
            self.elapsed.as_secs_f64(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_reach_snapshot() {
        let metrics = Metrics::new();
        metrics.add_bytes_read(1000);
        metrics.add_bytes_read(500);
        metrics.add_tiles_read(4);
        metrics.add_band_fetched();
        metrics.add_band_fetched();
        metrics.add_band_failed();
        metrics.add_window_empty();
        metrics.add_product_written();
        metrics.add_calculation_completed();
        metrics.add_calculation_timed_out();
        metrics.add_read_time(Duration::from_millis(250));
        metrics.add_write_time(Duration::from_millis(50));

        let snap = metrics.snapshot();
        assert_eq!(snap.bytes_read, 1500);
        assert_eq!(snap.tiles_read, 4);
        assert_eq!((snap.bands_fetched, snap.bands_failed, snap.windows_empty), (2, 1, 1));
        assert_eq!(snap.products_written, 1);
        assert_eq!((snap.calculations_completed, snap.calculations_timed_out), (1, 1));
        assert_eq!((snap.calculations_failed, snap.calculations_canceled), (0, 0));
        assert!((snap.read_secs - 0.25).abs() < 1e-3);
        assert!((snap.write_secs - 0.05).abs() < 1e-3);
    }

    #[test]
    fn test_hit_rate_and_display() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().metadata_hit_rate(), 0.0);

        for _ in 0..3 {
            metrics.add_metadata_cache_hit();
        }
        metrics.add_metadata_cache_miss();
        metrics.add_band_fetched();

        let snap = metrics.snapshot();
        assert_eq!(snap.metadata_hit_rate(), 75.0);
        let line = snap.to_string();
        assert!(line.starts_with("bands 1 ok / 0 failed"), "{}", line);
        assert!(line.contains("header cache 75%"), "{}", line);
    }

    #[test]
    fn test_default_has_no_clock() {
        let metrics = Metrics::default();
        assert_eq!(metrics.snapshot().elapsed, Duration::ZERO);
    }

    #[test]
    fn test_snapshot_file_uses_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        Metrics::new().snapshot().save_to_file(&path).unwrap();

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["bands_fetched"], 0);
        assert!(json["elapsed"].is_f64());
    }
}
