//! Multi-band acquisition for one asset and AOI.
//!
//! Each band is fetched independently and concurrently. A band that fails is
//! logged and reported in [`Acquisition::missing`]; the remaining bands are
//! still fetched. Only cancellation aborts the whole acquisition.

use crate::aoi::Aoi;
use crate::cancel::CancellationToken;
use crate::error::{BandCalcError, Result};
use crate::io::RasterSource;
use crate::pipeline::CogFetcher;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Band name to cropped local raster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BandSet(BTreeMap<String, PathBuf>);

impl BandSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.0.insert(name.into(), path.into());
    }

    pub fn get(&self, name: &str) -> Option<&PathBuf> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Band names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PathBuf)> {
        self.0.iter()
    }

    /// The named bands only. Fails with `PartialBandFailure` listing every absent band.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> Result<BandSet> {
        let missing: BTreeSet<String> = names
            .iter()
            .map(|n| n.as_ref())
            .filter(|n| !self.contains(n))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(BandCalcError::PartialBandFailure {
                missing: missing.into_iter().collect(),
            });
        }
        Ok(names
            .iter()
            .filter_map(|n| self.0.get_key_value(n.as_ref()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

impl FromIterator<(String, PathBuf)> for BandSet {
    fn from_iter<I: IntoIterator<Item = (String, PathBuf)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What one acquisition produced.
#[derive(Debug, Default)]
pub struct Acquisition {
    /// Bands whose fetch and crop succeeded
    pub band_set: BandSet,
    /// Declared bands minus acquired bands
    pub missing: BTreeSet<String>,
    /// Why each missing band failed
    pub failures: BTreeMap<String, BandCalcError>,
}

impl Acquisition {
    /// The band set, or `PartialBandFailure` naming the required bands that are missing.
    pub fn require(&self, required: &[&str]) -> Result<BandSet> {
        self.band_set.subset(required)
    }
}

/// Deterministic crop filename for one band of one asset.
pub fn band_cache_path(dest_dir: &Path, asset_id: &str, band: &str) -> PathBuf {
    dest_dir.join(format!("{}_{}_aoi.tif", asset_id, band))
}

/// Fetches the declared bands of an asset into a cache directory.
pub struct BandSetAcquirer {
    fetcher: Arc<CogFetcher>,
    concurrency: usize,
}

impl BandSetAcquirer {
    pub fn new(fetcher: Arc<CogFetcher>, concurrency: usize) -> Self {
        Self {
            fetcher,
            concurrency: concurrency.max(1),
        }
    }

    /// Fetch every band in `sources`, cropped to `aoi`, into `dest_dir`.
    ///
    /// Always re-fetches. Per-band failures (including no intersection) are
    /// absorbed into the result; only a cancellation returns `Err`.
    pub async fn acquire(
        &self,
        asset_id: &str,
        sources: &BTreeMap<String, RasterSource>,
        aoi: &Aoi,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Acquisition> {
        cancel.check()?;
        tracing::info!(
            "Acquiring {} bands of {} ({} concurrent)",
            sources.len(),
            asset_id,
            self.concurrency
        );

        let results: Vec<(String, Result<PathBuf>)> = stream::iter(sources.iter())
            .map(|(band, source)| {
                let dest = band_cache_path(dest_dir, asset_id, band);
                async move {
                    let result = self
                        .fetcher
                        .fetch_cropped(source, aoi, &dest, cancel)
                        .await
                        .map(|outcome| outcome.path);
                    (band.clone(), result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut acquisition = Acquisition::default();
        for (band, result) in results {
            match result {
                Ok(path) => acquisition.band_set.insert(band, path),
                Err(BandCalcError::Canceled) => {}
                Err(e) => {
                    let source = sources.get(&band).map(|s| s.to_string()).unwrap_or_default();
                    tracing::warn!("Band '{}' of {} failed ({}): {}", band, asset_id, source, e);
                    acquisition.missing.insert(band.clone());
                    acquisition.failures.insert(band, e);
                }
            }
        }
        cancel.check()?;

        tracing::info!(
            "Downloaded {}/{} bands for {}",
            acquisition.band_set.len(),
            sources.len(),
            asset_id
        );
        if !acquisition.missing.is_empty() {
            let missing: Vec<&str> = acquisition.missing.iter().map(String::as_str).collect();
            tracing::warn!("Missing bands for {}: {}", asset_id, missing.join(", "));
        }

        Ok(acquisition)
    }
}
