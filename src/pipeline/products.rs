//! Product tasks: one derived raster per (asset, AOI, product kind).
//!
//! A product run acquires the bands its kind needs, runs the matching
//! kernel, and leaves a timestamped GeoTIFF in the asset's cache
//! directory. Runs are submitted to the [`CalculationScheduler`] keyed by
//! `(asset_id, product_name)`.

use crate::aoi::Aoi;
use crate::asset::RasterAsset;
use crate::calc::{Coefficients, IndexCalculator, PredefinedIndex};
use crate::config::Config;
use crate::error::{BandCalcError, Result};
use crate::io::{is_valid_raster, GeoTiffOptions};
use crate::pipeline::{BandSet, BandSetAcquirer, CalculationScheduler, CogFetcher, Metrics, TaskContext, TaskHandle, TaskKey};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Closed set of products a caller can request.
#[derive(Debug, Clone, PartialEq)]
pub enum ProductKind {
    /// AOI crop of the asset's 3-band visual COG
    Visual,
    Ndvi,
    /// NIR/Red/Green composite
    FalseColor,
    /// User formula over the listed bands
    Custom {
        name: String,
        formula: String,
        coefficients: Coefficients,
        bands: Vec<String>,
    },
    Predefined(PredefinedIndex),
}

impl ProductKind {
    /// Name used in output file names and task keys.
    pub fn product_name(&self) -> String {
        match self {
            Self::Visual => "visual".to_string(),
            Self::Ndvi => "ndvi".to_string(),
            Self::FalseColor => "falsecolor".to_string(),
            Self::Custom { name, .. } => name.clone(),
            Self::Predefined(index) => index.name().to_ascii_lowercase(),
        }
    }

    /// Reject custom names that cannot be used as a file-name component.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Custom { name, .. } => validate_product_name(name),
            _ => Ok(()),
        }
    }

    /// Asset bands this product reads.
    pub fn required_bands(&self) -> Vec<String> {
        let bands: &[&str] = match self {
            Self::Visual => &["visual"],
            Self::Ndvi => &["nir", "red"],
            Self::FalseColor => &["nir", "red", "green"],
            Self::Custom { bands, .. } => return bands.clone(),
            Self::Predefined(index) => index.required_bands(),
        };
        bands.iter().map(|b| b.to_string()).collect()
    }
}

/// Runs product tasks against the configured cache.
pub struct ProductProcessor {
    config: Arc<Config>,
    fetcher: Arc<CogFetcher>,
    acquirer: BandSetAcquirer,
    calculator: IndexCalculator,
    runtime: Handle,
}

impl ProductProcessor {
    pub fn new(config: Arc<Config>, metrics: Arc<Metrics>, runtime: Handle) -> Self {
        let fetcher = Arc::new(CogFetcher::with_metrics(&config, metrics.clone()));
        Self {
            acquirer: BandSetAcquirer::new(fetcher.clone(), config.fetch.concurrency),
            calculator: IndexCalculator::with_metrics(GeoTiffOptions::from_config(&config.output), metrics),
            fetcher,
            config,
            runtime,
        }
    }

    /// `{cache}/{asset}/{asset}_{product}_aoi_{YYYYmmdd_HHMMSS}.tif`
    ///
    /// Both names must stay inside the cache directory.
    pub fn output_path(&self, asset_id: &str, product: &str) -> Result<PathBuf> {
        validate_asset_id(asset_id)?;
        validate_product_name(product)?;
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        Ok(self
            .config
            .cache
            .asset_dir(asset_id)
            .join(format!("{}_{}_aoi_{}.tif", asset_id, product, timestamp)))
    }

    /// Newest valid product previously written for `(asset_id, product)`.
    ///
    /// Callers check this before submitting to skip recomputation.
    pub fn find_cached_product(&self, asset_id: &str, product: &str) -> Option<PathBuf> {
        validate_asset_id(asset_id).ok()?;
        validate_product_name(product).ok()?;
        find_newest_product(&self.config.cache.asset_dir(asset_id), asset_id, product)
    }

    /// Produce `kind` for `asset` over `aoi`. Runs on a blocking thread.
    ///
    /// Progress: 10 started, 20 bands resolved, 40 bands acquired,
    /// 70 kernel done, 90 output verified. The scheduler reports 100.
    /// Visual runs have no kernel: 70 marks the written crop.
    pub fn process(&self, asset: &RasterAsset, kind: &ProductKind, aoi: &Aoi, ctx: &TaskContext) -> Result<PathBuf> {
        kind.validate()?;
        ctx.set_progress(10);
        ctx.check_canceled()?;

        let asset_id = asset.stac_id.as_str();
        let dest = self.output_path(asset_id, &kind.product_name())?;
        let cancel = ctx.cancellation();
        tracing::info!("Processing {} for {} over {}", kind.product_name(), asset_id, aoi);

        let outcome = match kind {
            ProductKind::Visual => return self.crop_visual(asset, aoi, &dest, ctx),
            ProductKind::Ndvi => {
                let bands = self.acquire(asset, kind, aoi, ctx)?;
                self.calculator.calculate_ndvi(&bands, &dest, cancel)?
            }
            ProductKind::FalseColor => {
                let bands = self.acquire(asset, kind, aoi, ctx)?;
                self.calculator.create_false_color(&bands, &dest, cancel)?
            }
            ProductKind::Custom {
                formula, coefficients, ..
            } => {
                let bands = self.acquire(asset, kind, aoi, ctx)?;
                self.calculator.calculate_formula(formula, &bands, coefficients, &dest, cancel)?
            }
            ProductKind::Predefined(index) => {
                let bands = self.acquire(asset, kind, aoi, ctx)?;
                self.calculator.calculate_predefined_index(*index, &bands, &dest, cancel)?
            }
        };
        ctx.set_progress(70);
        if let Some(message) = outcome.message {
            tracing::info!("{}: {}", ctx.key(), message);
        }

        self.finish(outcome.path, ctx)
    }

    /// Submit [`process`](Self::process) to `scheduler`.
    pub fn submit(
        self: &Arc<Self>,
        scheduler: &CalculationScheduler,
        asset: RasterAsset,
        kind: ProductKind,
        aoi: Aoi,
    ) -> TaskHandle {
        let key = TaskKey::new(asset.stac_id.clone(), kind.product_name());
        let processor = Arc::clone(self);
        scheduler.run_async(key, move |ctx| processor.process(&asset, &kind, &aoi, ctx))
    }

    /// Fetch the kind's bands into the asset directory and require all of them.
    fn acquire(&self, asset: &RasterAsset, kind: &ProductKind, aoi: &Aoi, ctx: &TaskContext) -> Result<BandSet> {
        let required = kind.required_bands();
        let sources = asset.band_sources(required.as_slice())?;
        ctx.set_progress(20);
        ctx.check_canceled()?;

        let dir = self.config.cache.asset_dir(&asset.stac_id);
        let acquisition = self.runtime.block_on(self.acquirer.acquire(
            &asset.stac_id,
            &sources,
            aoi,
            &dir,
            ctx.cancellation(),
        ))?;

        let required: Vec<&str> = required.iter().map(String::as_str).collect();
        let bands = acquisition.require(&required)?;
        ctx.set_progress(40);
        ctx.check_canceled()?;
        Ok(bands)
    }

    /// Crop the visual COG, from a full local copy when one exists.
    fn crop_visual(&self, asset: &RasterAsset, aoi: &Aoi, dest: &Path, ctx: &TaskContext) -> Result<PathBuf> {
        let source = asset.visual.as_ref().ok_or_else(|| BandCalcError::PartialBandFailure {
            missing: vec!["visual".to_string()],
        })?;
        ctx.set_progress(20);

        let local = asset
            .local_path(&self.config.cache.dir, "visual")
            .filter(|p| p.is_file());
        let outcome = match local {
            Some(path) => {
                tracing::info!("Using local copy {}", path.display());
                self.runtime
                    .block_on(self.fetcher.crop_local_file_to_aoi(&path, aoi, dest, ctx.cancellation()))?
            }
            None => self
                .runtime
                .block_on(self.fetcher.fetch_cropped(source, aoi, dest, ctx.cancellation()))?,
        };
        ctx.set_progress(70);

        self.finish(outcome.path, ctx)
    }

    fn finish(&self, path: PathBuf, ctx: &TaskContext) -> Result<PathBuf> {
        ctx.check_canceled()?;
        if !is_valid_raster(&path) {
            return Err(BandCalcError::write(&path, "output is not a readable raster"));
        }
        ctx.set_progress(90);
        Ok(path)
    }
}

/// ASCII letters, digits, `_` and `-`.
fn validate_product_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(BandCalcError::Validation(format!(
            "invalid product name '{}': use letters, digits, '_' or '-'",
            name
        )));
    }
    Ok(())
}

/// Asset ids name a directory under the cache: a single, non-relative component.
fn validate_asset_id(asset_id: &str) -> Result<()> {
    let valid = !asset_id.is_empty()
        && asset_id != "."
        && asset_id != ".."
        && !asset_id.contains(['/', '\\']);
    if !valid {
        return Err(BandCalcError::Validation(format!("invalid asset id '{}'", asset_id)));
    }
    Ok(())
}

/// Timestamped names sort chronologically, so the newest is the greatest.
fn find_newest_product(dir: &Path, asset_id: &str, product: &str) -> Option<PathBuf> {
    let prefix = format!("{}_{}_aoi_", asset_id, product);
    let entries = std::fs::read_dir(dir).ok()?;

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".tif"))
        })
        .collect();
    candidates.sort();

    candidates.into_iter().rev().find(|p| is_valid_raster(p))
}
