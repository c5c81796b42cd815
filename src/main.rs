//! AOI band calculation CLI
//!
//! Crops remote COG bands to an area of interest and derives products from them.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use aoi_bandcalc::aoi::parse_bbox;
use aoi_bandcalc::calc::{zonal_stats, PREDEFINED_INDICES};
use aoi_bandcalc::crs::ProjCache;
use aoi_bandcalc::{
    build_runtime, init_rayon, Aoi, BandCalcError, BandSetAcquirer, CalculationScheduler, CancellationToken, Coefficients, CogFetcher,
    Config, Metrics, PredefinedIndex, ProductKind, ProductProcessor, RasterAsset, RasterSource, TaskEvent, TaskOutcome,
};

#[derive(Parser)]
#[command(name = "aoi-bandcalc")]
#[command(about = "Crop COG bands to an AOI and compute band products", long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Override the band fetch concurrency
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Write a metrics snapshot (JSON) after a product run
    #[arg(long, global = true)]
    metrics_out: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Asset and AOI shared by the product commands.
#[derive(Args, Debug)]
struct TargetArgs {
    /// Asset record (JSON properties or feature)
    #[arg(long)]
    asset: PathBuf,

    /// AOI as xmin,ymin,xmax,ymax
    #[arg(long, allow_hyphen_values = true)]
    bbox: String,

    /// CRS of the bbox
    #[arg(long, default_value = "EPSG:4326")]
    crs: String,

    /// Recompute even when a cached product exists
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Crop one raster to an AOI
    Crop {
        /// URL, s3:// URI, or local path
        #[arg(long)]
        source: String,

        #[arg(long, allow_hyphen_values = true)]
        bbox: String,

        #[arg(long, default_value = "EPSG:4326")]
        crs: String,

        #[arg(short, long)]
        output: PathBuf,

        /// Output pixel size in source CRS units
        #[arg(long)]
        resolution: Option<f64>,
    },

    /// Crop several bands of an asset into the cache
    Acquire {
        #[arg(long)]
        asset: PathBuf,

        #[arg(long, value_delimiter = ',', default_value = "nir,red")]
        bands: Vec<String>,

        #[arg(long, allow_hyphen_values = true)]
        bbox: String,

        #[arg(long, default_value = "EPSG:4326")]
        crs: String,
    },

    /// Visual (true color) crop
    Visual(TargetArgs),

    /// NDVI product
    Ndvi(TargetArgs),

    /// NIR/Red/Green false color product
    FalseColor(TargetArgs),

    /// Custom formula over named bands
    Calc {
        #[command(flatten)]
        target: TargetArgs,

        /// Expression, e.g. "(nir - red) / (nir + red + L)"
        #[arg(long, allow_hyphen_values = true)]
        formula: String,

        #[arg(long, value_delimiter = ',')]
        bands: Vec<String>,

        /// Coefficient as name=value, repeatable
        #[arg(long = "coef", value_parser = parse_coefficient)]
        coefficients: Vec<(String, f64)>,

        /// Product name used in the output file name
        #[arg(long, default_value = "custom")]
        name: String,
    },

    /// Predefined spectral index
    Index {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        index: PredefinedIndex,
    },

    /// List predefined indices
    Indices,

    /// Zonal statistics of a raster within an AOI
    Stats {
        #[arg(long)]
        raster: PathBuf,

        #[arg(long, allow_hyphen_values = true)]
        bbox: String,

        #[arg(long, default_value = "EPSG:4326")]
        crs: String,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate => {
            load_config(cli.config.as_ref(), cli.cache_dir, cli.concurrency)?;
            println!("Configuration is valid");
        }
        Commands::GenerateConfig { output } => generate_config_command(&output)?,
        Commands::Indices => indices_command(),
        Commands::Stats { raster, bbox, crs } => {
            let aoi = parse_aoi(&bbox, &crs)?;
            let stats = zonal_stats(&raster, &aoi, &ProjCache::new())?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        command => {
            let config = load_config(cli.config.as_ref(), cli.cache_dir, cli.concurrency)?;
            init_rayon(config.processing.rayon_threads)?;
            let runtime = build_runtime(config.processing.worker_threads)?;
            runtime.block_on(run_command(command, Arc::new(config), cli.metrics_out))?;
        }
    }

    Ok(())
}

/// File (or defaults), then environment, then command-line overrides.
fn load_config(path: Option<&PathBuf>, cache_dir: Option<PathBuf>, concurrency: Option<usize>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };
    let mut config = config.with_env_overrides(|key| std::env::var(key).ok())?;

    if let Some(dir) = cache_dir {
        config.cache.dir = dir;
    }
    if let Some(c) = concurrency {
        config.fetch.concurrency = c;
    }

    config.validate()?;
    Ok(config)
}

async fn run_command(command: Commands, config: Arc<Config>, metrics_out: Option<PathBuf>) -> Result<()> {
    match command {
        Commands::Crop {
            source,
            bbox,
            crs,
            output,
            resolution,
        } => {
            let source = RasterSource::parse(&source)?;
            let aoi = parse_aoi(&bbox, &crs)?;
            let fetcher = CogFetcher::new(&config).with_target_resolution(resolution.or(config.fetch.target_resolution));
            let outcome = fetcher
                .fetch_cropped(&source, &aoi, &output, &CancellationToken::new())
                .await?;
            tracing::info!(
                "Cropped window {:?} to {}x{}{}",
                outcome.window,
                outcome.width,
                outcome.height,
                if outcome.resampled { " (resampled)" } else { "" }
            );
            println!("{}", outcome.path.display());
        }

        Commands::Acquire { asset, bands, bbox, crs } => {
            let asset = RasterAsset::from_json_file(&asset)?;
            let aoi = parse_aoi(&bbox, &crs)?;
            let sources = asset.band_sources(bands.as_slice())?;

            let fetcher = Arc::new(CogFetcher::new(&config));
            let acquirer = BandSetAcquirer::new(fetcher, config.fetch.concurrency);
            let acquisition = acquirer
                .acquire(
                    &asset.stac_id,
                    &sources,
                    &aoi,
                    &config.cache.asset_dir(&asset.stac_id),
                    &CancellationToken::new(),
                )
                .await?;

            for (band, path) in acquisition.band_set.iter() {
                println!("{}\t{}", band, path.display());
            }
            for band in bands.iter().filter(|b| !acquisition.band_set.contains(b)) {
                let reason = acquisition
                    .failures
                    .get(band)
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no URL in asset record".to_string());
                eprintln!("{}\tmissing: {}", band, reason);
            }
            if acquisition.band_set.is_empty() {
                anyhow::bail!("No bands acquired for {}", asset.stac_id);
            }
        }

        Commands::Visual(target) => run_product(config, target, ProductKind::Visual, metrics_out.as_deref()).await?,
        Commands::Ndvi(target) => run_product(config, target, ProductKind::Ndvi, metrics_out.as_deref()).await?,
        Commands::FalseColor(target) => run_product(config, target, ProductKind::FalseColor, metrics_out.as_deref()).await?,
        Commands::Index { target, index } => run_product(config, target, ProductKind::Predefined(index), metrics_out.as_deref()).await?,
        Commands::Calc {
            target,
            formula,
            bands,
            coefficients,
            name,
        } => {
            let kind = ProductKind::Custom {
                name,
                formula,
                coefficients: coefficients.into_iter().collect::<Coefficients>(),
                bands,
            };
            run_product(config, target, kind, metrics_out.as_deref()).await?
        }

        Commands::Indices | Commands::Stats { .. } | Commands::Validate | Commands::GenerateConfig { .. } => {
            anyhow::bail!("command does not run on the async runtime")
        }
    }

    Ok(())
}

/// Submit one product to the scheduler and wait for it within the configured timeout.
async fn run_product(
    config: Arc<Config>,
    target: TargetArgs,
    kind: ProductKind,
    metrics_out: Option<&Path>,
) -> Result<()> {
    let asset = RasterAsset::from_json_file(&target.asset)?;
    let aoi = parse_aoi(&target.bbox, &target.crs)?;

    let metrics = Metrics::new();
    let runtime = tokio::runtime::Handle::current();
    let processor = Arc::new(ProductProcessor::new(config.clone(), metrics.clone(), runtime.clone()));

    if !target.force {
        if let Some(path) = processor.find_cached_product(&asset.stac_id, &kind.product_name()) {
            tracing::info!("Using cached {} for {}", kind.product_name(), asset.stac_id);
            println!("{}", path.display());
            return Ok(());
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = CalculationScheduler::new(config.calculation.clone(), runtime)
        .with_events(tx)
        .with_metrics(metrics.clone());

    let logger = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                TaskEvent::Progress { key, percent } => tracing::info!("{}: {}%", key, percent),
                TaskEvent::Completed { key, path } => tracing::info!("{}: wrote {}", key, path.display()),
                TaskEvent::Failed { key, message } => tracing::error!("{}: {}", key, message),
                TaskEvent::Canceled { key } => tracing::warn!("{}: canceled", key),
            }
        }
    });

    let handle = processor.submit(&scheduler, asset, kind, aoi);
    let timeout = config.calculation.timeout();
    let outcome = scheduler.await_completion(handle, timeout).await;

    drop(scheduler);
    stop_event_logger(logger, &outcome).await;
    let snapshot = metrics.snapshot();
    tracing::info!("{}", snapshot);
    if let Some(path) = metrics_out {
        snapshot.save_to_file(path)?;
    }

    let path = outcome_result(outcome, timeout)?;
    println!("{}", path.display());
    Ok(())
}

/// Let the event logger drain, unless the job may still hold a sender.
///
/// A timed-out job keeps running on the blocking pool with its own event
/// sender, so waiting for the channel to close could outlive the timeout.
async fn stop_event_logger(logger: JoinHandle<()>, outcome: &TaskOutcome) {
    if matches!(outcome, TaskOutcome::TimedOut) {
        logger.abort();
    }
    let _ = logger.await;
}

fn outcome_result(outcome: TaskOutcome, timeout: Duration) -> Result<PathBuf> {
    match outcome {
        TaskOutcome::Completed(path) => Ok(path),
        TaskOutcome::Failed(message) => anyhow::bail!("Calculation failed: {}", message),
        TaskOutcome::Canceled => Err(BandCalcError::Canceled.into()),
        TaskOutcome::TimedOut => Err(BandCalcError::TimedOut(timeout).into()),
    }
}

fn parse_aoi(bbox: &str, crs: &str) -> Result<Aoi> {
    Ok(Aoi::from_bounds(parse_bbox(bbox)?, crs)?)
}

fn parse_coefficient(s: &str) -> std::result::Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid value for '{}': {}", name.trim(), e))?;
    Ok((name.trim().to_string(), value))
}

fn indices_command() {
    println!("{:<8} {:<16} {:<44} DESCRIPTION", "NAME", "BANDS", "FORMULA");
    for index in PREDEFINED_INDICES {
        println!(
            "{:<8} {:<16} {:<44} {}",
            index.name(),
            index.required_bands().join(","),
            index.formula(),
            index.description()
        );
    }
}

fn generate_config_command(output: &Path) -> Result<()> {
    let yaml = format!(
        "# AOI band calculation configuration\n\
         #\n\
         # Environment overrides: {} (cache.dir), {} (calculation.timeout_secs)\n\n{}",
        aoi_bandcalc::config::ENV_CACHE_DIR,
        aoi_bandcalc::config::ENV_TIMEOUT_SECS,
        Config::default().to_yaml()?
    );

    std::fs::write(output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
