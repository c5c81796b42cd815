//! Configuration for the band acquisition and calculation pipeline.
//!
//! Built once at startup (file, then environment, then CLI overrides) and
//! handed to components by reference. Nothing below `main` reads the
//! environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local cache directory layout
    #[serde(default)]
    pub cache: CacheConfig,

    /// HTTP / S3 client settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Band fetch settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Output GeoTIFF layout
    #[serde(default)]
    pub output: OutputConfig,

    /// Scheduled calculation settings
    #[serde(default)]
    pub calculation: CalculationConfig,

    /// Thread pools
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Cache directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory; per-asset crops and products live in `{dir}/{asset_id}/`
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { dir: default_cache_dir() }
    }
}

impl CacheConfig {
    /// Directory holding one asset's cropped bands and derived products.
    pub fn asset_dir(&self, asset_id: &str) -> PathBuf {
        self.dir.join(asset_id)
    }
}

/// Object store client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection establishment timeout
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Region for `s3://` sources (anonymous access)
    #[serde(default = "default_s3_region")]
    pub s3_region: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            s3_region: default_s3_region(),
        }
    }
}

/// Band fetch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum concurrent band fetches per acquisition
    #[serde(default = "default_fetch_concurrency")]
    pub concurrency: usize,

    /// Resample crops to this pixel size (source CRS units). None keeps native.
    #[serde(default)]
    pub target_resolution: Option<f64>,

    /// Maximum entries in the remote TIFF metadata cache
    #[serde(default = "default_metadata_cache_entries")]
    pub metadata_cache_entries: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_fetch_concurrency(),
            target_resolution: None,
            metadata_cache_entries: default_metadata_cache_entries(),
        }
    }
}

/// Output GeoTIFF configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// GTiff COMPRESS creation option
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Internal tile size (BLOCKXSIZE / BLOCKYSIZE), multiple of 16
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            block_size: default_block_size(),
        }
    }
}

/// Scheduled calculation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationConfig {
    /// Deadline for a scheduled calculation
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Interval between progress log lines while waiting
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for CalculationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl CalculationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Thread pool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for per-pixel work
    #[serde(default)]
    pub rayon_threads: Option<usize>,
}

/// Environment variable overriding `cache.dir`.
pub const ENV_CACHE_DIR: &str = "AOI_BANDCALC_CACHE_DIR";
/// Environment variable overriding `calculation.timeout_secs`.
pub const ENV_TIMEOUT_SECS: &str = "AOI_BANDCALC_TIMEOUT_SECS";

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Apply overrides from a variable lookup (normally `std::env::var`).
    ///
    /// Called once by the binary at startup.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.cache.dir = PathBuf::from(dir);
        }
        if let Some(secs) = lookup(ENV_TIMEOUT_SECS) {
            self.calculation.timeout_secs = secs
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", ENV_TIMEOUT_SECS, secs, e))?;
        }
        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.dir.as_os_str().is_empty() {
            anyhow::bail!("cache.dir must not be empty");
        }
        if self.fetch.concurrency == 0 {
            anyhow::bail!("fetch.concurrency must be > 0");
        }
        if let Some(res) = self.fetch.target_resolution {
            if !(res.is_finite() && res > 0.0) {
                anyhow::bail!("fetch.target_resolution must be a positive number, got {}", res);
            }
        }
        if self.fetch.metadata_cache_entries == 0 {
            anyhow::bail!("fetch.metadata_cache_entries must be > 0");
        }
        if self.output.block_size == 0 || self.output.block_size % 16 != 0 {
            anyhow::bail!("output.block_size must be a positive multiple of 16");
        }
        if self.calculation.timeout_secs == 0 {
            anyhow::bail!("calculation.timeout_secs must be > 0");
        }
        if self.calculation.poll_interval_ms == 0 {
            anyhow::bail!("calculation.poll_interval_ms must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_cache_dir() -> PathBuf { PathBuf::from("aoi_cache") }
fn default_connect_timeout_secs() -> u64 { 5 }
fn default_request_timeout_secs() -> u64 { 60 }
fn default_s3_region() -> String { "us-west-2".to_string() }
fn default_fetch_concurrency() -> usize { 4 }
fn default_metadata_cache_entries() -> usize { 1024 }
fn default_compression() -> String { "LZW".to_string() }
fn default_block_size() -> usize { 256 }
fn default_timeout_secs() -> u64 { 300 }
fn default_poll_interval_ms() -> u64 { 100 }
