//! Raster source addressing and object store construction.
//!
//! Every source, remote or local, is read through `object_store` so the COG
//! reader issues the same range requests against HTTP, S3, and local disk.

use crate::config::NetworkConfig;
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::http::HttpBuilder;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Where one band's raster lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RasterSource {
    /// `http://` or `https://` URL
    Http(String),
    /// `s3://bucket/key`
    S3 { bucket: String, key: String },
    /// Local filesystem path
    Local(PathBuf),
}

impl RasterSource {
    /// Parse a source string by scheme. Anything without a known scheme is a local path.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.starts_with("http://") || s.starts_with("https://") {
            parse_http_url(s)?;
            Ok(Self::Http(s.to_string()))
        } else if s.starts_with("s3://") {
            let (bucket, key) = parse_s3_uri(s)?;
            Ok(Self::S3 {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        } else if let Some(path) = s.strip_prefix("file://") {
            Ok(Self::Local(PathBuf::from(path)))
        } else if s.is_empty() {
            anyhow::bail!("Empty raster source")
        } else {
            Ok(Self::Local(PathBuf::from(s)))
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Local(_))
    }

    /// Create the object store for this source and the object's path within it.
    pub fn open_store(&self, network: &NetworkConfig) -> Result<(Arc<dyn ObjectStore>, Path)> {
        match self {
            Self::Http(url) => {
                let (origin, path) = parse_http_url(url)?;
                let store = HttpBuilder::new()
                    .with_url(origin)
                    .with_client_options(create_client_options(network))
                    .with_retry(create_retry_config())
                    .build()
                    .with_context(|| format!("Failed to create HTTP client for {}", origin))?;
                let path = Path::from_url_path(path)
                    .with_context(|| format!("Invalid URL path: {}", path))?;
                Ok((Arc::new(store), path))
            }
            Self::S3 { bucket, key } => {
                let store = create_anonymous_store(bucket, network)?;
                let path = Path::parse(key).with_context(|| format!("Invalid S3 key: {}", key))?;
                Ok((store, path))
            }
            Self::Local(file) => {
                let parent = match file.parent() {
                    Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                    _ => PathBuf::from("."),
                };
                let file_name = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| format!("Invalid local raster path: {}", file.display()))?;
                let store = LocalFileSystem::new_with_prefix(&parent)
                    .with_context(|| format!("Cannot access directory {}", parent.display()))?;
                Ok((Arc::new(store), Path::from(file_name)))
            }
        }
    }
}

impl fmt::Display for RasterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => write!(f, "{}", url),
            Self::S3 { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

impl TryFrom<String> for RasterSource {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<RasterSource> for String {
    fn from(source: RasterSource) -> Self {
        source.to_string()
    }
}

impl std::str::FromStr for RasterSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    match without_scheme.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
        _ => anyhow::bail!("Invalid S3 URI: expected 's3://bucket/key' format in '{}'", uri),
    }
}

/// Split an HTTP(S) URL into origin (`scheme://host[:port]`) and object path.
pub fn parse_http_url(url: &str) -> Result<(&str, &str)> {
    let scheme_end = url
        .find("://")
        .with_context(|| format!("Invalid URL: missing scheme in '{}'", url))?;
    let after_scheme = &url[scheme_end + 3..];
    let host_end = after_scheme
        .find('/')
        .with_context(|| format!("Invalid URL: missing object path in '{}'", url))?;
    if host_end == 0 {
        anyhow::bail!("Invalid URL: missing host in '{}'", url);
    }

    let origin = &url[..scheme_end + 3 + host_end];
    let path = after_scheme[host_end + 1..]
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        anyhow::bail!("Invalid URL: missing object path in '{}'", url);
    }
    Ok((origin, path))
}

/// Client options for remote COG access.
fn create_client_options(network: &NetworkConfig) -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(network.connect_timeout_secs))
        .with_timeout(Duration::from_secs(network.request_timeout_secs))
        .with_pool_idle_timeout(Duration::from_secs(90))
}

/// Requests are not retried; failures are reported to the caller.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 0,
        ..Default::default()
    }
}

/// Create an anonymous S3 client for reading public COG buckets.
pub fn create_anonymous_store(bucket: &str, network: &NetworkConfig) -> Result<Arc<dyn ObjectStore>> {
    tracing::debug!("Creating anonymous S3 client for bucket: {}", bucket);

    let builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region(&network.s3_region)
        .with_client_options(create_client_options(network))
        .with_retry(create_retry_config())
        .with_skip_signature(true);

    Ok(Arc::new(builder.build()?))
}
