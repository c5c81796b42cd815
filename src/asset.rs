//! Raster asset records as delivered by the catalogue API.
//!
//! An asset is one acquisition with a URL per band. Records arrive as the
//! `properties` object of a STAC-like feature:
//!
//! ```json
//! {"stac_id": "S2A_...", "cloud": 3.2, "tanggal": "2024-05-01T02:30:00Z",
//!  "visual": "https://.../TCI.tif", "asset_nir": "https://.../B08.tif", ...}
//! ```

use crate::error::{BandCalcError, Result};
use crate::io::RasterSource;
use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Band names an asset can carry.
pub const ASSET_BANDS: [&str; 5] = ["visual", "nir", "red", "green", "blue"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterAsset {
    #[serde(default = "unknown_id")]
    pub stac_id: String,

    #[serde(rename = "cloud", default)]
    pub cloud_cover: f64,

    #[serde(rename = "thumb", default)]
    pub thumbnail: Option<String>,

    #[serde(default, deserialize_with = "optional_source")]
    pub visual: Option<RasterSource>,

    #[serde(rename = "asset_nir", default, deserialize_with = "optional_source")]
    pub nir: Option<RasterSource>,

    #[serde(rename = "asset_red", default, deserialize_with = "optional_source")]
    pub red: Option<RasterSource>,

    #[serde(rename = "asset_green", default, deserialize_with = "optional_source")]
    pub green: Option<RasterSource>,

    #[serde(rename = "asset_blue", default, deserialize_with = "optional_source")]
    pub blue: Option<RasterSource>,

    /// Capture time; unparseable values become `None`
    #[serde(rename = "tanggal", default, deserialize_with = "lenient_datetime")]
    pub acquired: Option<DateTime<Utc>>,
}

fn unknown_id() -> String {
    "UNKNOWN".to_string()
}

impl RasterAsset {
    /// Parse a record, either bare properties or a feature wrapping them.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(json).context("Invalid asset JSON")?;
        if value.get("properties").is_some_and(|p| p.is_object()) {
            value = value["properties"].take();
        }
        serde_json::from_value(value).context("Invalid asset record")
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Failed to load asset from {}", path.display()))
    }

    /// Source of a named band, if the record has a URL for it.
    pub fn source(&self, band: &str) -> Option<&RasterSource> {
        match band {
            "visual" => self.visual.as_ref(),
            "nir" => self.nir.as_ref(),
            "red" => self.red.as_ref(),
            "green" => self.green.as_ref(),
            "blue" => self.blue.as_ref(),
            _ => None,
        }
    }

    /// Sources for the requested bands that have a URL. Unknown band names are rejected.
    pub fn band_sources<S: AsRef<str>>(&self, bands: &[S]) -> Result<BTreeMap<String, RasterSource>> {
        let unknown: Vec<&str> = bands
            .iter()
            .map(|b| b.as_ref())
            .filter(|b| !ASSET_BANDS.contains(b))
            .collect();
        if !unknown.is_empty() {
            return Err(BandCalcError::Validation(format!(
                "unknown band(s) {}; assets carry {}",
                unknown.join(", "),
                ASSET_BANDS.join(", ")
            )));
        }

        Ok(bands
            .iter()
            .filter_map(|b| self.source(b.as_ref()).map(|s| (b.as_ref().to_string(), s.clone())))
            .collect())
    }

    /// Where a full local copy of `band` lives under `cache_dir`: `{cache_dir}/{stac_id}/{file name}`.
    pub fn local_path(&self, cache_dir: &Path, band: &str) -> Option<PathBuf> {
        let name = match self.source(band)? {
            RasterSource::Http(url) => {
                let path = url.split(['?', '#']).next().unwrap_or(url);
                path.rsplit('/').next().filter(|n| !n.is_empty())?.to_string()
            }
            RasterSource::S3 { key, .. } => key.rsplit('/').next().filter(|n| !n.is_empty())?.to_string(),
            RasterSource::Local(path) => path.file_name()?.to_str()?.to_string(),
        };
        Some(cache_dir.join(&self.stac_id).join(name))
    }
}

/// Empty or null URLs mean "no such band".
fn optional_source<'de, D>(deserializer: D) -> std::result::Result<Option<RasterSource>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) if !s.trim().is_empty() => RasterSource::parse(&s)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("{:#}", e))),
        _ => Ok(None),
    }
}

fn lenient_datetime<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.as_deref().and_then(parse_datetime))
}

/// RFC 3339 (with `Z` or an offset), or a naive ISO timestamp taken as UTC.
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FEATURE: &str = r#"{
        "type": "Feature",
        "properties": {
            "stac_id": "S2A_MSIL2A_20240501",
            "cloud": 3.5,
            "thumb": "https://example.com/thumb.jpg",
            "visual": "https://example.com/S2A/TCI.tif?token=abc",
            "asset_nir": "s3://sentinel-cogs/S2A/B08.tif",
            "asset_red": "https://example.com/S2A/B04.tif",
            "asset_green": "",
            "tanggal": "2024-05-01T02:30:00Z"
        }
    }"#;

    #[test]
    fn test_parse_feature() {
        let asset = RasterAsset::from_json(FEATURE).unwrap();
        assert_eq!(asset.stac_id, "S2A_MSIL2A_20240501");
        assert_eq!(asset.cloud_cover, 3.5);
        assert_eq!(asset.green, None);
        assert_eq!(asset.blue, None);
        assert_eq!(
            asset.nir,
            Some(RasterSource::S3 {
                bucket: "sentinel-cogs".to_string(),
                key: "S2A/B08.tif".to_string()
            })
        );
        assert_eq!(asset.acquired, Some(Utc.with_ymd_and_hms(2024, 5, 1, 2, 30, 0).unwrap()));
    }

    #[test]
    fn test_bare_properties_with_defaults() {
        let asset = RasterAsset::from_json(r#"{"tanggal": "not a date"}"#).unwrap();
        assert_eq!(asset.stac_id, "UNKNOWN");
        assert_eq!(asset.cloud_cover, 0.0);
        assert_eq!(asset.acquired, None);
    }

    #[test]
    fn test_band_sources_skip_missing_urls() {
        let asset = RasterAsset::from_json(FEATURE).unwrap();
        let sources = asset.band_sources(&["nir", "red", "green"]).unwrap();
        assert_eq!(sources.keys().collect::<Vec<_>>(), ["nir", "red"]);

        let err = asset.band_sources(&["nir", "swir16"]).unwrap_err();
        assert!(matches!(err, BandCalcError::Validation(ref msg) if msg.contains("swir16")));
    }

    #[test]
    fn test_local_path_strips_query() {
        let asset = RasterAsset::from_json(FEATURE).unwrap();
        assert_eq!(
            asset.local_path(Path::new("/cache"), "visual"),
            Some(PathBuf::from("/cache/S2A_MSIL2A_20240501/TCI.tif"))
        );
        assert_eq!(
            asset.local_path(Path::new("/cache"), "nir"),
            Some(PathBuf::from("/cache/S2A_MSIL2A_20240501/B08.tif"))
        );
        assert_eq!(asset.local_path(Path::new("/cache"), "green"), None);
    }

    #[test]
    fn test_parse_datetime_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 2, 30, 0).unwrap();
        assert_eq!(parse_datetime("2024-05-01T02:30:00Z"), Some(expected));
        assert_eq!(parse_datetime("2024-05-01T09:30:00+07:00"), Some(expected));
        assert_eq!(parse_datetime("2024-05-01T02:30:00"), Some(expected));
        assert_eq!(parse_datetime(""), None);
    }
}
