//! Area of Interest.

use crate::crs::Bounds;
use crate::error::{BandCalcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An axis-aligned rectangle plus the CRS it is expressed in.
///
/// Construction validates the rectangle, so every `Aoi` in circulation has a
/// positive, finite area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AoiRepr", into = "AoiRepr")]
pub struct Aoi {
    bounds: Bounds,
    crs: String,
}

impl Aoi {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64, crs: impl Into<String>) -> Result<Self> {
        let crs = crs.into();
        let bounds = [xmin, ymin, xmax, ymax];

        if bounds.iter().any(|v| !v.is_finite()) {
            return Err(BandCalcError::Validation(format!(
                "AOI coordinates must be finite, got {:?}",
                bounds
            )));
        }
        if xmax <= xmin || ymax <= ymin {
            return Err(BandCalcError::Validation(format!(
                "AOI must have positive area, got [{}, {}, {}, {}]",
                xmin, ymin, xmax, ymax
            )));
        }
        if crs.trim().is_empty() {
            return Err(BandCalcError::Validation("AOI CRS must not be empty".to_string()));
        }

        Ok(Self { bounds, crs })
    }

    pub fn from_bounds(bounds: Bounds, crs: impl Into<String>) -> Result<Self> {
        Self::new(bounds[0], bounds[1], bounds[2], bounds[3], crs)
    }

    /// `[xmin, ymin, xmax, ymax]`
    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn crs(&self) -> &str {
        &self.crs
    }

    pub fn width(&self) -> f64 {
        self.bounds[2] - self.bounds[0]
    }

    pub fn height(&self) -> f64 {
        self.bounds[3] - self.bounds[1]
    }
}

impl fmt::Display for Aoi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.6}, {:.6}, {:.6}, {:.6}] ({})",
            self.bounds[0], self.bounds[1], self.bounds[2], self.bounds[3], self.crs
        )
    }
}

/// Parse a `xmin,ymin,xmax,ymax` bounding box string.
pub fn parse_bbox(s: &str) -> Result<Bounds> {
    let values = s
        .split(',')
        .map(|part| f64::from_str(part.trim()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| BandCalcError::Validation(format!("invalid bbox '{}': {}", s, e)))?;

    match values.as_slice() {
        [xmin, ymin, xmax, ymax] => Ok([*xmin, *ymin, *xmax, *ymax]),
        _ => Err(BandCalcError::Validation(format!(
            "bbox must have 4 comma-separated values, got {} in '{}'",
            values.len(),
            s
        ))),
    }
}

#[derive(Serialize, Deserialize)]
struct AoiRepr {
    bounds: Bounds,
    crs: String,
}

impl TryFrom<AoiRepr> for Aoi {
    type Error = BandCalcError;

    fn try_from(repr: AoiRepr) -> Result<Self> {
        Aoi::from_bounds(repr.bounds, repr.crs)
    }
}

impl From<Aoi> for AoiRepr {
    fn from(aoi: Aoi) -> Self {
        AoiRepr {
            bounds: aoi.bounds,
            crs: aoi.crs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_aoi() {
        let aoi = Aoi::new(100.0, 100.0, 200.0, 200.0, "EPSG:4326").unwrap();
        assert_eq!(aoi.bounds(), &[100.0, 100.0, 200.0, 200.0]);
        assert_eq!(aoi.width(), 100.0);
        assert_eq!(aoi.height(), 100.0);
        assert_eq!(aoi.crs(), "EPSG:4326");
    }

    #[test]
    fn test_degenerate_aoi_rejected() {
        assert!(matches!(
            Aoi::new(1.0, 1.0, 1.0, 2.0, "EPSG:4326"),
            Err(BandCalcError::Validation(_))
        ));
        assert!(Aoi::new(0.0, 5.0, 1.0, 5.0, "EPSG:4326").is_err());
        assert!(Aoi::new(2.0, 0.0, 1.0, 1.0, "EPSG:4326").is_err());
        assert!(Aoi::new(0.0, 0.0, f64::NAN, 1.0, "EPSG:4326").is_err());
        assert!(Aoi::new(0.0, 0.0, 1.0, 1.0, " ").is_err());
    }

    #[test]
    fn test_parse_bbox() {
        assert_eq!(parse_bbox("1, 2,3 ,4").unwrap(), [1.0, 2.0, 3.0, 4.0]);
        assert!(parse_bbox("1,2,3").is_err());
        assert!(parse_bbox("1,2,three,4").is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Aoi = serde_json::from_str(r#"{"bounds":[0,0,1,1],"crs":"EPSG:4326"}"#).unwrap();
        assert_eq!(ok.width(), 1.0);

        let bad = serde_json::from_str::<Aoi>(r#"{"bounds":[0,0,0,1],"crs":"EPSG:4326"}"#);
        assert!(bad.is_err());
    }
}
