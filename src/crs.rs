//! CRS handling for AOI bounds.
//!
//! AOIs arrive in whatever CRS the caller drew them in (usually WGS84 or the
//! map's projected CRS). Rasters carry their own CRS, typically a UTM zone for
//! Sentinel-2 style COGs. Everything here moves bounds between the two.
//!
//! Bounds are always `[west, south, east, north]` in the units of their CRS,
//! so WGS84 bounds read `[lon_min, lat_min, lon_max, lat_max]`.

/// CRS identifiers used across the crate.
pub mod codes {
    /// Geographic lon/lat, degrees.
    pub const WGS84: &str = "EPSG:4326";
}

use anyhow::{anyhow, Context, Result};
use proj::Proj;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// `[west, south, east, north]`
pub type Bounds = [f64; 4];

/// Edge samples used when transforming AOI bounds between CRSs.
pub const DEFAULT_DENSIFY_SAMPLES: usize = 20;

type CrsPair = (String, String);

/// Projections keyed by normalized `(from, to)` CRS pair.
///
/// `Proj` is not `Send`: build one of these per blocking job, never hold it
/// across an `.await`.
#[derive(Default)]
pub struct ProjCache {
    projections: RwLock<HashMap<CrsPair, Arc<Proj>>>,
}

impl ProjCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Projection from `from_crs` to `to_crs`, built on first use.
    pub fn get(&self, from_crs: &str, to_crs: &str) -> Result<Arc<Proj>> {
        let pair = (normalize_crs(from_crs), normalize_crs(to_crs));

        let cached = self
            .projections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&pair)
            .cloned();
        if let Some(proj) = cached {
            return Ok(proj);
        }

        let proj = Proj::new_known_crs(&pair.0, &pair.1, None)
            .map(Arc::new)
            .with_context(|| format!("No projection from {} to {}", from_crs, to_crs))?;
        self.projections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(pair)
            .or_insert_with(|| proj.clone());
        Ok(proj)
    }

    pub fn len(&self) -> usize {
        self.projections.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trimmed and upper-cased, so `epsg:4326` and `EPSG:4326` compare equal.
pub fn normalize_crs(crs: &str) -> String {
    crs.trim().to_ascii_uppercase()
}

pub fn same_crs(a: &str, b: &str) -> bool {
    normalize_crs(a) == normalize_crs(b)
}

/// `EPSG:{code}`
pub fn epsg(code: u16) -> String {
    format!("EPSG:{}", code)
}

/// Envelope of `samples + 1` points along each edge of `bounds`.
///
/// Projected edges curve, so corners alone can undershoot the true extent.
/// Points that fail to project are skipped; only a fully unprojectable
/// rectangle is an error.
pub fn transform_bounds_with_densification(
    bounds: &Bounds,
    from_crs: &str,
    to_crs: &str,
    cache: &ProjCache,
    samples: usize,
) -> Result<Bounds> {
    if same_crs(from_crs, to_crs) {
        return Ok(*bounds);
    }
    let proj = cache.get(from_crs, to_crs)?;

    let [west, south, east, north] = *bounds;
    let steps = samples.max(1);
    let mut envelope = Envelope::default();
    for step in 0..=steps {
        let frac = step as f64 / steps as f64;
        let x = west + frac * (east - west);
        let y = south + frac * (north - south);
        let edge_points = [(x, south), (x, north), (west, y), (east, y)];
        edge_points
            .into_iter()
            .filter_map(|p| proj.convert(p).ok())
            .for_each(|p| envelope.extend(p));
    }
    envelope
        .into_bounds()
        .ok_or_else(|| anyhow!("Bounds {:?} have no finite image in {}", bounds, to_crs))
}

/// Running min/max over finite projected points.
#[derive(Default)]
struct Envelope(Option<Bounds>);

impl Envelope {
    fn extend(&mut self, (x, y): (f64, f64)) {
        if !(x.is_finite() && y.is_finite()) {
            return;
        }
        self.0 = Some(match self.0 {
            None => [x, y, x, y],
            Some([w, s, e, n]) => [w.min(x), s.min(y), e.max(x), n.max(y)],
        });
    }

    fn into_bounds(self) -> Option<Bounds> {
        self.0
    }
}
