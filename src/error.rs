//! Error taxonomy shared by the fetch and calculation pipeline.
//!
//! `NoIntersection` and `Canceled` are expected outcomes rather than failures;
//! use [`BandCalcError::is_expected`] to tell them apart.

use std::path::PathBuf;
use std::time::Duration;

/// Errors produced by the acquisition and calculation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum BandCalcError {
    /// Source unreadable, missing, or not a usable raster.
    #[error("failed to open {source_id}: {reason}")]
    Open { source_id: String, reason: String },

    /// The AOI does not overlap the raster.
    #[error("AOI does not intersect raster {source_id}")]
    NoIntersection { source_id: String },

    /// One or more required bands could not be acquired.
    #[error("missing required bands: {}", .missing.join(", "))]
    PartialBandFailure { missing: Vec<String> },

    /// Malformed input: bad AOI, bad formula, unknown identifiers.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Destination could not be written.
    #[error("failed to write {}: {reason}", .path.display())]
    Write { path: PathBuf, reason: String },

    #[error("CRS error: {0}")]
    Crs(String),

    /// Input bands do not share the same pixel grid.
    #[error("band '{band}' has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        band: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("calculation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("operation canceled")]
    Canceled,

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl BandCalcError {
    /// Build an `Open` error from any error chain.
    pub fn open(source_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Open {
            source_id: source_id.into(),
            reason: err.to_string(),
        }
    }

    /// Build a `Write` error from any error chain.
    pub fn write(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Write {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// True for outcomes that callers should not surface as failures.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::NoIntersection { .. } | Self::Canceled)
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, BandCalcError>;
