//! Data transformation: resampling cropped windows.

mod resample;

pub use resample::{resample, target_grid, ResampleGrid};
