use super::{check_shape, load_band, valid_range, CalcOutcome, Coefficients, Formula, IndexCalculator, PredefinedIndex, OUTPUT_NODATA};
use crate::cancel::CancellationToken;
use crate::error::{BandCalcError, Result};
use crate::io::{geotiff, BandRaster};
use crate::pipeline::BandSet;
use ndarray::{Array2, Axis};
use rayon::prelude::*;
use std::path::Path;

impl IndexCalculator {
    /// Evaluate a band-math formula over every declared band.
    ///
    /// The formula is validated against the band names and coefficients
    /// before any raster is opened. Output pixels are -9999 where a
    /// referenced band is nodata or the result is not finite.
    pub fn calculate_formula(
        &self,
        formula: &str,
        bands: &BandSet,
        coefficients: &Coefficients,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<CalcOutcome> {
        if bands.is_empty() {
            return Err(BandCalcError::Validation("formula needs at least one band".to_string()));
        }
        let names = bands.names();
        let formula = Formula::compile(formula, &names, coefficients)?;
        tracing::info!("Evaluating '{}' over {} -> {}", formula.text(), names.join(", "), dest.display());

        let inputs = names
            .iter()
            .map(|name| load_band(bands, name))
            .collect::<Result<Vec<BandRaster>>>()?;
        let shape = inputs[0].shape();
        for (name, band) in names.iter().zip(&inputs).skip(1) {
            check_shape(name, shape, band)?;
        }
        cancel.check()?;

        let result = evaluate(&formula, &inputs, shape);
        cancel.check()?;

        let range = valid_range(result.iter().map(|v| *v as f64), Some(OUTPUT_NODATA));
        let profile = inputs[0]
            .profile()
            .with_nodata(Some(OUTPUT_NODATA))
            .with_descriptions([formula.text()])
            .with_statistics(vec![range]);

        let path = self.persist(dest, cancel, |tmp, options| {
            geotiff::write_band(tmp, result.view(), &profile, options)
        })?;

        let message = match range {
            Some((min, max)) => format!("Result range [{:.4}, {:.4}]", min, max),
            None => "Result has no valid pixels".to_string(),
        };
        tracing::info!("{} ({})", message, path.display());

        Ok(CalcOutcome {
            path,
            message: Some(message),
        })
    }

    /// Run a predefined index over the subset of `bands` it requires.
    pub fn calculate_predefined_index(
        &self,
        index: PredefinedIndex,
        bands: &BandSet,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<CalcOutcome> {
        let required = bands.subset(index.required_bands())?;
        tracing::info!("Calculating {} ({})", index, index.description());
        self.calculate_formula(index.formula(), &required, &Coefficients::new(), dest, cancel)
    }
}

/// Evaluate row by row in parallel.
fn evaluate(formula: &Formula, inputs: &[BandRaster], (height, width): (usize, usize)) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((height, width));
    let used = formula.used_slots();

    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(row, mut out_row)| {
            let mut values = vec![0.0f64; inputs.len()];
            for col in 0..width {
                for (slot, band) in inputs.iter().enumerate() {
                    values[slot] = band.data[[row, col]];
                }
                let masked = used.iter().any(|&slot| inputs[slot].is_nodata(values[slot]));
                let v = if masked { f64::NAN } else { formula.eval(&values) };
                out_row[col] = if v.is_finite() { v as f32 } else { OUTPUT_NODATA as f32 };
            }
        });

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::test_support::band_set;
    use crate::io::read_band;
    use ndarray::array;

    #[test]
    fn test_formula_with_coefficients() {
        let dir = tempfile::tempdir().unwrap();
        let bands = band_set(
            dir.path(),
            &[("nir", array![[0.8f32, 0.6]]), ("red", array![[0.2f32, 0.2]])],
            None,
        );
        let mut coefficients = Coefficients::new();
        coefficients.insert("k".to_string(), 2.0);
        let dest = dir.path().join("calc.tif");

        let outcome = IndexCalculator::default()
            .calculate_formula("k * nir - red", &bands, &coefficients, &dest, &CancellationToken::new())
            .unwrap();
        assert!(outcome.message.unwrap().starts_with("Result range"));

        let out = read_band(&dest).unwrap();
        assert!((out.data[[0, 0]] - 1.4).abs() < 1e-6);
        assert!((out.data[[0, 1]] - 1.0).abs() < 1e-6);
        assert_eq!(out.nodata, Some(OUTPUT_NODATA));
        assert_eq!(out.geo_transform, crate::calc::test_support::grid());
    }

    #[test]
    fn test_unknown_identifier_fails_before_io() {
        let dir = tempfile::tempdir().unwrap();
        // Paths that do not exist: validation must fail before they are opened
        let mut bands = BandSet::new();
        bands.insert("nir", dir.path().join("missing_nir.tif"));
        bands.insert("red", dir.path().join("missing_red.tif"));

        let err = IndexCalculator::default()
            .calculate_formula(
                "ndwi + 1",
                &bands,
                &Coefficients::new(),
                &dir.path().join("out.tif"),
                &CancellationToken::new(),
            )
            .unwrap_err();
        match err {
            BandCalcError::Validation(msg) => assert!(msg.contains("ndwi")),
            other => panic!("expected validation error, got {}", other),
        }
        assert!(!dir.path().join("out.tif").exists());
    }

    #[test]
    fn test_nodata_and_non_finite_masked() {
        let dir = tempfile::tempdir().unwrap();
        let bands = band_set(
            dir.path(),
            &[("a", array![[1.0f32, -5.0, 4.0, 1.0]]), ("b", array![[2.0f32, 1.0, 0.0, -5.0]])],
            Some(-5.0),
        );
        let dest = dir.path().join("ratio.tif");
        IndexCalculator::default()
            .calculate_formula("a / b", &bands, &Coefficients::new(), &dest, &CancellationToken::new())
            .unwrap();

        let out = read_band(&dest).unwrap();
        assert_eq!(out.data[[0, 0]], 0.5);
        assert_eq!(out.data[[0, 1]], OUTPUT_NODATA);
        assert_eq!(out.data[[0, 2]], OUTPUT_NODATA);
        assert_eq!(out.data[[0, 3]], OUTPUT_NODATA);
    }

    #[test]
    fn test_no_implicit_clipping() {
        let dir = tempfile::tempdir().unwrap();
        let bands = band_set(dir.path(), &[("x", array![[10.0f32, -3.0]])], None);
        let dest = dir.path().join("x.tif");
        IndexCalculator::default()
            .calculate_formula("x * 100", &bands, &Coefficients::new(), &dest, &CancellationToken::new())
            .unwrap();
        let out = read_band(&dest).unwrap();
        assert_eq!(out.data[[0, 0]], 1000.0);
        assert_eq!(out.data[[0, 1]], -300.0);
    }

    #[test]
    fn test_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let bands = band_set(
            dir.path(),
            &[("a", array![[1.0f32, 2.0]]), ("b", array![[1.0f32, 2.0, 3.0]])],
            None,
        );
        let err = IndexCalculator::default()
            .calculate_formula("a + b", &bands, &Coefficients::new(), &dir.path().join("o.tif"), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, BandCalcError::ShapeMismatch { ref band, .. } if band == "b"));
    }

    #[test]
    fn test_empty_band_set_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = IndexCalculator::default()
            .calculate_formula("1 + 1", &BandSet::new(), &Coefficients::new(), &dir.path().join("o.tif"), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, BandCalcError::Validation(_)));
    }

    #[test]
    fn test_predefined_ndvi_matches_ndvi_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let nir = Array2::from_shape_fn((8, 8), |(r, c)| 0.1 + (r * 8 + c) as f32 * 0.01);
        let red = Array2::from_shape_fn((8, 8), |(r, c)| 0.6 - (r * 8 + c) as f32 * 0.005);
        let bands = band_set(dir.path(), &[("nir", nir), ("red", red), ("green", Array2::zeros((8, 8)))], None);

        let calc = IndexCalculator::default();
        let cancel = CancellationToken::new();
        let via_index = dir.path().join("index.tif");
        let via_kernel = dir.path().join("kernel.tif");
        calc.calculate_predefined_index(PredefinedIndex::Ndvi, &bands, &via_index, &cancel).unwrap();
        calc.calculate_ndvi(&bands, &via_kernel, &cancel).unwrap();

        let a = read_band(&via_index).unwrap();
        let b = read_band(&via_kernel).unwrap();
        for (x, y) in a.data.iter().zip(b.data.iter()) {
            assert!((x - y).abs() < 1e-6, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_predefined_missing_band() {
        let dir = tempfile::tempdir().unwrap();
        let bands = band_set(dir.path(), &[("nir", array![[1.0f32]]), ("red", array![[1.0f32]])], None);
        let err = IndexCalculator::default()
            .calculate_predefined_index(PredefinedIndex::Evi, &bands, &dir.path().join("evi.tif"), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "missing required bands: blue");
    }
}
