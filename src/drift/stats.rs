use crate::structs::{CvSummary, FeatureMatrix};
use ndarray::{ArrayView1, ArrayView2, Axis};

/// Coefficient of variation: sample standard deviation over mean.
///
/// Returns `NaN` for fewer than two values or a zero mean.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn coefficient_of_variation(values: ArrayView1<'_, f64>) -> f64 {
    let n = values.len();
    if n < 2 {
        return f64::NAN;
    }

    let mean = values.sum() / n as f64;
    if mean == 0.0 {
        return f64::NAN;
    }
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    variance.sqrt() / mean
}

/// CV of every column, in column order
#[must_use]
pub fn feature_cv(matrix: &FeatureMatrix) -> Vec<f64> {
    matrix
        .data()
        .columns()
        .into_iter()
        .map(coefficient_of_variation)
        .collect()
}

/// Mean of the finite CVs; `NaN` when there are none
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean_cv(cvs: &[f64]) -> f64 {
    let finite: Vec<f64> = cvs.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    finite.iter().sum::<f64>() / finite.len() as f64
}

/// Share of CVs strictly below `limit`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn fraction_below(cvs: &[f64], limit: f64) -> f64 {
    if cvs.is_empty() {
        return 0.0;
    }
    cvs.iter().filter(|&&v| v < limit).count() as f64 / cvs.len() as f64
}

impl CvSummary {
    /// Summarise per-feature CVs of a matrix
    #[must_use]
    pub fn of(matrix: &FeatureMatrix) -> Self {
        let cvs = feature_cv(matrix);
        Self {
            mean: mean_cv(&cvs),
            below_015: fraction_below(&cvs, 0.15),
            below_020: fraction_below(&cvs, 0.20),
        }
    }
}

/// Root-mean-square Euclidean distance of the rows from their centroid
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms_distance(data: ArrayView2<'_, f64>) -> f64 {
    let n = data.nrows();
    if n == 0 || data.ncols() == 0 {
        return 0.0;
    }

    let Some(centroid) = data.mean_axis(Axis(0)) else {
        return 0.0;
    };
    let centered = &data - &centroid;
    let sum_sq: f64 = centered.iter().map(|v| v * v).sum();
    (sum_sq / n as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_cv() {
        let values = array![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let cv = coefficient_of_variation(values.view());

        // sample sd = 2.138, mean = 5
        assert!((cv - 0.427_618).abs() < 1e-5);
    }

    #[test]
    fn test_cv_degenerate() {
        assert!(coefficient_of_variation(array![1.0].view()).is_nan());
        assert!(coefficient_of_variation(array![-1.0, 1.0].view()).is_nan());
    }

    #[test]
    fn test_rms_distance() {
        // Two points at distance 1 from their centroid
        let data = array![[0.0, 0.0], [2.0, 0.0]];
        assert!((rms_distance(data.view()) - 1.0).abs() < 1e-12);

        let constant = array![[3.0, 1.0], [3.0, 1.0], [3.0, 1.0]];
        assert!(rms_distance(constant.view()).abs() < 1e-12);
    }

    #[test]
    fn test_cv_summary() {
        let m = FeatureMatrix::new(
            vec!["flat".into(), "noisy".into()],
            array![[1.0, 1.0], [1.0, 2.0], [1.0, 3.0]],
        )
        .expect("matrix");
        let s = CvSummary::of(&m);

        assert!((s.below_015 - 0.5).abs() < 1e-12);
        assert!((s.below_020 - 0.5).abs() < 1e-12);
        assert!((s.mean - 0.25).abs() < 1e-12);
    }
}
