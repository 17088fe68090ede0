//! Gaussian mixture fitting and BIC scoring
//!
//! Spherical and diagonal shapes are fitted by EM here, seeded with K-means.
//! The full-covariance shape is delegated to linfa; its log-likelihood is
//! recomputed from the fitted parameters so every shape is scored the same way.
//!
//! With more than one component, a fit whose components have no spread of
//! their own is singular and is reported as failed instead of scored. Its
//! likelihood would be set by the variance floor alone.

use crate::structs::{DriftConfig, DriftError, ModelShape, Result};
use linfa::traits::{Fit, Predict};
use linfa::DatasetBase;
use linfa::ParamGuard;
use linfa_clustering::{GaussianMixtureModel, KMeans};
use linfa_linalg::cholesky::Cholesky;
use linfa_linalg::triangular::{SolveTriangular, UPLO};
use ndarray::{Array1, Array2, Axis};
use std::collections::BTreeSet;
use std::f64::consts::PI;

/// Variances at or below this fraction of the data scale count as zero
const SINGULAR_RATIO: f64 = 1e-10;

/// Convergence settings shared by every candidate fit
#[derive(Debug, Clone, Copy)]
pub struct EmSettings {
    pub tolerance: f64,
    pub max_iterations: u64,
    pub covariance_floor: f64,
}

impl From<&DriftConfig> for EmSettings {
    fn from(config: &DriftConfig) -> Self {
        Self {
            tolerance: config.tolerance,
            max_iterations: config.max_iterations,
            covariance_floor: config.covariance_floor,
        }
    }
}

/// A converged mixture and its score
#[derive(Debug, Clone)]
pub struct MixtureFit {
    pub shape: ModelShape,
    pub k: usize,
    pub log_likelihood: f64,
    pub n_params: usize,
    /// `2 ln L - p ln n`; larger is better
    pub bic: f64,
    /// Most probable component of each observation, 0-based
    pub labels: Vec<usize>,
}

/// Absolute variance limits derived from the magnitude of the data
#[derive(Debug, Clone, Copy)]
struct VarianceBounds {
    floor: f64,
    singular: f64,
    /// One component cannot be split further, so zero spread is not rewarded
    allow_singular: bool,
}

impl VarianceBounds {
    fn new(data: &Array2<f64>, k: usize, settings: &EmSettings) -> Self {
        let scale = data_scale(data);
        Self {
            floor: settings.covariance_floor * scale,
            singular: SINGULAR_RATIO * scale,
            allow_singular: k == 1,
        }
    }

    /// Floored variance, or an error if the raw estimate is singular
    fn apply(&self, raw: f64, shape: ModelShape, k: usize, component: usize) -> Result<f64> {
        if raw <= self.singular && !self.allow_singular {
            return Err(DriftError::FittingFailed(format!(
                "{shape} with {k} components: component {component} has no spread"
            )));
        }
        Ok(raw.max(0.0) + self.floor)
    }
}

/// Mean square of the data, or 1 for an all-zero matrix
#[allow(clippy::cast_precision_loss)]
fn data_scale(data: &Array2<f64>) -> f64 {
    let mean_square = data.iter().map(|v| v * v).sum::<f64>() / data.len().max(1) as f64;
    if mean_square > 0.0 {
        mean_square
    } else {
        1.0
    }
}

/// Component parameters with per-dimension variances
struct Components {
    weights: Array1<f64>,
    means: Array2<f64>,
    variances: Array2<f64>,
}

/// Fit a `k`-component mixture of the given shape to the rows of `data`
///
/// # Errors
/// Returns `FittingFailed` if there are fewer distinct observations than
/// components, a component collapses, or EM does not converge
#[allow(clippy::cast_precision_loss)]
pub fn fit_mixture(
    data: &Array2<f64>,
    k: usize,
    shape: ModelShape,
    settings: &EmSettings,
) -> Result<MixtureFit> {
    let (n, d) = data.dim();

    if k == 0 {
        return Err(DriftError::FittingFailed("k must be at least 1".into()));
    }
    let distinct = distinct_rows(data);
    if distinct < k {
        return Err(DriftError::FittingFailed(format!(
            "Cannot fit {k} components to {distinct} distinct observations"
        )));
    }

    let (log_likelihood, labels) = match shape {
        ModelShape::Vvv => fit_full(data, k, settings)?,
        _ => fit_constrained(data, k, shape, settings)?,
    };

    let n_params = (k - 1) + k * d + shape.covariance_params(k, d);
    let bic = 2.0 * log_likelihood - n_params as f64 * (n as f64).ln();

    Ok(MixtureFit {
        shape,
        k,
        log_likelihood,
        n_params,
        bic,
        labels,
    })
}

fn distinct_rows(data: &Array2<f64>) -> usize {
    data.rows()
        .into_iter()
        .map(|row| row.iter().map(|v| v.to_bits()).collect::<Vec<u64>>())
        .collect::<BTreeSet<_>>()
        .len()
}

/// Hard K-means labels used to seed EM
fn kmeans_labels(data: &Array2<f64>, k: usize) -> Result<Vec<usize>> {
    let dataset = DatasetBase::from(data.clone());

    let model = KMeans::params(k)
        .max_n_iterations(100)
        .tolerance(1e-4)
        .fit(&dataset)
        .map_err(|e| DriftError::Ml(format!("K-means failed: {e}")))?;

    let labels: Array1<usize> = model.predict(data);
    Ok(labels.to_vec())
}

fn fit_constrained(
    data: &Array2<f64>,
    k: usize,
    shape: ModelShape,
    settings: &EmSettings,
) -> Result<(f64, Vec<usize>)> {
    let n = data.nrows();
    let seed = kmeans_labels(data, k)?;
    let bounds = VarianceBounds::new(data, k, settings);

    let mut resp = Array2::<f64>::zeros((n, k));
    for (i, &c) in seed.iter().enumerate() {
        resp[[i, c]] = 1.0;
    }

    let mut previous = f64::NEG_INFINITY;
    for _ in 0..settings.max_iterations {
        let components = maximize(data, &resp, shape, &bounds)?;
        let log_prob = diagonal_log_prob(data, &components);
        let (log_likelihood, next) = normalize(&log_prob);

        if !log_likelihood.is_finite() {
            return Err(DriftError::FittingFailed(format!(
                "{shape} with {k} components: log-likelihood is not finite"
            )));
        }
        if (log_likelihood - previous).abs() <= settings.tolerance * log_likelihood.abs().max(1.0) {
            return Ok((log_likelihood, argmax_rows(&log_prob)));
        }

        previous = log_likelihood;
        resp = next;
    }

    Err(DriftError::FittingFailed(format!(
        "{shape} with {k} components did not converge in {} iterations",
        settings.max_iterations
    )))
}

/// M-step under the covariance constraint of `shape`
#[allow(clippy::cast_precision_loss)]
fn maximize(
    data: &Array2<f64>,
    resp: &Array2<f64>,
    shape: ModelShape,
    bounds: &VarianceBounds,
) -> Result<Components> {
    let (n, d) = data.dim();
    let k = resp.ncols();

    let nk = resp.sum_axis(Axis(0));
    if let Some(c) = nk.iter().position(|&w| w < 1e-10) {
        return Err(DriftError::FittingFailed(format!(
            "{shape} with {k} components: component {c} collapsed"
        )));
    }
    // Variable-volume components estimate their own variance from their members
    if matches!(shape, ModelShape::Vii | ModelShape::Vvi) && !bounds.allow_singular {
        if let Some(c) = nk.iter().position(|&w| w < 2.0) {
            return Err(DriftError::FittingFailed(format!(
                "{shape} with {k} components: component {c} has fewer than two members"
            )));
        }
    }

    let weights = &nk / n as f64;
    let mut means = resp.t().dot(data);
    for (mut row, &w) in means.rows_mut().into_iter().zip(nk.iter()) {
        row /= w;
    }

    // Weighted squared deviations per component and dimension
    let mut scatter = Array2::<f64>::zeros((k, d));
    for c in 0..k {
        let sq = (data - &means.row(c)).mapv(|v| v * v);
        scatter.row_mut(c).assign(&resp.column(c).dot(&sq));
    }

    let mut variances = Array2::<f64>::zeros((k, d));
    match shape {
        ModelShape::Eii => {
            let v = bounds.apply(scatter.sum() / (n * d) as f64, shape, k, 0)?;
            variances.fill(v);
        }
        ModelShape::Vii => {
            for c in 0..k {
                let v = bounds.apply(scatter.row(c).sum() / (nk[c] * d as f64), shape, k, c)?;
                variances.row_mut(c).fill(v);
            }
        }
        ModelShape::Eei => {
            let shared = scatter.sum_axis(Axis(0)) / n as f64;
            for (j, &raw) in shared.iter().enumerate() {
                let v = bounds.apply(raw, shape, k, 0)?;
                variances.column_mut(j).fill(v);
            }
        }
        ModelShape::Vvi => {
            for c in 0..k {
                for j in 0..d {
                    variances[[c, j]] = bounds.apply(scatter[[c, j]] / nk[c], shape, k, c)?;
                }
            }
        }
        ModelShape::Vvv => {
            return Err(DriftError::Ml(
                "Full covariance is not a diagonal constraint".into(),
            ));
        }
    }

    Ok(Components {
        weights,
        means,
        variances,
    })
}

/// `ln(w_c) + ln N(x_i | mu_c, diag(var_c))` for every observation and component
fn diagonal_log_prob(data: &Array2<f64>, components: &Components) -> Array2<f64> {
    let n = data.nrows();
    let k = components.weights.len();
    let mut log_prob = Array2::<f64>::zeros((n, k));

    for c in 0..k {
        let mean = components.means.row(c);
        let var = components.variances.row(c);
        let log_norm = -0.5 * var.iter().map(|v| (2.0 * PI * v).ln()).sum::<f64>();
        let log_weight = components.weights[c].ln();

        for (i, x) in data.rows().into_iter().enumerate() {
            let quad: f64 = x
                .iter()
                .zip(mean.iter())
                .zip(var.iter())
                .map(|((xi, mi), vi)| (xi - mi).powi(2) / vi)
                .sum();
            log_prob[[i, c]] = log_weight + log_norm - 0.5 * quad;
        }
    }
    log_prob
}

/// Total log-likelihood and responsibilities from joint log-probabilities
fn normalize(log_prob: &Array2<f64>) -> (f64, Array2<f64>) {
    let mut resp = log_prob.clone();
    let mut total = 0.0;

    for mut row in resp.rows_mut() {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let lse = max + row.iter().map(|v| (v - max).exp()).sum::<f64>().ln();
        total += lse;
        row.mapv_inplace(|v| (v - lse).exp());
    }
    (total, resp)
}

/// Index of the largest entry per row; the lowest index wins ties
fn argmax_rows(log_prob: &Array2<f64>) -> Vec<usize> {
    log_prob
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (c, &v)| {
                    if v > best.1 {
                        (c, v)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

/// Full covariance through linfa.
///
/// A component needs more members than dimensions for its covariance to be
/// non-singular; fits with smaller components are rejected.
#[allow(clippy::cast_precision_loss)]
fn fit_full(data: &Array2<f64>, k: usize, settings: &EmSettings) -> Result<(f64, Vec<usize>)> {
    let (n, d) = data.dim();
    let dataset = DatasetBase::from(data.clone());

    let model = GaussianMixtureModel::params(k)
        .n_runs(1)
        .tolerance(settings.tolerance)
        .max_n_iterations(settings.max_iterations)
        .reg_covariance(settings.covariance_floor * data_scale(data))
        .check()
        .map_err(|e| DriftError::Ml(format!("GMM params invalid: {e}")))?
        .fit(&dataset)
        .map_err(|e| DriftError::FittingFailed(format!("VVV with {k} components: {e}")))?;

    let weights = model.weights();
    let means = model.means();
    let covariances = model.covariances();

    if let Some(c) = weights.iter().position(|w| w * n as f64 <= d as f64) {
        return Err(DriftError::FittingFailed(format!(
            "VVV with {k} components: component {c} has no more members than dimensions"
        )));
    }

    let mut log_prob = Array2::<f64>::zeros((n, k));
    for c in 0..k {
        let l = covariances
            .index_axis(Axis(0), c)
            .cholesky()
            .map_err(|e| DriftError::FittingFailed(format!("VVV component {c}: {e}")))?;
        let log_det = 2.0 * l.diag().iter().map(|v| v.ln()).sum::<f64>();
        let log_norm = -0.5 * (d as f64 * (2.0 * PI).ln() + log_det);
        let log_weight = weights[c].ln();

        // Whitened deviations, one observation per column
        let deviations = (data - &means.row(c)).reversed_axes();
        let z = l
            .solve_triangular(&deviations, UPLO::Lower)
            .map_err(|e| DriftError::FittingFailed(format!("VVV component {c}: {e}")))?;
        for (i, col) in z.columns().into_iter().enumerate() {
            log_prob[[i, c]] = log_weight + log_norm - 0.5 * col.dot(&col);
        }
    }

    let (log_likelihood, _) = normalize(&log_prob);
    if !log_likelihood.is_finite() {
        return Err(DriftError::FittingFailed(format!(
            "VVV with {k} components: log-likelihood is not finite"
        )));
    }
    Ok((log_likelihood, argmax_rows(&log_prob)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EmSettings {
        EmSettings::from(&DriftConfig::default())
    }

    /// Two tight groups of six points in three dimensions
    #[allow(clippy::cast_precision_loss)]
    fn two_groups() -> Array2<f64> {
        let mut data = Array2::<f64>::zeros((12, 3));
        for i in 0..12 {
            let base = if i < 6 { 0.0 } else { 10.0 };
            for j in 0..3 {
                data[[i, j]] = base + 0.1 * ((i * 3 + j) as f64).sin();
            }
        }
        data
    }

    #[test]
    fn test_two_components_beat_one() {
        let data = two_groups();
        for shape in [ModelShape::Eii, ModelShape::Vii, ModelShape::Eei, ModelShape::Vvi] {
            let one = fit_mixture(&data, 1, shape, &settings()).expect("k=1");
            let two = fit_mixture(&data, 2, shape, &settings()).expect("k=2");

            assert!(two.bic > one.bic, "{shape}: {} <= {}", two.bic, one.bic);
            assert!(two.labels[..6].iter().all(|&l| l == two.labels[0]));
            assert!(two.labels[6..].iter().all(|&l| l == two.labels[6]));
            assert_ne!(two.labels[0], two.labels[6]);
        }
    }

    #[test]
    fn test_full_covariance_separates_groups() {
        let data = two_groups();
        let fit = fit_mixture(&data, 2, ModelShape::Vvv, &settings()).expect("vvv");

        assert_ne!(fit.labels[0], fit.labels[11]);
        assert!(fit.log_likelihood.is_finite());
    }

    #[test]
    fn test_parameter_count() {
        let data = two_groups();
        let fit = fit_mixture(&data, 2, ModelShape::Vvi, &settings()).expect("vvi");

        // 1 weight + 2x3 means + 2x3 variances
        assert_eq!(fit.n_params, 13);
    }

    #[test]
    fn test_too_few_distinct_rows() {
        let data = Array2::<f64>::ones((5, 4));
        let err = fit_mixture(&data, 2, ModelShape::Eii, &settings()).unwrap_err();
        assert!(matches!(err, DriftError::FittingFailed(_)));

        let single = fit_mixture(&data, 1, ModelShape::Eii, &settings()).expect("k=1");
        assert!(single.labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_zero_scatter_split_fails() {
        // Two pairs of identical rows: each component would sit on its own point
        let data = ndarray::array![[0.0, 0.0], [0.0, 0.0], [5.0, 5.0], [5.0, 5.0]];
        for shape in [ModelShape::Eii, ModelShape::Vii, ModelShape::Eei, ModelShape::Vvi] {
            let err = fit_mixture(&data, 2, shape, &settings()).unwrap_err();
            assert!(matches!(err, DriftError::FittingFailed(_)), "{shape}: {err}");
        }
        assert!(fit_mixture(&data, 1, ModelShape::Vii, &settings()).is_ok());
    }

    #[test]
    fn test_singleton_variable_volume_component_fails() {
        let mut data = two_groups().slice(ndarray::s![..7, ..]).to_owned();
        data.row_mut(6).fill(10.0);

        for shape in [ModelShape::Vii, ModelShape::Vvi] {
            let err = fit_mixture(&data, 2, shape, &settings()).unwrap_err();
            assert!(err.to_string().contains("fewer than two members"), "{shape}: {err}");
        }
        // Pooled shapes still estimate a variance for the singleton
        assert!(fit_mixture(&data, 2, ModelShape::Eii, &settings()).is_ok());
    }

    #[test]
    fn test_floor_is_relative_to_data_scale() {
        let data = two_groups();
        let scaled = &data * 1e-4;
        for shape in [ModelShape::Eii, ModelShape::Vvi] {
            let a = fit_mixture(&data, 2, shape, &settings()).expect("unit scale");
            let b = fit_mixture(&scaled, 2, shape, &settings()).expect("small scale");

            assert_eq!(a.labels, b.labels);
            // Rescaling by c shifts the log-likelihood by -n*d*ln(c) only
            let shift = -12.0 * 3.0 * 1e-4_f64.ln();
            let gap = b.log_likelihood - a.log_likelihood - shift;
            assert!(gap.abs() < 1e-6 * a.log_likelihood.abs().max(1.0), "{shape}: {gap}");
        }
    }
}
