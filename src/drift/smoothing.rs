//! Regression curves through pooled (injection, intensity) observations

use crate::structs::{DriftError, FitKind, Result, SmoothingMethod};
use linfa_linalg::cholesky::SolveC;
use ndarray::{Array1, Array2, Axis};

/// Neighbourhood radius inflation so the farthest neighbour keeps some weight
const BANDWIDTH_INFLATION: f64 = 1.1;

/// Pooled observations collapsed to distinct injections.
///
/// Least-squares fits on the collapsed form (mean response, weight = count)
/// are identical to fits on the raw pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct PooledSeries {
    knots: Vec<f64>,
    means: Vec<f64>,
    counts: Vec<f64>,
}

impl PooledSeries {
    /// Collapse `(injection, intensity)` pairs
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_pairs(pairs: &[(i64, f64)]) -> Self {
        let mut sorted = pairs.to_vec();
        sorted.sort_by_key(|&(inj, _)| inj);

        let mut knots = Vec::new();
        let mut means: Vec<f64> = Vec::new();
        let mut counts: Vec<f64> = Vec::new();
        let mut last: Option<i64> = None;

        for (inj, y) in sorted {
            if last == Some(inj) {
                if let (Some(m), Some(c)) = (means.last_mut(), counts.last_mut()) {
                    *m += y;
                    *c += 1.0;
                }
            } else {
                knots.push(inj as f64);
                means.push(y);
                counts.push(1.0);
                last = Some(inj);
            }
        }
        for (m, c) in means.iter_mut().zip(&counts) {
            *m /= c;
        }

        Self {
            knots,
            means,
            counts,
        }
    }

    /// Number of distinct injections
    #[must_use]
    pub fn distinct(&self) -> usize {
        self.knots.len()
    }

    fn total_weight(&self) -> f64 {
        self.counts.iter().sum()
    }
}

/// Polynomial in `(x - center) / scale`
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    center: f64,
    scale: f64,
    coefficients: Array1<f64>,
}

impl Polynomial {
    fn evaluate(&self, x: f64) -> f64 {
        let u = (x - self.center) / self.scale;
        self.coefficients.iter().rev().fold(0.0, |acc, c| acc * u + c)
    }
}

/// Natural cubic spline in value / second-derivative form
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalSpline {
    knots: Vec<f64>,
    values: Vec<f64>,
    /// Second derivatives at the knots; zero at both ends
    gammas: Vec<f64>,
}

impl NaturalSpline {
    /// Evaluate, extrapolating linearly beyond the end knots
    fn evaluate(&self, x: f64) -> f64 {
        let t = &self.knots;
        let g = &self.values;
        let gamma = &self.gammas;
        let n = t.len();

        if x <= t[0] {
            let h = t[1] - t[0];
            let slope = (g[1] - g[0]) / h - h * gamma[1] / 6.0;
            return g[0] - (t[0] - x) * slope;
        }
        if x >= t[n - 1] {
            let h = t[n - 1] - t[n - 2];
            let slope = (g[n - 1] - g[n - 2]) / h + h * gamma[n - 2] / 6.0;
            return g[n - 1] + (x - t[n - 1]) * slope;
        }

        let i = t.partition_point(|&k| k <= x) - 1;
        let h = t[i + 1] - t[i];
        let a = x - t[i];
        let b = t[i + 1] - x;
        (a * g[i + 1] + b * g[i]) / h
            - a * b / 6.0 * ((1.0 + a / h) * gamma[i + 1] + (1.0 + b / h) * gamma[i])
    }
}

/// Locally weighted quadratic regression with tricube weights
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRegression {
    series: PooledSeries,
    span: f64,
}

impl LocalRegression {
    fn evaluate(&self, x: f64) -> Result<f64> {
        let s = &self.series;

        let mut by_distance: Vec<(f64, f64)> = s
            .knots
            .iter()
            .zip(&s.counts)
            .map(|(k, c)| ((k - x).abs(), *c))
            .collect();
        by_distance.sort_by(|a, b| a.0.total_cmp(&b.0));

        // Grow the neighbourhood until it holds `span` of the observations
        // and at least three distinct injections
        let target = self.span * s.total_weight();
        let mut covered = 0.0;
        let mut radius = 0.0;
        for (i, &(dist, count)) in by_distance.iter().enumerate() {
            covered += count;
            radius = dist;
            if covered >= target && i >= 2 {
                break;
            }
        }
        let bandwidth = radius * BANDWIDTH_INFLATION;
        if bandwidth <= 0.0 {
            return Err(DriftError::FittingFailed(
                "Local regression needs three distinct injections".into(),
            ));
        }

        let weights: Vec<f64> = s
            .knots
            .iter()
            .zip(&s.counts)
            .map(|(k, c)| c * tricube((k - x).abs() / bandwidth))
            .collect();
        let coefficients = weighted_polynomial(&s.knots, &s.means, &weights, 2, x, bandwidth)?;
        Ok(coefficients[0])
    }
}

fn tricube(u: f64) -> f64 {
    if u >= 1.0 {
        0.0
    } else {
        (1.0 - u.powi(3)).powi(3)
    }
}

/// A fitted drift regression
#[derive(Debug, Clone, PartialEq)]
pub enum FittedCurve {
    Quadratic(Polynomial),
    Spline(NaturalSpline),
    Local(LocalRegression),
}

impl FittedCurve {
    #[must_use]
    pub fn kind(&self) -> FitKind {
        match self {
            Self::Quadratic(_) => FitKind::QuadraticFallback,
            Self::Spline(_) => FitKind::CubicSpline,
            Self::Local(_) => FitKind::LocalPolynomial,
        }
    }

    /// Predicted intensity at injection `x`
    ///
    /// # Errors
    /// Returns `FittingFailed` if a local fit is singular at `x`
    pub fn evaluate(&self, x: f64) -> Result<f64> {
        match self {
            Self::Quadratic(p) => Ok(p.evaluate(x)),
            Self::Spline(s) => Ok(s.evaluate(x)),
            Self::Local(l) => l.evaluate(x),
        }
    }
}

/// Fit the drift curve of one cluster.
///
/// Three or fewer distinct injections always get the quadratic fallback.
///
/// # Errors
/// Returns `FittingFailed` if the series is empty or a solve fails
pub fn fit_curve(
    series: &PooledSeries,
    method: SmoothingMethod,
    smoothing_param: f64,
) -> Result<FittedCurve> {
    if series.distinct() == 0 {
        return Err(DriftError::FittingFailed("No observations to fit".into()));
    }
    if series.distinct() <= 3 {
        return fit_quadratic(series).map(FittedCurve::Quadratic);
    }

    match method {
        SmoothingMethod::CubicSpline => {
            fit_smoothing_spline(series, smoothing_param).map(FittedCurve::Spline)
        }
        SmoothingMethod::LocalPolynomial => Ok(FittedCurve::Local(LocalRegression {
            series: series.clone(),
            span: smoothing_param,
        })),
    }
}

/// Least-squares polynomial of degree 2, lowered when there are too few
/// distinct injections to identify it
///
/// # Errors
/// Returns `FittingFailed` if the normal equations are singular
pub fn fit_quadratic(series: &PooledSeries) -> Result<Polynomial> {
    let degree = series.distinct().saturating_sub(1).min(2);
    let total = series.total_weight();
    let center = series
        .knots
        .iter()
        .zip(&series.counts)
        .map(|(k, c)| k * c)
        .sum::<f64>()
        / total;
    let scale = series
        .knots
        .iter()
        .map(|k| (k - center).abs())
        .fold(0.0, f64::max)
        .max(1.0);

    let coefficients = weighted_polynomial(
        &series.knots,
        &series.means,
        &series.counts,
        degree,
        center,
        scale,
    )?;
    Ok(Polynomial {
        center,
        scale,
        coefficients,
    })
}

/// Weighted least squares in the basis `1, u, u^2, ...` with `u = (x - center) / scale`
fn weighted_polynomial(
    x: &[f64],
    y: &[f64],
    w: &[f64],
    degree: usize,
    center: f64,
    scale: f64,
) -> Result<Array1<f64>> {
    let p = degree + 1;
    let mut xtwx = Array2::<f64>::zeros((p, p));
    let mut xtwy = Array1::<f64>::zeros(p);

    for ((&xi, &yi), &wi) in x.iter().zip(y).zip(w) {
        if wi <= 0.0 {
            continue;
        }
        let u = (xi - center) / scale;
        let basis: Vec<f64> = (0..p)
            .scan(1.0, |acc, _| {
                let v = *acc;
                *acc *= u;
                Some(v)
            })
            .collect();

        for r in 0..p {
            xtwy[r] += wi * basis[r] * yi;
            for c in 0..p {
                xtwx[[r, c]] += wi * basis[r] * basis[c];
            }
        }
    }

    solve_normal(xtwx, xtwy)
}

/// Solve a symmetric positive definite system through its Cholesky factor
fn solve_normal(mut a: Array2<f64>, b: Array1<f64>) -> Result<Array1<f64>> {
    let x = a
        .solvec(&b.insert_axis(Axis(1)))
        .map_err(|e| DriftError::FittingFailed(format!("Singular normal equations: {e}")))?;
    Ok(x.column(0).to_owned())
}

/// Penalised cubic smoothing spline (Reinsch form).
///
/// `spar` maps to the penalty as `alpha = r * 256^(3 spar - 1)`, where `r`
/// balances the traces of the roughness and data-fidelity matrices so that
/// `spar` is insensitive to injection spacing.
///
/// # Errors
/// Returns `FittingFailed` on fewer than three distinct injections or a singular system
pub fn fit_smoothing_spline(series: &PooledSeries, spar: f64) -> Result<NaturalSpline> {
    let t = &series.knots;
    let n = t.len();
    if n < 3 {
        return Err(DriftError::FittingFailed(format!(
            "Smoothing spline needs three distinct injections, got {n}"
        )));
    }

    let h: Vec<f64> = t.windows(2).map(|w| w[1] - w[0]).collect();
    let m = n - 2;

    let mut q = Array2::<f64>::zeros((n, m));
    let mut r = Array2::<f64>::zeros((m, m));
    for j in 0..m {
        q[[j, j]] = 1.0 / h[j];
        q[[j + 1, j]] = -1.0 / h[j] - 1.0 / h[j + 1];
        q[[j + 2, j]] = 1.0 / h[j + 1];

        r[[j, j]] = (h[j] + h[j + 1]) / 3.0;
        if j + 1 < m {
            r[[j, j + 1]] = h[j + 1] / 6.0;
            r[[j + 1, j]] = h[j + 1] / 6.0;
        }
    }

    let mut winv_q = q.clone();
    for (mut row, &c) in winv_q.rows_mut().into_iter().zip(&series.counts) {
        row /= c;
    }
    let qt_winv_q = q.t().dot(&winv_q);

    let ratio = r.diag().sum() / qt_winv_q.diag().sum();
    let alpha = ratio * 256f64.powf(3.0 * spar - 1.0);

    let system = &r + &(&qt_winv_q * alpha);
    let y = Array1::from(series.means.clone());
    let rhs = q.t().dot(&y);
    let inner = solve_normal(system, rhs)?;

    let values = &y - &(winv_q.dot(&inner) * alpha);
    let mut gammas = vec![0.0; n];
    for (g, v) in gammas[1..=m].iter_mut().zip(inner.iter()) {
        *g = *v;
    }

    Ok(NaturalSpline {
        knots: t.clone(),
        values: values.to_vec(),
        gammas,
    })
}
