use super::smoothing::{fit_curve, PooledSeries};
use super::stats::rms_distance;
use crate::structs::{
    Action, ActionRecord, ClusterDiagnostics, ClusterId, ClusterSelection, CvSummary,
    DriftConfig, DriftCurve, DriftError, DriftModel, InjectionSequence, Result, SampleSet,
};
use ndarray::Array1;

impl DriftCurve {
    /// Injection at which every factor is anchored to 1
    #[must_use]
    pub fn first_injection(&self) -> i64 {
        self.first
    }

    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn last_injection(&self) -> i64 {
        self.first + self.factors.len() as i64 - 1
    }

    #[must_use]
    pub fn factors(&self) -> &[f64] {
        &self.factors
    }

    #[must_use]
    pub fn predicted(&self) -> &[f64] {
        &self.predicted
    }

    /// Factor at `injection`, clamped to the nearest end of the range
    #[must_use]
    pub fn factor_at(&self, injection: i64) -> f64 {
        self.factors[self.index_of(injection)]
    }

    #[must_use]
    pub fn covers(&self, injection: i64) -> bool {
        (self.first..=self.last_injection()).contains(&injection)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    fn index_of(&self, injection: i64) -> usize {
        let last = self.factors.len() as i64 - 1;
        (injection - self.first).clamp(0, last) as usize
    }

    /// One factor per row of a series
    #[must_use]
    pub fn row_factors(&self, injections: &InjectionSequence) -> Array1<f64> {
        let outside = injections
            .as_slice()
            .iter()
            .filter(|&&i| !self.covers(i))
            .count();
        if outside > 0 {
            log::warn!(
                "Cluster {}: {outside} injections outside [{}, {}], using boundary factors",
                self.cluster,
                self.first,
                self.last_injection()
            );
        }
        injections
            .as_slice()
            .iter()
            .map(|&i| self.factor_at(i))
            .collect()
    }
}

/// Apply a cluster's correction to the listed columns of a series
///
/// # Errors
/// Returns `DimensionMismatch` if the series is malformed
pub fn apply_curve(set: &SampleSet, members: &[usize], curve: &DriftCurve) -> Result<SampleSet> {
    let factors = curve.row_factors(set.injections());
    Ok(SampleSet {
        features: set.features().scale_columns(members, &factors)?,
        injections: set.injections.clone(),
        groups: set.groups.clone(),
    })
}

/// First and last injection over every series of a run
#[must_use]
pub fn run_range<'a>(series: impl IntoIterator<Item = &'a SampleSet>) -> Option<(i64, i64)> {
    series
        .into_iter()
        .filter_map(|s| Some((s.injections().min()?, s.injections().max()?)))
        .reduce(|(lo, hi), (a, b)| (lo.min(a), hi.max(b)))
}

/// Fit one drift curve per cluster over the QC injection range.
///
/// # Errors
/// See [`model_drift_over`]
pub fn model_drift(
    selection: ClusterSelection,
    qc: &SampleSet,
    config: &DriftConfig,
) -> Result<DriftModel> {
    model_drift_over(selection, qc, None, config)
}

/// Fit one drift curve per cluster and score the hypothetical corrections.
///
/// Curves are evaluated at every integer injection of `range`, widened to
/// include the QC range; `None` uses the QC range alone.
///
/// # Errors
/// Returns `DimensionMismatch` if the selection was made on other features,
/// `FittingFailed` if a regression fails and `DegenerateDrift` if a curve
/// drops to zero or below
pub fn model_drift_over(
    selection: ClusterSelection,
    qc: &SampleSet,
    range: Option<(i64, i64)>,
    config: &DriftConfig,
) -> Result<DriftModel> {
    let qc = qc.clone().sorted();
    if selection.assignment.feature_ids() != qc.features().ids() {
        return Err(DriftError::DimensionMismatch(
            "Cluster assignment does not match the QC features".into(),
        ));
    }

    let Some((qc_first, qc_last)) = run_range([&qc]) else {
        return Err(DriftError::InvalidInput("QC series has no injections".into()));
    };
    let (first, last) = range.map_or((qc_first, qc_last), |(lo, hi)| {
        (lo.min(qc_first), hi.max(qc_last))
    });

    let mut curves = Vec::with_capacity(selection.assignment.k());
    let mut diagnostics = Vec::with_capacity(selection.assignment.k());
    let mut actions = Vec::with_capacity(selection.assignment.k());

    for cluster in selection.assignment.clusters() {
        let members = selection.assignment.members(cluster);
        let curve = fit_cluster(cluster, &qc, &members, first, last, config)?;

        let raw = SampleSet {
            features: qc.features().select_columns(&members),
            injections: qc.injections.clone(),
            groups: None,
        };
        let all: Vec<usize> = (0..members.len()).collect();
        let corrected = apply_curve(&raw, &all, &curve)?;

        let delta_distance =
            rms_distance(corrected.features().data()) - rms_distance(raw.features().data());
        let cv_raw = CvSummary::of(raw.features());
        let cv_corrected = CvSummary::of(corrected.features());

        log::debug!(
            "Cluster {cluster}: {} features, {:?}, delta distance {delta_distance:.4}",
            members.len(),
            curve.fit
        );

        actions.push(ActionRecord {
            cluster,
            action: Action::None,
            n_before: members.len(),
            cv_before: cv_raw.mean,
            n_after: None,
            cv_after: None,
        });
        diagnostics.push(ClusterDiagnostics {
            cluster,
            n_features: members.len(),
            delta_distance,
            cv_raw,
            cv_corrected,
        });
        curves.push(curve);
    }

    log::info!("Modelled drift for {} clusters", curves.len());

    Ok(DriftModel {
        selection,
        qc,
        curves,
        diagnostics,
        actions,
    })
}

#[allow(clippy::cast_precision_loss)]
fn fit_cluster(
    cluster: ClusterId,
    qc: &SampleSet,
    members: &[usize],
    first: i64,
    last: i64,
    config: &DriftConfig,
) -> Result<DriftCurve> {
    let data = qc.features().data();
    let pairs: Vec<(i64, f64)> = qc
        .injections()
        .as_slice()
        .iter()
        .enumerate()
        .flat_map(|(row, &inj)| members.iter().map(move |&col| (inj, data[[row, col]])))
        .collect();

    let series = PooledSeries::from_pairs(&pairs);
    let fitted = fit_curve(&series, config.smoothing, config.smoothing_param)?;

    let predicted = (first..=last)
        .map(|inj| fitted.evaluate(inj as f64))
        .collect::<Result<Vec<f64>>>()?;

    if let Some(offset) = predicted.iter().position(|p| !p.is_finite() || *p <= 0.0) {
        #[allow(clippy::cast_possible_wrap)]
        let injection = first + offset as i64;
        return Err(DriftError::DegenerateDrift { cluster, injection });
    }

    let baseline = predicted[0];
    let factors = predicted.iter().map(|p| baseline / p).collect();

    Ok(DriftCurve {
        cluster,
        fit: fitted.kind(),
        first,
        predicted,
        factors,
    })
}
