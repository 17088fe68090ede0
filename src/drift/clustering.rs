use super::mixture::{fit_mixture, EmSettings, MixtureFit};
use crate::structs::{
    CandidateScore, ClusterAssignment, ClusterId, ClusterSelection, DriftConfig, DriftError,
    Result, SampleSet,
};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

impl ClusterAssignment {
    /// Relabel raw component indices to 1..K in order of first appearance.
    ///
    /// Components that received no feature get no cluster id.
    #[must_use]
    pub fn from_labels(feature_ids: &[String], components: &[usize]) -> Self {
        let mut relabel: BTreeMap<usize, ClusterId> = BTreeMap::new();
        let labels = components
            .iter()
            .map(|&c| {
                let next = relabel.len() + 1;
                *relabel.entry(c).or_insert(next)
            })
            .collect();

        Self {
            feature_ids: feature_ids.to_vec(),
            labels,
            k: relabel.len(),
        }
    }

    /// Number of clusters
    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    #[must_use]
    pub fn clusters(&self) -> RangeInclusive<ClusterId> {
        1..=self.k
    }

    #[must_use]
    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    #[must_use]
    pub fn labels(&self) -> &[ClusterId] {
        &self.labels
    }

    #[must_use]
    pub fn cluster_of(&self, feature_id: &str) -> Option<ClusterId> {
        self.feature_ids
            .iter()
            .position(|id| id == feature_id)
            .map(|i| self.labels[i])
    }

    /// Column indices of the cluster's features
    #[must_use]
    pub fn members(&self, cluster: ClusterId) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == cluster)
            .map(|(i, _)| i)
            .collect()
    }

    #[must_use]
    pub fn member_ids(&self, cluster: ClusterId) -> Vec<&str> {
        self.members(cluster)
            .into_iter()
            .map(|i| self.feature_ids[i].as_str())
            .collect()
    }
}

/// Cluster QC features by drift shape.
///
/// Each feature is one observation whose coordinates are its intensities
/// across QC injections. Every (shape, cluster count) pair is fitted and the
/// highest BIC wins; among equal scores the smaller cluster count wins, then
/// the earlier shape.
///
/// # Errors
/// Returns `FittingFailed` if no candidate converges
pub fn cluster_features(qc: &SampleSet, config: &DriftConfig) -> Result<ClusterSelection> {
    let data = qc.features().data().t().to_owned();
    let n_features = data.nrows();
    let settings = EmSettings::from(config);

    let mut counts = config.cluster_counts.clone();
    counts.sort_unstable();
    counts.dedup();

    let mut candidates = Vec::with_capacity(config.model_shapes.len() * counts.len());
    let mut best: Option<MixtureFit> = None;

    for &shape in &config.model_shapes {
        for &k in &counts {
            if k > n_features {
                candidates.push(CandidateScore {
                    shape,
                    k,
                    bic: None,
                    failure: Some(format!("{k} clusters for {n_features} features")),
                });
                continue;
            }

            match fit_mixture(&data, k, shape, &settings) {
                Ok(fit) => {
                    log::debug!("{shape} k={k}: BIC {:.3}", fit.bic);
                    candidates.push(CandidateScore {
                        shape,
                        k,
                        bic: Some(fit.bic),
                        failure: None,
                    });
                    if is_better(&fit, best.as_ref()) {
                        best = Some(fit);
                    }
                }
                Err(e) => {
                    log::warn!("{shape} k={k}: skipped ({e})");
                    candidates.push(CandidateScore {
                        shape,
                        k,
                        bic: None,
                        failure: Some(e.to_string()),
                    });
                }
            }
        }
    }

    let best = best.ok_or_else(|| {
        DriftError::FittingFailed(format!(
            "None of {} candidate configurations converged",
            candidates.len()
        ))
    })?;

    let assignment = ClusterAssignment::from_labels(qc.features().ids(), &best.labels);
    log::info!(
        "Selected {} with {} clusters (BIC {:.3})",
        best.shape,
        assignment.k(),
        best.bic
    );

    Ok(ClusterSelection {
        assignment,
        shape: best.shape,
        bic: best.bic,
        candidates,
    })
}

/// Strictly higher BIC, or equal BIC with fewer clusters
#[allow(clippy::float_cmp)]
fn is_better(candidate: &MixtureFit, incumbent: Option<&MixtureFit>) -> bool {
    incumbent.map_or(true, |best| {
        candidate.bic > best.bic || (candidate.bic == best.bic && candidate.k < best.k)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{FeatureMatrix, InjectionSequence, ModelShape};

    /// Unstructured noise in (-1, 1) from a cell index
    #[allow(clippy::cast_precision_loss)]
    fn noise(cell: usize) -> f64 {
        ((cell as f64 * 12.9898).sin() * 43758.5453).fract()
    }

    /// Twelve features decaying and twelve rising over ten injections, 2% noise
    #[allow(clippy::cast_precision_loss)]
    fn opposing_drifts() -> SampleSet {
        let ids: Vec<String> = (0..24).map(|f| format!("F{f}")).collect();
        let rows: Vec<Vec<f64>> = (0..10)
            .map(|i| {
                (0..24)
                    .map(|f| {
                        let t = i as f64 / 9.0;
                        let jitter = 0.02 * noise(f * 31 + i * 7);
                        if f < 12 {
                            1.2 - 0.4 * t + jitter
                        } else {
                            0.8 + 0.4 * t + jitter
                        }
                    })
                    .collect()
            })
            .collect();
        let features = FeatureMatrix::from_rows(ids, &rows).expect("matrix");
        SampleSet::new(features, InjectionSequence::new((1..=10).collect())).expect("set")
    }

    fn assert_pure_split(a: &ClusterAssignment) {
        assert_eq!(a.k(), 2);
        for c in a.clusters() {
            let members = a.members(c);
            assert_eq!(members.len(), 12);
            assert!(members.iter().all(|&m| m < 12) || members.iter().all(|&m| m >= 12));
        }
    }

    fn fit(shape: ModelShape, k: usize, bic: f64) -> MixtureFit {
        MixtureFit {
            shape,
            k,
            log_likelihood: 0.0,
            n_params: 0,
            bic,
            labels: Vec::new(),
        }
    }

    #[test]
    fn test_separates_opposing_drifts() {
        let config = DriftConfig {
            cluster_counts: (1..=6).collect(),
            ..DriftConfig::default()
        };
        let selection = cluster_features(&opposing_drifts(), &config).expect("cluster");

        assert_pure_split(&selection.assignment);
        assert_eq!(selection.candidates.len(), 4 * 6);
    }

    #[test]
    fn test_selection_does_not_depend_on_floor() {
        for floor in [1e-4, 1e-6, 1e-9] {
            let config = DriftConfig {
                cluster_counts: (1..=6).collect(),
                covariance_floor: floor,
                ..DriftConfig::default()
            };
            let selection = cluster_features(&opposing_drifts(), &config).expect("cluster");
            assert_pure_split(&selection.assignment);
        }
    }

    #[test]
    fn test_singleton_candidate_is_recorded_as_failed() {
        let mut rows: Vec<Vec<f64>> = opposing_drifts()
            .features()
            .data()
            .rows()
            .into_iter()
            .map(|r| r.iter().take(5).copied().collect())
            .collect();
        for row in &mut rows {
            row.push(3.0);
        }
        let ids: Vec<String> = (0..6).map(|f| format!("F{f}")).collect();
        let qc = SampleSet::new(
            FeatureMatrix::from_rows(ids, &rows).expect("matrix"),
            InjectionSequence::new((1..=10).collect()),
        )
        .expect("set");
        let config = DriftConfig {
            cluster_counts: vec![2],
            model_shapes: vec![ModelShape::Vii, ModelShape::Eii],
            ..DriftConfig::default()
        };

        let selection = cluster_features(&qc, &config).expect("cluster");
        let vii = &selection.candidates[0];

        assert_eq!(vii.shape, ModelShape::Vii);
        assert!(vii.bic.is_none());
        assert!(vii.failure.as_deref().is_some_and(|f| f.contains("fewer than two members")));
        assert_eq!(selection.shape, ModelShape::Eii);
        assert_eq!(selection.assignment.member_ids(2), vec!["F5"]);
    }

    #[test]
    fn test_every_feature_has_one_cluster() {
        let config = DriftConfig {
            cluster_counts: vec![2],
            model_shapes: vec![ModelShape::Vvi],
            ..DriftConfig::default()
        };
        let selection = cluster_features(&opposing_drifts(), &config).expect("cluster");
        let a = &selection.assignment;

        assert_eq!(a.labels().len(), 24);
        assert!(a.labels().iter().all(|&l| (1..=a.k()).contains(&l)));
        assert_eq!(a.cluster_of("F0"), Some(1));
    }

    #[test]
    fn test_no_candidate_converges() {
        let config = DriftConfig {
            cluster_counts: vec![30, 40],
            ..DriftConfig::default()
        };
        let err = cluster_features(&opposing_drifts(), &config).unwrap_err();
        assert!(matches!(err, DriftError::FittingFailed(_)));
    }

    #[test]
    fn test_tie_prefers_fewer_clusters() {
        let incumbent = fit(ModelShape::Vvi, 4, -10.0);
        assert!(is_better(&fit(ModelShape::Eii, 2, -10.0), Some(&incumbent)));
        assert!(!is_better(&fit(ModelShape::Eii, 4, -10.0), Some(&incumbent)));
        assert!(!is_better(&fit(ModelShape::Eii, 1, -10.5), Some(&incumbent)));
        assert!(is_better(&fit(ModelShape::Eii, 7, -9.0), Some(&incumbent)));
    }

    #[test]
    fn test_relabel_in_order_of_appearance() {
        let ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| (*s).to_string()).collect();
        let a = ClusterAssignment::from_labels(&ids, &[3, 0, 3, 0]);

        assert_eq!(a.labels(), &[1, 2, 1, 2]);
        assert_eq!(a.k(), 2);
        assert_eq!(a.member_ids(2), vec!["b", "d"]);
    }
}
