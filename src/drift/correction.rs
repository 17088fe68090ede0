use super::modeling::apply_curve;
use super::stats::rms_distance;
use crate::structs::{
    Action, ClusterDiagnostics, ClusterId, CorrectionDecision, CorrectionResult, DriftError,
    DriftModel, FeatureMatrix, ReferenceMode, Result, SampleSet,
};
use std::collections::{BTreeMap, BTreeSet};

/// Matrices committed so far plus the decisions that produced them
struct CorrectionState {
    qc: SampleSet,
    /// Gating series in reference mode one
    reference: Option<SampleSet>,
    test: SampleSet,
    actions: BTreeMap<ClusterId, Action>,
    decisions: Vec<CorrectionDecision>,
}

impl CorrectionState {
    fn gate(&self) -> &SampleSet {
        self.reference.as_ref().unwrap_or(&self.qc)
    }

    /// Tentatively correct one cluster and commit only if the gating
    /// series becomes strictly more stable
    fn consider(
        self,
        cluster: ClusterId,
        members: &[usize],
        model: &DriftModel,
        on_accept: Action,
    ) -> Result<Self> {
        let curve = model
            .curves
            .iter()
            .find(|c| c.cluster == cluster)
            .ok_or_else(|| DriftError::InvalidInput(format!("No drift curve for cluster {cluster}")))?;

        let gate = self.gate();
        let tentative = apply_curve(gate, members, curve)?;
        let distance_before = rms_distance(gate.features().data());
        let distance_tentative = rms_distance(tentative.features().data());
        let accepted = distance_tentative < distance_before;

        log::debug!(
            "Cluster {cluster}: distance {distance_before:.4} -> {distance_tentative:.4}, {}",
            if accepted { "accepted" } else { "rejected" }
        );

        let mut decisions = self.decisions;
        decisions.push(CorrectionDecision {
            cluster,
            distance_before,
            distance_tentative,
            accepted,
        });

        if !accepted {
            return Ok(Self {
                decisions,
                ..self
            });
        }

        let (qc, reference) = match self.reference {
            Some(_) => (apply_curve(&self.qc, members, curve)?, Some(tentative)),
            None => (tentative, None),
        };
        let test = apply_curve(&self.test, members, curve)?;
        let mut actions = self.actions;
        actions.insert(cluster, on_accept);

        Ok(Self {
            qc,
            reference,
            test,
            actions,
            decisions,
        })
    }
}

/// Kept clusters ordered by hypothetical improvement, most improving first
fn evaluation_order(diagnostics: &[ClusterDiagnostics], kept: &BTreeSet<ClusterId>) -> Vec<ClusterId> {
    let mut order: Vec<&ClusterDiagnostics> = diagnostics
        .iter()
        .filter(|d| kept.contains(&d.cluster))
        .collect();
    order.sort_by(|a, b| {
        a.delta_distance
            .total_cmp(&b.delta_distance)
            .then(a.cluster.cmp(&b.cluster))
    });
    order.into_iter().map(|d| d.cluster).collect()
}

fn ensure_same_features(qc: &FeatureMatrix, other: &FeatureMatrix, name: &str) -> Result<()> {
    if qc.same_features(other) {
        Ok(())
    } else {
        Err(DriftError::DimensionMismatch(format!(
            "{name} features differ from QC features ({} vs {})",
            other.n_features(),
            qc.n_features()
        )))
    }
}

/// Apply cluster corrections greedily, keeping each only if it improves stability.
///
/// Clusters are visited in ascending order of their modelled delta distance.
/// Each acceptance test compares against the matrix as already corrected by
/// earlier clusters. In mode `None` the QC series gates acceptance; in mode
/// `One` the reference series does and accepted corrections are also applied
/// to QC. The test series (QC itself when omitted) receives every accepted
/// correction. Test and reference rows keep the caller's order; factors are
/// looked up by each row's injection.
///
/// # Errors
/// Returns `ReferenceModeUnsupported` for mode `Many`, `InvalidInput` if the
/// reference does not match the mode or `kept` names unknown clusters, and
/// `DimensionMismatch` if feature sets differ between series
pub fn correct_drift(
    model: DriftModel,
    mode: ReferenceMode,
    reference: Option<&SampleSet>,
    batch: Option<&SampleSet>,
    kept: Option<&BTreeSet<ClusterId>>,
) -> Result<CorrectionResult> {
    let (reference, on_accept) = match (mode, reference) {
        (ReferenceMode::Many, _) => return Err(DriftError::ReferenceModeUnsupported),
        (ReferenceMode::None, None) => (None, Action::CorrQc),
        (ReferenceMode::None, Some(_)) => {
            return Err(DriftError::InvalidInput(
                "Reference series supplied with reference mode 'none'".into(),
            ))
        }
        (ReferenceMode::One, Some(r)) => (Some(r.clone()), Action::Corr1Ref),
        (ReferenceMode::One, None) => {
            return Err(DriftError::InvalidInput(
                "Reference mode 'one' needs a reference series".into(),
            ))
        }
    };

    let qc = model.qc.clone();
    let test = batch.map_or_else(|| qc.clone(), Clone::clone);
    ensure_same_features(qc.features(), test.features(), "Test")?;
    if let Some(r) = &reference {
        ensure_same_features(qc.features(), r.features(), "Reference")?;
    }

    let all: BTreeSet<ClusterId> = model.curves.iter().map(|c| c.cluster).collect();
    let kept = match kept {
        Some(k) => {
            if let Some(unknown) = k.difference(&all).next() {
                return Err(DriftError::InvalidInput(format!("Unknown cluster {unknown}")));
            }
            k.clone()
        }
        None => all,
    };

    let reference_raw = reference.clone();
    let initial = CorrectionState {
        qc,
        reference,
        test,
        actions: BTreeMap::new(),
        decisions: Vec::new(),
    };

    let assignment = &model.selection.assignment;
    let state = evaluation_order(&model.diagnostics, &kept)
        .into_iter()
        .try_fold(initial, |state, cluster| {
            state.consider(cluster, &assignment.members(cluster), &model, on_accept)
        })?;

    let actions: Vec<_> = model
        .actions
        .iter()
        .map(|record| {
            let mut record = record.clone();
            if let Some(&action) = state.actions.get(&record.cluster) {
                record.action = action;
            }
            record
        })
        .collect();
    let n_corrected = state.actions.len();
    let n_clusters = model.curves.len();

    log::info!("Corrected {n_corrected} of {n_clusters} clusters");

    Ok(CorrectionResult {
        mode,
        actions,
        decisions: state.decisions,
        kept,
        qc: state.qc,
        reference: state.reference,
        reference_raw,
        test: state.test,
        n_corrected,
        n_clusters,
        model,
    })
}
