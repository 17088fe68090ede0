use super::stats::{feature_cv, mean_cv, rms_distance};
use crate::structs::{
    ActionRecord, CorrectionResult, DriftError, FeatureMatrix, FilterResult, FilterSummary,
    Result, StageTrajectory,
};
use std::collections::{BTreeSet, HashMap};

/// Identifiers of features whose CV on `qc` is at most `cv_limit`.
///
/// Features with an undefined CV (zero mean) are not retained.
#[must_use]
pub fn retained_features(qc: &FeatureMatrix, cv_limit: f64) -> BTreeSet<String> {
    qc.ids()
        .iter()
        .zip(feature_cv(qc))
        .filter(|(_, cv)| cv.is_finite() && *cv <= cv_limit)
        .map(|(id, _)| id.clone())
        .collect()
}

fn mean_cv_of(matrix: &FeatureMatrix) -> f64 {
    mean_cv(&feature_cv(matrix))
}

/// Drop features that remain unstable after correction.
///
/// The retained set is computed once on the corrected QC matrix and projected
/// uniformly onto QC, reference and test. Each action record gains the
/// surviving feature count and their mean corrected CV.
///
/// # Errors
/// Returns `Config` if `cv_limit` is outside (0, 1) and `DimensionMismatch`
/// if the corrected matrices do not share the QC features
pub fn filter_features(correction: CorrectionResult, cv_limit: f64) -> Result<FilterResult> {
    if !(cv_limit > 0.0 && cv_limit < 1.0) {
        return Err(DriftError::Config(format!(
            "CV limit must be in (0, 1), got {cv_limit}"
        )));
    }

    let corrected = correction.qc.features();
    let mismatched = std::iter::once(&correction.test)
        .chain(correction.reference.as_ref())
        .any(|m| !corrected.same_features(m.features()));
    if mismatched {
        return Err(DriftError::DimensionMismatch(
            "Corrected test or reference features differ from QC".into(),
        ));
    }

    let cvs: HashMap<&str, f64> = corrected
        .ids()
        .iter()
        .map(String::as_str)
        .zip(feature_cv(corrected))
        .collect();
    let retained = retained_features(corrected, cv_limit);
    let removed: Vec<String> = corrected
        .ids()
        .iter()
        .filter(|id| !retained.contains(*id))
        .cloned()
        .collect();

    let qc = correction.qc.project(&retained);
    let test = correction.test.project(&retained);
    let reference = correction.reference.as_ref().map(|r| r.project(&retained));

    let assignment = &correction.model.selection.assignment;
    let actions: Vec<ActionRecord> = correction
        .actions
        .iter()
        .map(|record| {
            let survivors: Vec<f64> = assignment
                .member_ids(record.cluster)
                .into_iter()
                .filter(|id| retained.contains(*id))
                .filter_map(|id| cvs.get(id).copied())
                .collect();
            ActionRecord {
                n_after: Some(survivors.len()),
                cv_after: (!survivors.is_empty()).then(|| mean_cv(&survivors)),
                ..record.clone()
            }
        })
        .collect();

    let raw_qc = correction.model.qc.features();
    let cv_trajectory = StageTrajectory {
        raw: mean_cv_of(raw_qc),
        clean: mean_cv_of(&raw_qc.project(&retained)),
        corrected: mean_cv_of(corrected),
        final_: mean_cv_of(qc.features()),
    };
    let reference_distance = match (&correction.reference_raw, &correction.reference, &reference) {
        (Some(raw), Some(corr), Some(fin)) => Some(StageTrajectory {
            raw: rms_distance(raw.features().data()),
            clean: rms_distance(raw.features().project(&retained).data()),
            corrected: rms_distance(corr.features().data()),
            final_: rms_distance(fin.features().data()),
        }),
        _ => None,
    };

    log::info!(
        "Kept {} of {} features at CV limit {cv_limit}",
        retained.len(),
        corrected.n_features()
    );

    Ok(FilterResult {
        cv_limit,
        retained: qc.features().ids().to_vec(),
        removed,
        qc,
        reference,
        test,
        actions,
        summary: FilterSummary {
            mean_cv: cv_trajectory,
            reference_distance,
        },
        correction,
    })
}
