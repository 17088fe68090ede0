//! Drift correction pipeline that wires the four stages together

use super::clustering::cluster_features;
use super::correction::correct_drift;
use super::diagnostics::{DiagnosticEvent, DiagnosticsSink};
use super::filter::filter_features;
use super::modeling::{model_drift_over, run_range};
use crate::structs::{
    BatchObject, DriftConfig, DriftError, FilterResult, PipelineFailure, QcObject, RefObject,
    ReferenceMode, Result,
};

impl DriftConfig {
    /// Check candidate sets and numeric ranges
    ///
    /// # Errors
    /// Returns `Config` describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.cluster_counts.is_empty() {
            return Err(DriftError::Config("No candidate cluster counts".into()));
        }
        if self.cluster_counts.contains(&0) {
            return Err(DriftError::Config("Cluster counts must be positive".into()));
        }
        if self.model_shapes.is_empty() {
            return Err(DriftError::Config("No candidate model shapes".into()));
        }
        if !(self.smoothing_param > 0.0 && self.smoothing_param.is_finite()) {
            return Err(DriftError::Config(format!(
                "Smoothing parameter must be positive, got {}",
                self.smoothing_param
            )));
        }
        if !(self.cv_limit > 0.0 && self.cv_limit < 1.0) {
            return Err(DriftError::Config(format!(
                "CV limit must be in (0, 1), got {}",
                self.cv_limit
            )));
        }
        if !(self.tolerance > 0.0) || self.max_iterations == 0 {
            return Err(DriftError::Config(
                "EM tolerance and iteration limit must be positive".into(),
            ));
        }
        if self.covariance_floor < 0.0 {
            return Err(DriftError::Config("Covariance floor must be non-negative".into()));
        }
        Ok(())
    }
}

/// Run clustering, drift modelling, correction and filtering in order.
///
/// Reference mode is `One` when a reference series is given, else `None`.
/// Drift curves span the injections of every supplied series.
/// Events go to `sink` only when `config.report` is set.
///
/// # Errors
/// Returns the first error raised by configuration validation or any stage,
/// carrying the outputs of the stages that had already finished
pub fn run_pipeline(
    qc: &QcObject,
    batch: &BatchObject,
    reference: Option<&RefObject>,
    config: &DriftConfig,
    sink: &mut dyn DiagnosticsSink,
) -> std::result::Result<FilterResult, PipelineFailure> {
    config.validate()?;

    let mut report = |event: DiagnosticEvent| {
        if config.report {
            sink.emit(&event);
        }
    };

    let mode = if reference.is_some() {
        ReferenceMode::One
    } else {
        ReferenceMode::None
    };
    let qc = qc.clone().sorted();

    let selection = cluster_features(&qc, config)?;
    report(DiagnosticEvent::ClustersSelected {
        shape: selection.shape,
        k: selection.assignment.k(),
        bic: selection.bic,
        candidates_tried: selection.candidates.len(),
    });

    let range = run_range(std::iter::once(&qc).chain(Some(batch)).chain(reference));
    let model = model_drift_over(selection.clone(), &qc, range, config).map_err(|error| {
        PipelineFailure {
            selection: Some(selection),
            ..PipelineFailure::from(error)
        }
    })?;
    for (curve, diag) in model.curves.iter().zip(&model.diagnostics) {
        report(DiagnosticEvent::DriftModeled {
            cluster: curve.cluster,
            fit: curve.fit,
            delta_distance: diag.delta_distance,
            baseline: curve.predicted().first().copied().unwrap_or_default(),
            final_factor: curve.factors().last().copied().unwrap_or(1.0),
        });
    }

    let correction =
        correct_drift(model.clone(), mode, reference, Some(batch), None).map_err(|error| {
            PipelineFailure {
                selection: Some(model.selection.clone()),
                model: Some(model),
                ..PipelineFailure::from(error)
            }
        })?;
    for decision in &correction.decisions {
        report(DiagnosticEvent::CorrectionEvaluated(*decision));
    }

    let result = filter_features(correction.clone(), config.cv_limit).map_err(|error| {
        PipelineFailure {
            selection: Some(correction.model.selection.clone()),
            model: Some(correction.model.clone()),
            correction: Some(correction),
            ..PipelineFailure::from(error)
        }
    })?;
    report(DiagnosticEvent::FeaturesFiltered {
        retained: result.retained.len(),
        removed: result.removed.len(),
        cv_limit: result.cv_limit,
        summary: result.summary.clone(),
    });

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::diagnostics::RecordingSink;
    use crate::structs::{Action, FeatureMatrix, InjectionSequence, SampleSet};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn ids(n: usize) -> Vec<String> {
        (1..=n).map(|f| format!("M{f}")).collect()
    }

    /// Five features sharing a linear 10% decay across injections 1..=10
    #[allow(clippy::cast_precision_loss)]
    fn linear_decay_qc() -> SampleSet {
        let rows: Vec<Vec<f64>> = (1..=10)
            .map(|i| {
                let d = 1.0 - 0.1 * (i - 1) as f64 / 9.0;
                (1..=5).map(|f| f as f64 * 1000.0 * d).collect()
            })
            .collect();
        let features = FeatureMatrix::from_rows(ids(5), &rows).expect("matrix").scale_by_rms();
        SampleSet::new(features, InjectionSequence::new((1..=10).collect())).expect("set")
    }

    #[allow(clippy::cast_precision_loss)]
    fn batch_between_qcs() -> SampleSet {
        let injections = vec![2, 3, 5, 6, 8, 9];
        let rows: Vec<Vec<f64>> = injections
            .iter()
            .map(|&i| {
                let d = 1.0 - 0.1 * (i - 1) as f64 / 9.0;
                (1..=5).map(|f| (0.5 + 0.1 * f as f64) * d).collect()
            })
            .collect();
        let features = FeatureMatrix::from_rows(ids(5), &rows).expect("matrix");
        SampleSet::new(features, InjectionSequence::new(injections)).expect("set")
    }

    #[test]
    fn test_single_linear_decay() {
        init_logger();
        let qc = linear_decay_qc();
        let config = DriftConfig {
            report: true,
            ..DriftConfig::default()
        };
        let mut sink = RecordingSink::default();

        let result = run_pipeline(&qc, &batch_between_qcs(), None, &config, &mut sink)
            .expect("pipeline");
        let model = &result.correction.model;

        assert_eq!(model.selection.assignment.k(), 1);
        let factors = model.curves[0].factors();
        assert_eq!(factors[0], 1.0);
        for (i, f) in factors.iter().enumerate() {
            let expected = 1.0 / (1.0 - 0.1 * i as f64 / 9.0);
            assert!((f - expected).abs() < 1e-6);
        }

        assert_eq!(result.actions[0].action, Action::CorrQc);
        assert_eq!(result.retained.len(), 5);
        assert!(result.removed.is_empty());
        assert_eq!(result.actions[0].n_after, Some(5));

        // Batch drift is removed along with QC drift
        for col in result.test.features().data().columns() {
            let first = col[0];
            assert!(col.iter().all(|v| (v - first).abs() < 1e-6));
        }
        assert!(sink.events.len() >= 4);
        assert!(matches!(
            sink.events.first(),
            Some(DiagnosticEvent::ClustersSelected { k: 1, .. })
        ));
        let baseline = sink.events.iter().find_map(|e| match e {
            DiagnosticEvent::DriftModeled { baseline, .. } => Some(*baseline),
            _ => None,
        });
        assert_eq!(baseline, Some(model.curves[0].predicted()[0]));
    }

    #[test]
    fn test_unsorted_input_matches_sorted() {
        let qc = linear_decay_qc();
        let order: Vec<usize> = vec![3, 0, 9, 1, 8, 2, 7, 4, 6, 5];
        let shuffled = SampleSet::new(
            qc.features().select_rows(&order),
            InjectionSequence::new(order.iter().map(|&r| qc.injections().as_slice()[r]).collect()),
        )
        .expect("set");
        let config = DriftConfig::default();
        let batch = batch_between_qcs();

        let a = run_pipeline(&qc, &batch, None, &config, &mut RecordingSink::default())
            .expect("sorted");
        let b = run_pipeline(&shuffled, &batch, None, &config, &mut RecordingSink::default())
            .expect("shuffled");

        assert_eq!(a.qc, b.qc);
        assert_eq!(a.test, b.test);
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let qc = linear_decay_qc();
        let batch = batch_between_qcs();
        let config = DriftConfig::default();

        let a = run_pipeline(&qc, &batch, None, &config, &mut RecordingSink::default())
            .expect("first");
        let b = run_pipeline(&qc, &batch, None, &config, &mut RecordingSink::default())
            .expect("second");

        assert_eq!(a.correction.model.selection, b.correction.model.selection);
        assert_eq!(a.correction.model.curves, b.correction.model.curves);
        assert_eq!(a.retained, b.retained);
        assert_eq!(a.test, b.test);
    }

    #[test]
    fn test_stable_reference_blocks_correction() {
        let qc = linear_decay_qc();
        let reference = SampleSet::new(
            FeatureMatrix::from_rows(ids(5), &vec![vec![0.2, 0.4, 0.6, 0.8, 1.0]; 3])
                .expect("matrix"),
            InjectionSequence::new(vec![4, 6, 8]),
        )
        .expect("set");
        let batch = batch_between_qcs();
        let config = DriftConfig::default();

        let result = run_pipeline(&qc, &batch, Some(&reference), &config, &mut RecordingSink::default())
            .expect("pipeline");

        assert_eq!(result.correction.mode, ReferenceMode::One);
        assert_eq!(result.actions[0].action, Action::None);
        assert_eq!(result.correction.test, batch);
        assert_eq!(result.correction.qc, qc);
        assert!(result.summary.reference_distance.is_some());
    }

    #[test]
    fn test_report_flag_off_is_silent() {
        let mut sink = RecordingSink::default();
        run_pipeline(
            &linear_decay_qc(),
            &batch_between_qcs(),
            None,
            &DriftConfig::default(),
            &mut sink,
        )
        .expect("pipeline");

        assert!(sink.events.is_empty());
    }

    #[test]
    fn test_invalid_config() {
        let config = DriftConfig {
            cv_limit: 0.0,
            ..DriftConfig::default()
        };
        let err = run_pipeline(
            &linear_decay_qc(),
            &batch_between_qcs(),
            None,
            &config,
            &mut RecordingSink::default(),
        )
        .unwrap_err();
        assert!(matches!(err.error, DriftError::Config(_)));
        assert!(err.selection.is_none());
    }

    fn two_feature_set(injections: Vec<i64>, rows: &[Vec<f64>], names: [&str; 2]) -> SampleSet {
        let ids = names.iter().map(|s| (*s).to_string()).collect();
        SampleSet::new(
            FeatureMatrix::from_rows(ids, rows).expect("matrix"),
            InjectionSequence::new(injections),
        )
        .expect("set")
    }

    #[test]
    fn test_drift_failure_keeps_selection() {
        // The interpolating quadratic dips below zero between injections 1 and 4
        let qc = two_feature_set(
            vec![1, 4, 5],
            &[vec![1.0, 1.0], vec![0.1, 0.1], vec![1.0, 1.0]],
            ["M1", "M2"],
        );
        let batch = two_feature_set(vec![2], &[vec![0.5, 0.5]], ["M1", "M2"]);
        let config = DriftConfig {
            cluster_counts: vec![1],
            model_shapes: vec![crate::structs::ModelShape::Eii],
            ..DriftConfig::default()
        };

        let err = run_pipeline(&qc, &batch, None, &config, &mut RecordingSink::default())
            .unwrap_err();

        assert!(matches!(err.error, DriftError::DegenerateDrift { cluster: 1, .. }));
        let selection = err.selection.expect("selection kept");
        assert_eq!(selection.assignment.k(), 1);
        assert!(err.model.is_none());
        assert!(err.correction.is_none());
    }

    #[test]
    fn test_correction_failure_keeps_model() {
        let qc = linear_decay_qc();
        let rows = vec![vec![1.0; 5]; 2];
        let batch = SampleSet::new(
            FeatureMatrix::from_rows((1..=5).map(|f| format!("X{f}")).collect(), &rows)
                .expect("matrix"),
            InjectionSequence::new(vec![2, 3]),
        )
        .expect("set");

        let err = run_pipeline(&qc, &batch, None, &DriftConfig::default(), &mut RecordingSink::default())
            .unwrap_err();

        assert!(matches!(err.error, DriftError::DimensionMismatch(_)));
        let model = err.model.expect("model kept");
        assert_eq!(model.curves.len(), 1);
        assert!(err.selection.is_some());
        assert!(err.correction.is_none());
    }

    #[test]
    fn test_action_table_serializes() {
        let result = run_pipeline(
            &linear_decay_qc(),
            &batch_between_qcs(),
            None,
            &DriftConfig::default(),
            &mut RecordingSink::default(),
        )
        .expect("pipeline");

        let json = serde_json::to_value(&result.actions).expect("json");
        assert_eq!(json[0]["action"], "Corr_QC");
        assert_eq!(json[0]["n_after"], 5);
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: DriftConfig =
            serde_json::from_str(r#"{"cv_limit": 0.3, "model_shapes": ["VVI"], "smoothing": "localPolynomial"}"#)
                .expect("config");

        assert!((config.cv_limit - 0.3).abs() < 1e-12);
        assert_eq!(config.model_shapes, vec![crate::structs::ModelShape::Vvi]);
        assert_eq!(config.cluster_counts, DriftConfig::default().cluster_counts);
        assert!(config.validate().is_ok());
    }
}
