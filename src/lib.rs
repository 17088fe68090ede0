//! Signal drift correction for LC/MS runs using pooled QC injections.
//!
//! Features are grouped by how their QC intensities move over the run,
//! a smooth drift curve is fitted per group, and a group's correction is
//! kept only when it tightens the QC (or reference) samples. Features that
//! stay unstable afterwards are filtered out.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::uninlined_format_args, clippy::module_name_repetitions)]

pub mod drift;
pub mod structs;

pub use drift::clustering::cluster_features;
pub use drift::correction::correct_drift;
pub use drift::diagnostics::{DiagnosticEvent, DiagnosticsSink, LogSink, RecordingSink};
pub use drift::filter::{filter_features, retained_features};
pub use drift::modeling::{apply_curve, model_drift, model_drift_over, run_range};
pub use drift::pipeline::run_pipeline;
pub use structs::{
    Action, ActionRecord, BatchObject, ClusterId, ClusterSelection, CorrectionDecision,
    CorrectionResult, DriftConfig, DriftCurve, DriftError, DriftModel, FeatureMatrix,
    FilterResult, FilterSummary, FitKind, InjectionSequence, ModelShape, PipelineFailure,
    QcObject, RefObject, ReferenceMode, Result, SampleSet, SmoothingMethod,
};
