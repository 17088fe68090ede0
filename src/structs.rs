//! Consolidated public types for the qcdrift crate
//!
//! This module contains all public structs, enums, and type aliases used across the crate.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum DriftError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Fitting failed: {0}")]
    FittingFailed(String),

    #[error("Reference mode 'many' is not supported: only a single reference series can be used")]
    ReferenceModeUnsupported,

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Drift curve of cluster {cluster} is non-positive at injection {injection}")]
    DegenerateDrift { cluster: ClusterId, injection: i64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("ML error: {0}")]
    Ml(String),
}

pub type Result<T> = std::result::Result<T, DriftError>;

// ============================================================================
// Input Types
// ============================================================================

/// Cluster identifier, numbered from 1
pub type ClusterId = usize;

/// Scaled intensities: injections as rows, features as columns
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    /// Feature identifiers, one per column, unique
    pub(crate) ids: Vec<String>,
    /// Row-major intensity data
    pub(crate) data: Array2<f64>,
}

/// Injection indices aligned 1:1 with matrix rows
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InjectionSequence(pub(crate) Vec<i64>);

/// A set of injections with their feature intensities.
///
/// Used for the QC series, the test/batch series and the optional reference series.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSet {
    pub(crate) features: FeatureMatrix,
    pub(crate) injections: InjectionSequence,
    pub(crate) groups: Option<Vec<String>>,
}

pub type QcObject = SampleSet;
pub type BatchObject = SampleSet;
pub type RefObject = SampleSet;

// ============================================================================
// Configuration Types
// ============================================================================

/// Covariance structure of the mixture components.
///
/// Letters follow the usual volume/shape/orientation naming: `E` equal across
/// components, `V` variable, `I` identity (axis-aligned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelShape {
    /// Spherical, equal volume
    #[serde(rename = "EII")]
    Eii,
    /// Spherical, variable volume
    #[serde(rename = "VII")]
    Vii,
    /// Diagonal, equal volume and shape
    #[serde(rename = "EEI")]
    Eei,
    /// Diagonal, variable volume and shape
    #[serde(rename = "VVI")]
    Vvi,
    /// Full covariance per component
    #[serde(rename = "VVV")]
    Vvv,
}

impl ModelShape {
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Eii => "EII",
            Self::Vii => "VII",
            Self::Eei => "EEI",
            Self::Vvi => "VVI",
            Self::Vvv => "VVV",
        }
    }

    /// Number of free covariance parameters for `k` components in `d` dimensions
    #[must_use]
    pub fn covariance_params(self, k: usize, d: usize) -> usize {
        match self {
            Self::Eii => 1,
            Self::Vii => k,
            Self::Eei => d,
            Self::Vvi => k * d,
            Self::Vvv => k * d * (d + 1) / 2,
        }
    }
}

impl fmt::Display for ModelShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Regression used to model a cluster's drift
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SmoothingMethod {
    #[default]
    CubicSpline,
    LocalPolynomial,
}

/// How correction acceptance is gated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceMode {
    /// Gate on the QC series itself
    None,
    /// Gate on a single external reference series
    One,
    /// Several external reference series; always rejected
    Many,
}

/// Configuration for the drift correction pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Candidate cluster counts for the mixture search
    pub cluster_counts: Vec<usize>,
    /// Candidate covariance shapes, evaluated in this order
    pub model_shapes: Vec<ModelShape>,
    pub smoothing: SmoothingMethod,
    /// Spline `spar` or local-regression span
    pub smoothing_param: f64,
    /// Features with corrected QC CV above this are dropped
    pub cv_limit: f64,
    /// Relative log-likelihood change that ends EM
    pub tolerance: f64,
    pub max_iterations: u64,
    /// Added to every variance estimate, relative to the mean square of the data
    pub covariance_floor: f64,
    /// Route stage events to the diagnostics sink
    pub report: bool,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            cluster_counts: (1..=52).step_by(3).collect(),
            model_shapes: vec![ModelShape::Eii, ModelShape::Vii, ModelShape::Eei, ModelShape::Vvi],
            smoothing: SmoothingMethod::CubicSpline,
            smoothing_param: 0.2,
            cv_limit: 0.2,
            tolerance: 1e-5,
            max_iterations: 500,
            covariance_floor: 1e-6,
            report: false,
        }
    }
}

// ============================================================================
// Clustering Types
// ============================================================================

/// BIC of one (shape, cluster count) candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub shape: ModelShape,
    pub k: usize,
    /// `None` when the fit did not converge
    pub bic: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Mapping of every feature to exactly one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAssignment {
    pub(crate) feature_ids: Vec<String>,
    /// Cluster of each feature, aligned with `feature_ids`
    pub(crate) labels: Vec<ClusterId>,
    pub(crate) k: usize,
}

/// Winning mixture configuration and the resulting assignment
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSelection {
    pub assignment: ClusterAssignment,
    pub shape: ModelShape,
    pub bic: f64,
    /// Every evaluated candidate in enumeration order
    pub candidates: Vec<CandidateScore>,
}

// ============================================================================
// Drift Types
// ============================================================================

/// Regression actually used for a cluster's curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FitKind {
    QuadraticFallback,
    CubicSpline,
    LocalPolynomial,
}

/// Dense correction factors over every integer injection of the run range
#[derive(Debug, Clone, PartialEq)]
pub struct DriftCurve {
    pub cluster: ClusterId,
    pub fit: FitKind,
    /// Injection of `factors[0]`
    pub(crate) first: i64,
    /// Fitted intensity at each injection
    pub(crate) predicted: Vec<f64>,
    /// `predicted[0] / predicted[i]`; `factors[0] == 1.0`
    pub(crate) factors: Vec<f64>,
}

/// Per-cluster quality figures computed before any correction is applied
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterDiagnostics {
    pub cluster: ClusterId,
    pub n_features: usize,
    /// RMS distance after hypothetical correction minus RMS distance raw
    pub delta_distance: f64,
    pub cv_raw: CvSummary,
    pub cv_corrected: CvSummary,
}

/// Mean CV and share of stable features
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CvSummary {
    pub mean: f64,
    pub below_015: f64,
    pub below_020: f64,
}

/// Decision taken for a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Action {
    #[default]
    #[serde(rename = "None")]
    None,
    #[serde(rename = "Corr_QC")]
    CorrQc,
    #[serde(rename = "Corr_1Ref")]
    Corr1Ref,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "None",
            Self::CorrQc => "Corr_QC",
            Self::Corr1Ref => "Corr_1Ref",
        })
    }
}

/// One row of the per-cluster action table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRecord {
    pub cluster: ClusterId,
    pub action: Action,
    pub n_before: usize,
    pub cv_before: f64,
    /// Filled in by the feature filter
    pub n_after: Option<usize>,
    /// Mean corrected CV of surviving features; `None` when nothing survives
    pub cv_after: Option<f64>,
}

/// Output of drift modelling: the selection plus one curve per cluster
#[derive(Debug, Clone)]
pub struct DriftModel {
    pub selection: ClusterSelection,
    /// QC series the curves were fitted on, sorted by injection
    pub qc: SampleSet,
    pub curves: Vec<DriftCurve>,
    pub diagnostics: Vec<ClusterDiagnostics>,
    /// All `Action::None`
    pub actions: Vec<ActionRecord>,
}

// ============================================================================
// Correction Types
// ============================================================================

/// Outcome of one acceptance test
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CorrectionDecision {
    pub cluster: ClusterId,
    /// RMS distance of the committed gating matrix before the test
    pub distance_before: f64,
    /// RMS distance of the tentative matrix
    pub distance_tentative: f64,
    pub accepted: bool,
}

/// Output of the drift corrector
#[derive(Debug, Clone)]
pub struct CorrectionResult {
    pub model: DriftModel,
    pub mode: ReferenceMode,
    pub actions: Vec<ActionRecord>,
    /// Decisions in evaluation order
    pub decisions: Vec<CorrectionDecision>,
    pub kept: BTreeSet<ClusterId>,
    /// Corrected QC series, sorted by injection
    pub qc: SampleSet,
    /// Corrected reference series, rows in the caller's order
    pub reference: Option<SampleSet>,
    /// Reference series as supplied
    pub reference_raw: Option<SampleSet>,
    /// Corrected test series, rows in the caller's order
    pub test: SampleSet,
    pub n_corrected: usize,
    pub n_clusters: usize,
}

// ============================================================================
// Filter Types
// ============================================================================

/// A metric tracked across pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageTrajectory {
    pub raw: f64,
    /// Raw data restricted to the final feature set
    pub clean: f64,
    pub corrected: f64,
    #[serde(rename = "final")]
    pub final_: f64,
}

/// Diagnostics-only summary of the filter stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterSummary {
    pub mean_cv: StageTrajectory,
    /// RMS distance of the reference series, when one exists
    pub reference_distance: Option<StageTrajectory>,
}

/// Output of the feature filter and of the whole pipeline
#[derive(Debug, Clone)]
pub struct FilterResult {
    pub correction: CorrectionResult,
    pub cv_limit: f64,
    pub retained: Vec<String>,
    pub removed: Vec<String>,
    pub qc: SampleSet,
    pub reference: Option<SampleSet>,
    pub test: SampleSet,
    pub actions: Vec<ActionRecord>,
    pub summary: FilterSummary,
}

/// A pipeline error together with the stage outputs completed before it
#[derive(Error, Debug)]
#[error("Drift pipeline stopped: {error}")]
pub struct PipelineFailure {
    #[source]
    pub error: DriftError,
    pub selection: Option<ClusterSelection>,
    pub model: Option<DriftModel>,
    pub correction: Option<CorrectionResult>,
}

impl From<DriftError> for PipelineFailure {
    fn from(error: DriftError) -> Self {
        Self {
            error,
            selection: None,
            model: None,
            correction: None,
        }
    }
}
