//! Reporting side-channel for stage events

use crate::structs::{ClusterId, CorrectionDecision, FilterSummary, FitKind, ModelShape};
use serde::Serialize;

/// Something the pipeline observed while running
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    ClustersSelected {
        shape: ModelShape,
        k: usize,
        bic: f64,
        candidates_tried: usize,
    },
    DriftModeled {
        cluster: ClusterId,
        fit: FitKind,
        delta_distance: f64,
        /// Predicted intensity at the first injection of the range
        baseline: f64,
        /// Factor at the last injection of the range
        final_factor: f64,
    },
    CorrectionEvaluated(CorrectionDecision),
    FeaturesFiltered {
        retained: usize,
        removed: usize,
        cv_limit: f64,
        summary: FilterSummary,
    },
}

/// Receiver of diagnostic events, e.g. a plotting or report backend
pub trait DiagnosticsSink {
    fn emit(&mut self, event: &DiagnosticEvent);
}

/// Forwards events to the `log` facade at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn emit(&mut self, event: &DiagnosticEvent) {
        match event {
            DiagnosticEvent::ClustersSelected {
                shape,
                k,
                bic,
                candidates_tried,
            } => log::info!("clusters: {shape} k={k} BIC={bic:.3} ({candidates_tried} candidates)"),
            DiagnosticEvent::DriftModeled {
                cluster,
                fit,
                delta_distance,
                baseline,
                final_factor,
            } => log::info!(
                "drift: cluster {cluster} {fit:?} delta={delta_distance:.4} baseline={baseline:.4} final factor={final_factor:.4}"
            ),
            DiagnosticEvent::CorrectionEvaluated(d) => log::info!(
                "correction: cluster {} {:.4} -> {:.4} {}",
                d.cluster,
                d.distance_before,
                d.distance_tentative,
                if d.accepted { "accepted" } else { "rejected" }
            ),
            DiagnosticEvent::FeaturesFiltered {
                retained,
                removed,
                cv_limit,
                summary,
            } => log::info!(
                "filter: kept {retained}, removed {removed} at CV {cv_limit}; mean CV raw {:.4} final {:.4}",
                summary.mean_cv.raw,
                summary.mean_cv.final_
            ),
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub events: Vec<DiagnosticEvent>,
}

impl DiagnosticsSink for RecordingSink {
    fn emit(&mut self, event: &DiagnosticEvent) {
        self.events.push(event.clone());
    }
}
