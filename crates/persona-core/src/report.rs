//! Response shapes handed to the transport layer.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::aggregate::AggregationResult;
use crate::certainty::{CertaintyBand, CertaintyClassifier};
use crate::pipeline::{PipelineError, PipelineOutcome};

fn round3(v: f32) -> f32 {
    (v * 1000.0).round() / 1000.0
}

/// Fused multi-frame decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionReport {
    pub label: String,
    pub confidence: f32,
    pub certainty: CertaintyBand,
    pub frames_analyzed: usize,
    pub successful_detections: usize,
    pub per_label_score: BTreeMap<String, f32>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl From<&AggregationResult> for DecisionReport {
    fn from(agg: &AggregationResult) -> Self {
        Self {
            label: agg.final_label.to_string(),
            confidence: round3(agg.final_confidence),
            certainty: agg.certainty_band,
            frames_analyzed: agg.frames_provided,
            successful_detections: agg.frames_with_detection,
            per_label_score: agg
                .per_label_score
                .iter()
                .map(|(label, score)| (label.to_string(), round3(*score)))
                .collect(),
            message: format!(
                "Detected as {} with {} certainty",
                agg.final_label, agg.certainty_band
            ),
            warning: agg.warning.clone(),
        }
    }
}

/// Single-image result: the best observation's own confidence plus which
/// backend produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleReport {
    pub label: String,
    pub confidence: f32,
    pub certainty: CertaintyBand,
    pub detector_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_estimate: Option<f32>,
    pub raw_scores: BTreeMap<String, f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl SingleReport {
    pub fn from_outcome(outcome: &PipelineOutcome, classifier: &CertaintyClassifier) -> Option<Self> {
        let best = outcome.best_observation()?;
        Some(Self {
            label: best.label.to_string(),
            confidence: round3(best.primary_confidence),
            certainty: classifier.band(best.primary_confidence),
            detector_used: best.backend_id.clone(),
            age_estimate: best.auxiliary.age.map(|a| a.round()),
            raw_scores: best
                .raw_scores
                .iter()
                .map(|(label, score)| (label.to_string(), round3(*score)))
                .collect(),
            warning: classifier
                .warning(best.primary_confidence)
                .map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl From<&PipelineError> for ErrorReport {
    fn from(err: &PipelineError) -> Self {
        Self {
            error: err.to_string(),
            suggestion: err.suggestion().map(str::to_string),
        }
    }
}

impl ErrorReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"error\":{:?}}}", self.error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{combine, AggregationError};
    use crate::types::{Auxiliary, FrameResult, Label, LabelSet};

    fn obs(frame: usize, label: &str, primary: f32, secondary: f32) -> FrameResult {
        FrameResult {
            frame_index: frame,
            label: Label::new(label),
            primary_confidence: primary,
            secondary_confidence: secondary,
            backend_id: "scrfd-640".into(),
            raw_scores: [(Label::new(label), primary)].into_iter().collect(),
            auxiliary: Auxiliary { age: Some(31.6) },
        }
    }

    #[test]
    fn test_decision_report_json() {
        let results = [
            obs(0, "man", 0.95, 0.95),
            obs(1, "man", 0.85, 0.90),
            obs(2, "woman", 0.60, 0.50),
        ];
        let agg = combine(&LabelSet::default(), &results, 3, &CertaintyClassifier::default()).unwrap();
        let json = serde_json::to_value(DecisionReport::from(&agg)).unwrap();

        assert_eq!(json["label"], "man");
        assert_eq!(json["certainty"], "high");
        assert_eq!(json["framesAnalyzed"], 3);
        assert_eq!(json["successfulDetections"], 3);
        assert_eq!(json["message"], "Detected as man with high certainty");
        assert!((json["perLabelScore"]["man"].as_f64().unwrap() - 0.848).abs() < 1e-6);
        assert!((json["perLabelScore"]["woman"].as_f64().unwrap() - 0.152).abs() < 1e-6);
        assert!(json.get("warning").is_none());
    }

    #[test]
    fn test_decision_report_includes_warning() {
        let results = [obs(0, "man", 0.65, 1.0), obs(1, "woman", 0.35, 1.0)];
        let agg = combine(&LabelSet::default(), &results, 2, &CertaintyClassifier::default()).unwrap();
        let report = DecisionReport::from(&agg);
        assert_eq!(report.certainty, CertaintyBand::Moderate);
        assert!(report.warning.is_some());
    }

    #[test]
    fn test_single_report_uses_best_observation() {
        let observations = vec![obs(0, "woman", 0.62, 0.80), obs(0, "man", 0.93, 0.97)];
        let aggregation =
            combine(&LabelSet::default(), &observations, 1, &CertaintyClassifier::default()).unwrap();
        let outcome = PipelineOutcome { aggregation, observations };

        let report = SingleReport::from_outcome(&outcome, &CertaintyClassifier::default()).unwrap();
        assert_eq!(report.label, "man");
        assert_eq!(report.confidence, 0.93);
        assert_eq!(report.certainty, CertaintyBand::VeryHigh);
        assert_eq!(report.detector_used, "scrfd-640");
        assert_eq!(report.age_estimate, Some(32.0));
        assert_eq!(report.warning, None);
    }

    #[test]
    fn test_error_report_for_empty_aggregation() {
        let err = PipelineError::Aggregation(AggregationError::Empty);
        let report = ErrorReport::from(&err);
        assert_eq!(report.error, "no valid faces detected in any frame");
        assert_eq!(
            report.suggestion.as_deref(),
            Some("Please ensure your face is clearly visible and well-lit")
        );

        let json: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(json["error"], "no valid faces detected in any frame");
    }

    #[test]
    fn test_error_report_without_suggestion() {
        let report = ErrorReport::from(&PipelineError::NoFrames);
        assert_eq!(report.to_json(), r#"{"error":"no frames received"}"#);
    }
}
