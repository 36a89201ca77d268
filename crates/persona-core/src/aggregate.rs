//! Confidence-weighted vote across frames.
//!
//! Each observation votes for its label with weight
//! `primary_confidence × secondary_confidence`. Scores are normalized by the
//! total weight and the top label wins, ties going to the label declared
//! first in the [`LabelSet`].

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::certainty::{CertaintyBand, CertaintyClassifier};
use crate::types::{FrameResult, Label, LabelSet};

pub const EMPTY_SUGGESTION: &str = "Please ensure your face is clearly visible and well-lit";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    /// No frame produced a usable detection.
    #[error("no valid faces detected in any frame")]
    Empty,
}

impl AggregationError {
    pub fn suggestion(&self) -> &'static str {
        match self {
            AggregationError::Empty => EMPTY_SUGGESTION,
        }
    }
}

/// The fused decision for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationResult {
    pub final_label: Label,
    /// `per_label_score[final_label]`.
    pub final_confidence: f32,
    /// Every label of the set; sums to 1.
    pub per_label_score: BTreeMap<Label, f32>,
    pub frames_provided: usize,
    pub frames_with_detection: usize,
    /// Number of frame results that voted.
    pub observations: usize,
    /// Sum of raw weights before normalization. A single weak observation
    /// still normalizes to 1.0; this shows how much evidence backed it.
    pub total_weight: f32,
    pub certainty_band: CertaintyBand,
    pub warning: Option<String>,
}

/// Fuse frame results into one decision.
///
/// The result does not depend on the order of `results`: per-label weights
/// are summed in sorted order, so reordering produces bit-identical scores.
pub fn combine(
    labels: &LabelSet,
    results: &[FrameResult],
    frames_provided: usize,
    classifier: &CertaintyClassifier,
) -> Result<AggregationResult, AggregationError> {
    let mut weights: Vec<Vec<f64>> = vec![Vec::new(); labels.len()];
    let mut frames = BTreeSet::new();
    let mut observations = 0usize;

    for result in results {
        let Some(slot) = labels.priority(&result.label) else {
            tracing::debug!(label = %result.label, "skipping result outside label set");
            continue;
        };
        weights[slot].push(result.weight() as f64);
        frames.insert(result.frame_index);
        observations += 1;
    }

    let label_sums: Vec<f64> = weights.iter_mut().map(|w| sorted_sum(w)).collect();
    let mut all: Vec<f64> = weights.into_iter().flatten().collect();
    let total_weight = sorted_sum(&mut all);

    if !(total_weight > 0.0) {
        return Err(AggregationError::Empty);
    }

    let normalized: Vec<f64> = label_sums.iter().map(|s| s / total_weight).collect();
    let (final_label, final_score) =
        labels.argmax(|label| labels.priority(label).map_or(0.0, |slot| normalized[slot]));
    let final_label = final_label.clone();
    let final_score = final_score as f32;

    let per_label_score = labels
        .iter()
        .zip(&normalized)
        .map(|(label, score)| (label.clone(), *score as f32))
        .collect();

    Ok(AggregationResult {
        final_label,
        final_confidence: final_score,
        per_label_score,
        frames_provided,
        frames_with_detection: frames.len(),
        observations,
        total_weight: total_weight as f32,
        certainty_band: classifier.band(final_score),
        warning: classifier.warning(final_score).map(str::to_string),
    })
}

fn sorted_sum(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    values.iter().sum()
}
