use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::backend::{DetectFailure, Detection};

/// One category from a [`LabelSet`], stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelSetError {
    #[error("label set is empty")]
    Empty,
    #[error("label names must not be blank")]
    Blank,
    #[error("duplicate label: {0}")]
    Duplicate(String),
}

/// Ordered, closed set of mutually-exclusive labels.
///
/// Declaration order is the tie-break priority: when two labels score
/// exactly the same, the one declared first wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<Label>,
}

impl LabelSet {
    pub fn new<I, S>(names: I) -> Result<Self, LabelSetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut labels: Vec<Label> = Vec::new();
        for name in names {
            let label = Label::new(name.as_ref());
            if label.0.is_empty() {
                return Err(LabelSetError::Blank);
            }
            if labels.contains(&label) {
                return Err(LabelSetError::Duplicate(label.0));
            }
            labels.push(label);
        }
        if labels.is_empty() {
            return Err(LabelSetError::Empty);
        }
        Ok(Self { labels })
    }

    /// Find the label a backend key refers to, ignoring case and surrounding whitespace.
    pub fn resolve(&self, name: &str) -> Option<&Label> {
        let wanted = Label::new(name);
        self.labels.iter().find(|l| **l == wanted)
    }

    /// Position in declaration order; lower wins ties.
    pub fn priority(&self, label: &Label) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.iter()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Highest-scoring label. Labels are visited in declaration order and only a
    /// strictly greater score replaces the leader, so exact ties go to the
    /// earlier-declared label.
    pub fn argmax<F>(&self, mut score: F) -> (&Label, f64)
    where
        F: FnMut(&Label) -> f64,
    {
        let mut best = (&self.labels[0], score(&self.labels[0]));
        for label in &self.labels[1..] {
            let s = score(label);
            if s > best.1 {
                best = (label, s);
            }
        }
        best
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        Self {
            labels: vec![Label::new("man"), Label::new("woman")],
        }
    }
}

/// Side attributes a backend may report alongside the label distribution.
/// Opaque to aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Auxiliary {
    /// Estimated age in years.
    pub age: Option<f32>,
}

/// Normalized outcome of one successful backend attempt on one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameResult {
    pub frame_index: usize,
    /// The backend's top choice.
    pub label: Label,
    /// Confidence in `label`, in [0, 1].
    pub primary_confidence: f32,
    /// Face-localization quality, in [0, 1]. 1.0 when the backend reports none.
    pub secondary_confidence: f32,
    pub backend_id: String,
    /// Full distribution over the label set, each value in [0, 1].
    pub raw_scores: BTreeMap<Label, f32>,
    pub auxiliary: Auxiliary,
}

impl FrameResult {
    /// Influence on the vote: label confidence × detection quality.
    pub fn weight(&self) -> f32 {
        self.primary_confidence * self.secondary_confidence
    }

    /// Normalize a raw backend detection against the label set.
    ///
    /// Keys outside the set are dropped. A distribution that names no label
    /// from the set is a backend error, not a missing face.
    pub fn from_detection(
        frame_index: usize,
        backend_id: &str,
        detection: Detection,
        labels: &LabelSet,
    ) -> Result<Self, DetectFailure> {
        let mut resolved: Vec<(&Label, f32)> = Vec::with_capacity(detection.scores.len());
        for (key, value) in &detection.scores {
            match labels.resolve(key) {
                Some(label) => resolved.push((label, *value)),
                None => tracing::debug!(backend = backend_id, key = %key, "ignoring score outside label set"),
            }
        }

        // Only in-set values decide the scale; a stray key must not rescale the rest.
        let scale = percent_scale(resolved.iter().map(|(_, v)| *v));

        let mut raw_scores: BTreeMap<Label, f32> = BTreeMap::new();
        for (label, value) in resolved {
            let value = to_unit(value, scale);
            raw_scores
                .entry(label.clone())
                .and_modify(|v| *v = v.max(value))
                .or_insert(value);
        }

        if raw_scores.is_empty() {
            return Err(DetectFailure::Backend(format!(
                "distribution has no labels from the label set (keys: {:?})",
                detection.scores.keys().collect::<Vec<_>>()
            )));
        }

        let (label, primary) =
            labels.argmax(|l| raw_scores.get(l).copied().unwrap_or(0.0) as f64);
        let label = label.clone();

        let secondary = detection
            .face_confidence
            .map(|q| to_unit(q, percent_scale(std::iter::once(q))))
            .unwrap_or(1.0);

        Ok(Self {
            frame_index,
            label,
            primary_confidence: primary as f32,
            secondary_confidence: secondary,
            backend_id: backend_id.to_string(),
            raw_scores,
            auxiliary: detection.auxiliary,
        })
    }
}

/// Divisor that brings a distribution into [0, 1]: 100 when any value is
/// above 1.0 (a percentage scale), otherwise 1.
fn percent_scale(values: impl IntoIterator<Item = f32>) -> f32 {
    if values.into_iter().any(|v| v > 1.0) {
        100.0
    } else {
        1.0
    }
}

fn to_unit(value: f32, scale: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        (value / scale).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(scores: &[(&str, f32)], face: Option<f32>) -> Detection {
        Detection {
            scores: scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            face_confidence: face,
            auxiliary: Auxiliary::default(),
        }
    }

    #[test]
    fn test_label_set_rejects_duplicates_case_insensitively() {
        let err = LabelSet::new(["man", "Man"]).unwrap_err();
        assert_eq!(err, LabelSetError::Duplicate("man".into()));
    }

    #[test]
    fn test_label_set_rejects_empty_and_blank() {
        assert_eq!(LabelSet::new(Vec::<String>::new()).unwrap_err(), LabelSetError::Empty);
        assert_eq!(LabelSet::new(["man", "  "]).unwrap_err(), LabelSetError::Blank);
    }

    #[test]
    fn test_resolve_ignores_case() {
        let labels = LabelSet::default();
        assert_eq!(labels.resolve("Woman"), Some(&Label::new("woman")));
        assert_eq!(labels.resolve(" MAN "), Some(&Label::new("man")));
        assert_eq!(labels.resolve("child"), None);
    }

    #[test]
    fn test_label_is_normalized_on_construction() {
        let label = Label::new("  Woman ");
        assert_eq!(label.as_str(), "woman");
        assert_eq!(serde_json::to_string(&label).unwrap(), r#""woman""#);
    }

    #[test]
    fn test_resolve_folds_non_ascii_case() {
        let labels = LabelSet::new(["Мужчина", "Женщина"]).unwrap();
        assert_eq!(labels.resolve("Мужчина"), Some(&Label::new("мужчина")));
        assert_eq!(labels.resolve("ЖЕНЩИНА "), Some(&Label::new("женщина")));
    }

    #[test]
    fn test_argmax_tie_goes_to_first_declared() {
        let labels = LabelSet::new(["woman", "man"]).unwrap();
        let (label, score) = labels.argmax(|_| 0.5);
        assert_eq!(label.as_str(), "woman");
        assert_eq!(score, 0.5);

        let labels = LabelSet::new(["man", "woman"]).unwrap();
        assert_eq!(labels.argmax(|_| 0.5).0.as_str(), "man");
    }

    #[test]
    fn test_percentage_distribution_is_scaled() {
        let labels = LabelSet::default();
        let result = FrameResult::from_detection(
            0,
            "scrfd",
            detection(&[("Man", 99.5), ("Woman", 0.5)], Some(0.97)),
            &labels,
        )
        .unwrap();

        assert_eq!(result.label.as_str(), "man");
        assert!((result.primary_confidence - 0.995).abs() < 1e-6);
        assert!((result.raw_scores[&Label::new("woman")] - 0.005).abs() < 1e-6);
        assert!((result.secondary_confidence - 0.97).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_set_key_does_not_rescale_distribution() {
        let labels = LabelSet::default();
        let result = FrameResult::from_detection(
            0,
            "cmd",
            detection(&[("man", 0.9), ("woman", 0.1), ("age", 31.0)], None),
            &labels,
        )
        .unwrap();

        assert_eq!(result.label.as_str(), "man");
        assert!((result.primary_confidence - 0.9).abs() < 1e-6);
        assert!((result.raw_scores[&Label::new("woman")] - 0.1).abs() < 1e-6);
        assert_eq!(result.raw_scores.len(), 2);
    }

    #[test]
    fn test_probability_distribution_is_kept() {
        let labels = LabelSet::default();
        let result = FrameResult::from_detection(
            0,
            "b",
            detection(&[("man", 0.3), ("woman", 0.7)], None),
            &labels,
        )
        .unwrap();
        assert_eq!(result.label.as_str(), "woman");
        assert!((result.primary_confidence - 0.7).abs() < 1e-6);
        assert_eq!(result.secondary_confidence, 1.0);
    }

    #[test]
    fn test_confidences_always_within_unit_interval() {
        let labels = LabelSet::default();
        let cases = [
            detection(&[("man", 250.0), ("woman", -3.0)], Some(140.0)),
            detection(&[("man", f32::NAN), ("woman", 0.2)], Some(-1.0)),
            detection(&[("man", f32::INFINITY)], Some(f32::NAN)),
        ];
        for d in cases {
            let r = FrameResult::from_detection(0, "b", d, &labels).unwrap();
            assert!((0.0..=1.0).contains(&r.primary_confidence), "{r:?}");
            assert!((0.0..=1.0).contains(&r.secondary_confidence), "{r:?}");
            assert!(r.raw_scores.values().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_percent_face_confidence_is_scaled() {
        let labels = LabelSet::default();
        let r = FrameResult::from_detection(0, "b", detection(&[("man", 0.9)], Some(92.0)), &labels)
            .unwrap();
        assert!((r.secondary_confidence - 0.92).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_labels_are_a_backend_error() {
        let labels = LabelSet::default();
        let err = FrameResult::from_detection(0, "b", detection(&[("cat", 0.9)], None), &labels)
            .unwrap_err();
        assert!(matches!(err, DetectFailure::Backend(_)));
    }

    #[test]
    fn test_within_frame_tie_uses_label_priority() {
        let labels = LabelSet::default();
        let r = FrameResult::from_detection(
            0,
            "b",
            detection(&[("woman", 50.0), ("man", 50.0)], None),
            &labels,
        )
        .unwrap();
        assert_eq!(r.label.as_str(), "man");
    }

    #[test]
    fn test_weight_is_product() {
        let labels = LabelSet::default();
        let r = FrameResult::from_detection(0, "b", detection(&[("man", 0.8)], Some(0.5)), &labels)
            .unwrap();
        assert!((r.weight() - 0.4).abs() < 1e-6);
    }
}
