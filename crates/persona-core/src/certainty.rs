use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const LOW_CONFIDENCE_WARNING: &str =
    "Low confidence detection. Please try with better lighting and clearer face view.";

/// Coarse, ordered summary of a final confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertaintyBand {
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl CertaintyBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertaintyBand::Low => "low",
            CertaintyBand::Moderate => "moderate",
            CertaintyBand::High => "high",
            CertaintyBand::VeryHigh => "very_high",
        }
    }
}

impl fmt::Display for CertaintyBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Band lower bounds (inclusive) and the warning cut-off (exclusive).
///
/// `warn_below` is independent of the band edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertaintyThresholds {
    pub very_high: f32,
    pub high: f32,
    pub moderate: f32,
    pub warn_below: f32,
}

impl Default for CertaintyThresholds {
    fn default() -> Self {
        Self {
            very_high: 0.90,
            high: 0.75,
            moderate: 0.60,
            warn_below: 0.70,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdError {
    #[error("certainty threshold {name} = {value} is outside [0, 1]")]
    OutOfRange { name: &'static str, value: f32 },
    #[error("certainty thresholds must satisfy moderate <= high <= very_high")]
    Unordered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CertaintyClassifier {
    thresholds: CertaintyThresholds,
}

impl CertaintyClassifier {
    pub fn new(thresholds: CertaintyThresholds) -> Result<Self, ThresholdError> {
        let t = thresholds;
        for (name, value) in [
            ("very_high", t.very_high),
            ("high", t.high),
            ("moderate", t.moderate),
            ("warn_below", t.warn_below),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ThresholdError::OutOfRange { name, value });
            }
        }
        if !(t.moderate <= t.high && t.high <= t.very_high) {
            return Err(ThresholdError::Unordered);
        }
        Ok(Self { thresholds })
    }

    pub fn thresholds(&self) -> CertaintyThresholds {
        self.thresholds
    }

    pub fn band(&self, confidence: f32) -> CertaintyBand {
        let t = &self.thresholds;
        if confidence >= t.very_high {
            CertaintyBand::VeryHigh
        } else if confidence >= t.high {
            CertaintyBand::High
        } else if confidence >= t.moderate {
            CertaintyBand::Moderate
        } else {
            CertaintyBand::Low
        }
    }

    pub fn warning(&self, confidence: f32) -> Option<&'static str> {
        (confidence < self.thresholds.warn_below).then_some(LOW_CONFIDENCE_WARNING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_edges() {
        let c = CertaintyClassifier::default();
        assert_eq!(c.band(1.0), CertaintyBand::VeryHigh);
        assert_eq!(c.band(0.90), CertaintyBand::VeryHigh);
        assert_eq!(c.band(0.8999), CertaintyBand::High);
        assert_eq!(c.band(0.75), CertaintyBand::High);
        assert_eq!(c.band(0.7499), CertaintyBand::Moderate);
        assert_eq!(c.band(0.60), CertaintyBand::Moderate);
        assert_eq!(c.band(0.5999), CertaintyBand::Low);
        assert_eq!(c.band(0.0), CertaintyBand::Low);
    }

    #[test]
    fn test_band_is_monotonic() {
        let c = CertaintyClassifier::default();
        let mut prev = c.band(0.0);
        for i in 1..=1000 {
            let band = c.band(i as f32 / 1000.0);
            assert!(band >= prev, "band dropped at {i}");
            prev = band;
        }
    }

    #[test]
    fn test_moderate_with_warning() {
        // 0.65 is moderate but still under the separate 0.70 warning line.
        let c = CertaintyClassifier::default();
        assert_eq!(c.band(0.65), CertaintyBand::Moderate);
        assert_eq!(c.warning(0.65), Some(LOW_CONFIDENCE_WARNING));
    }

    #[test]
    fn test_no_warning_at_or_above_cutoff() {
        let c = CertaintyClassifier::default();
        assert_eq!(c.warning(0.70), None);
        assert_eq!(c.warning(0.72), None);
        assert_eq!(c.band(0.72), CertaintyBand::Moderate);
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let t = CertaintyThresholds { high: 0.95, ..Default::default() };
        assert_eq!(CertaintyClassifier::new(t).unwrap_err(), ThresholdError::Unordered);

        let t = CertaintyThresholds { warn_below: 1.5, ..Default::default() };
        assert!(matches!(
            CertaintyClassifier::new(t),
            Err(ThresholdError::OutOfRange { name: "warn_below", .. })
        ));
    }

    #[test]
    fn test_band_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&CertaintyBand::VeryHigh).unwrap(), "\"very_high\"");
        assert_eq!(CertaintyBand::Moderate.to_string(), "moderate");
    }
}
