use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::cascade::DetectorCascade;
use crate::frame::{Frame, Passthrough, Preprocessor};
use crate::types::FrameResult;

/// Which of a frame's cascade candidates take part in the cross-frame vote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidatePolicy {
    /// Only the highest-weight candidate per frame votes.
    #[default]
    BestPerFrame,
    /// Every candidate the cascade collected votes, so a frame that needed
    /// several attempts casts several weighted votes.
    AllCandidates,
}

impl FromStr for CandidatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best" | "best_per_frame" => Ok(Self::BestPerFrame),
            "all" | "all_candidates" => Ok(Self::AllCandidates),
            other => Err(format!("unknown candidate policy '{other}' (expected 'best' or 'all')")),
        }
    }
}

/// Runs preprocessing and the cascade for exactly one frame.
pub struct FrameAnalyzer {
    cascade: DetectorCascade,
    preprocessor: Arc<dyn Preprocessor>,
    policy: CandidatePolicy,
}

impl FrameAnalyzer {
    pub fn new(cascade: DetectorCascade) -> Self {
        Self {
            cascade,
            preprocessor: Arc::new(Passthrough),
            policy: CandidatePolicy::default(),
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn with_policy(mut self, policy: CandidatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cascade(&self) -> &DetectorCascade {
        &self.cascade
    }

    pub fn policy(&self) -> CandidatePolicy {
        self.policy
    }

    /// Analyze one frame. Takes ownership so the pixel buffer is released as
    /// soon as the cascade finishes, whatever the outcome.
    pub async fn analyze(&self, frame: Frame) -> Vec<FrameResult> {
        let index = frame.index;
        let frame = self.preprocessor.normalize(frame);
        let outcome = self.cascade.run(&frame).await;
        drop(frame);

        if outcome.candidates.is_empty() {
            tracing::info!(frame = index, attempts = outcome.attempts.len(), "no face detected in frame");
            return Vec::new();
        }

        if let Some(best) = outcome.best() {
            tracing::info!(
                frame = index,
                label = %best.label,
                confidence = best.primary_confidence,
                backend = %best.backend_id,
                candidates = outcome.candidates.len(),
                "frame verdict"
            );
        }

        match self.policy {
            CandidatePolicy::BestPerFrame => outcome.into_best().into_iter().collect(),
            CandidatePolicy::AllCandidates => outcome.candidates,
        }
    }
}
