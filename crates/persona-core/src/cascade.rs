//! Ordered detector cascade for a single frame.
//!
//! Backends are tried in priority order. A result that clears both
//! confidence gates stops the cascade; otherwise every backend is tried and
//! the candidates are kept for the caller to pick from.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{DetectFailure, DetectorBackend};
use crate::frame::Frame;
use crate::types::{FrameResult, LabelSet};

pub const DEFAULT_PRIMARY_THRESHOLD: f32 = 0.85;
pub const DEFAULT_SECONDARY_THRESHOLD: f32 = 0.90;
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(15);

/// "Good enough, stop early" gates. Both comparisons are strict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeThresholds {
    pub primary: f32,
    pub secondary: f32,
}

impl Default for CascadeThresholds {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY_THRESHOLD,
            secondary: DEFAULT_SECONDARY_THRESHOLD,
        }
    }
}

impl CascadeThresholds {
    pub fn accepts(&self, result: &FrameResult) -> bool {
        result.primary_confidence > self.primary && result.secondary_confidence > self.secondary
    }
}

/// How one backend attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Detected,
    NoFace,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub backend_id: String,
    pub status: AttemptStatus,
}

/// Everything the cascade collected for one frame.
#[derive(Debug, Clone, Default)]
pub struct CascadeOutcome {
    /// Detections in the order their backends were tried.
    pub candidates: Vec<FrameResult>,
    pub attempts: Vec<AttemptRecord>,
    pub stopped_early: bool,
}

impl CascadeOutcome {
    /// Candidate with the highest `primary × secondary`; the earlier backend
    /// wins on equal weight.
    pub fn best(&self) -> Option<&FrameResult> {
        self.best_index().map(|i| &self.candidates[i])
    }

    pub fn into_best(mut self) -> Option<FrameResult> {
        let idx = self.best_index()?;
        Some(self.candidates.swap_remove(idx))
    }

    fn best_index(&self) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (i, candidate) in self.candidates.iter().enumerate() {
            let weight = candidate.weight();
            if best.map_or(true, |(_, w)| weight > w) {
                best = Some((i, weight));
            }
        }
        best.map(|(i, _)| i)
    }
}

/// Priority-ordered list of backends plus the gates and timeout that drive it.
pub struct DetectorCascade {
    backends: Vec<Arc<dyn DetectorBackend>>,
    labels: LabelSet,
    thresholds: CascadeThresholds,
    timeout: Duration,
}

impl DetectorCascade {
    /// `backends` must be ordered most-accurate first.
    pub fn new(backends: Vec<Arc<dyn DetectorBackend>>, labels: LabelSet) -> Self {
        Self {
            backends,
            labels,
            thresholds: CascadeThresholds::default(),
            timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub fn with_thresholds(mut self, thresholds: CascadeThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn thresholds(&self) -> CascadeThresholds {
        self.thresholds
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id().to_string()).collect()
    }

    /// Try each backend on `frame` until one clears both gates or all are exhausted.
    ///
    /// Never fails: a frame where every backend fails yields an outcome with no
    /// candidates.
    pub async fn run(&self, frame: &Frame) -> CascadeOutcome {
        let mut outcome = CascadeOutcome::default();

        for backend in &self.backends {
            let backend_id = backend.id();
            let started = Instant::now();
            let attempt = tokio::time::timeout(self.timeout, backend.analyze(frame)).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let detected = match attempt {
                Ok(Ok(detection)) => {
                    FrameResult::from_detection(frame.index, backend_id, detection, &self.labels)
                }
                Ok(Err(failure)) => Err(failure),
                Err(_) => {
                    tracing::warn!(
                        frame = frame.index,
                        backend = backend_id,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "backend timed out"
                    );
                    outcome.attempts.push(AttemptRecord {
                        backend_id: backend_id.to_string(),
                        status: AttemptStatus::TimedOut,
                    });
                    continue;
                }
            };

            let status = match detected {
                Ok(result) => {
                    tracing::debug!(
                        frame = frame.index,
                        backend = backend_id,
                        label = %result.label,
                        primary = result.primary_confidence,
                        secondary = result.secondary_confidence,
                        elapsed_ms,
                        "backend detection"
                    );
                    let accepted = self.thresholds.accepts(&result);
                    outcome.candidates.push(result);
                    outcome.attempts.push(AttemptRecord {
                        backend_id: backend_id.to_string(),
                        status: AttemptStatus::Detected,
                    });
                    if accepted {
                        outcome.stopped_early = true;
                        break;
                    }
                    continue;
                }
                Err(DetectFailure::NoFaceDetected) => {
                    tracing::debug!(frame = frame.index, backend = backend_id, elapsed_ms, "no face detected");
                    AttemptStatus::NoFace
                }
                Err(DetectFailure::Backend(cause)) => {
                    tracing::warn!(
                        frame = frame.index,
                        backend = backend_id,
                        elapsed_ms,
                        error = %cause,
                        "backend failed"
                    );
                    AttemptStatus::Failed
                }
            };
            outcome.attempts.push(AttemptRecord {
                backend_id: backend_id.to_string(),
                status,
            });
        }

        outcome
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted backends shared by the core's tests.

    use super::*;
    use crate::backend::Detection;
    use crate::types::Auxiliary;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub enum Script {
        Detect { label: &'static str, primary: f32, face: Option<f32> },
        NoFace,
        Fail,
        Hang,
    }

    pub struct ScriptedBackend {
        pub id: &'static str,
        pub script: Script,
        pub calls: AtomicUsize,
    }

    impl ScriptedBackend {
        pub fn detect(id: &'static str, label: &'static str, primary: f32, face: f32) -> Arc<Self> {
            Self::new(id, Script::Detect { label, primary, face: Some(face) })
        }

        pub fn new(id: &'static str, script: Script) -> Arc<Self> {
            Arc::new(Self { id, script, calls: AtomicUsize::new(0) })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DetectorBackend for ScriptedBackend {
        fn id(&self) -> &str {
            self.id
        }

        async fn analyze(&self, _frame: &Frame) -> Result<Detection, DetectFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Detect { label, primary, face } => {
                    // Two-label distribution with the remainder on the other label.
                    let other = if *label == "man" { "woman" } else { "man" };
                    Ok(Detection {
                        scores: [(label.to_string(), *primary), (other.to_string(), 1.0 - primary)]
                            .into_iter()
                            .collect(),
                        face_confidence: *face,
                        auxiliary: Auxiliary::default(),
                    })
                }
                Script::NoFace => Err(DetectFailure::NoFaceDetected),
                Script::Fail => Err(DetectFailure::Backend("model crashed".into())),
                Script::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    pub fn blank_frame(index: usize) -> Frame {
        Frame::new(index, image::RgbImage::new(4, 4))
    }

    pub fn as_backends(list: &[Arc<ScriptedBackend>]) -> Vec<Arc<dyn DetectorBackend>> {
        list.iter().map(|b| Arc::clone(b) as Arc<dyn DetectorBackend>).collect()
    }
}
