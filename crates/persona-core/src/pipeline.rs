//! Concurrent multi-frame analysis.
//!
//! One task per frame, bounded by a semaphore, joined before a single-threaded
//! reduction. Dropping the future returned by [`Pipeline::run`] aborts every
//! in-flight frame task.

use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::aggregate::{self, AggregationError, AggregationResult};
use crate::analyzer::FrameAnalyzer;
use crate::certainty::CertaintyClassifier;
use crate::frame::{DecodeError, Frame};
use crate::types::{FrameResult, LabelSet};

pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_MAX_FRAMES: usize = 32;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no frames received")]
    NoFrames,
    #[error("too many frames: {count} (limit {limit})")]
    TooManyFrames { count: usize, limit: usize },
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error("frame worker pool closed")]
    WorkersClosed,
}

impl PipelineError {
    /// Whether the caller's input is at fault (as opposed to the service).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, PipelineError::WorkersClosed)
    }

    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            PipelineError::Aggregation(e) => Some(e.suggestion()),
            _ => None,
        }
    }
}

/// The fused decision plus the observations that produced it.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub aggregation: AggregationResult,
    /// Ordered by frame index, then by cascade order within a frame.
    pub observations: Vec<FrameResult>,
}

impl PipelineOutcome {
    /// The single highest-weight observation; earliest wins on equal weight.
    pub fn best_observation(&self) -> Option<&FrameResult> {
        let mut best: Option<&FrameResult> = None;
        for obs in &self.observations {
            if best.map_or(true, |b| obs.weight() > b.weight()) {
                best = Some(obs);
            }
        }
        best
    }
}

#[derive(Clone)]
pub struct Pipeline {
    analyzer: Arc<FrameAnalyzer>,
    classifier: CertaintyClassifier,
    max_workers: usize,
    max_frames: usize,
}

impl Pipeline {
    pub fn new(analyzer: FrameAnalyzer) -> Self {
        Self {
            analyzer: Arc::new(analyzer),
            classifier: CertaintyClassifier::default(),
            max_workers: DEFAULT_MAX_WORKERS,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }

    pub fn with_classifier(mut self, classifier: CertaintyClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames.max(1);
        self
    }

    pub fn analyzer(&self) -> &FrameAnalyzer {
        &self.analyzer
    }

    pub fn labels(&self) -> &LabelSet {
        self.analyzer.cascade().labels()
    }

    pub fn classifier(&self) -> &CertaintyClassifier {
        &self.classifier
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Analyze every frame and fuse the results.
    ///
    /// Frames that failed to decode are dropped but still count as provided.
    /// Only a request with no frames, too many frames, or no usable detection
    /// at all is an error.
    pub async fn run(
        &self,
        frames: Vec<Result<Frame, DecodeError>>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let provided = frames.len();
        if provided == 0 {
            return Err(PipelineError::NoFrames);
        }
        if provided > self.max_frames {
            return Err(PipelineError::TooManyFrames {
                count: provided,
                limit: self.max_frames,
            });
        }

        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();

        for input in frames {
            let frame = match input {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(frame = e.index, error = %e.source, "dropping undecodable frame");
                    continue;
                }
            };
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|_| PipelineError::WorkersClosed)?;
            let analyzer = Arc::clone(&self.analyzer);
            tasks.spawn(async move {
                let results = analyzer.analyze(frame).await;
                drop(permit);
                results
            });
        }

        let mut observations = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(results) => observations.extend(results),
                Err(e) => tracing::error!(error = %e, "frame task failed; frame dropped"),
            }
        }
        // Completion order is arbitrary; the sort is stable so cascade order
        // within a frame is kept.
        observations.sort_by_key(|r| r.frame_index);

        let aggregation =
            aggregate::combine(self.labels(), &observations, provided, &self.classifier)?;

        tracing::info!(
            label = %aggregation.final_label,
            confidence = aggregation.final_confidence,
            certainty = %aggregation.certainty_band,
            frames = provided,
            detections = aggregation.frames_with_detection,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregated decision"
        );

        Ok(PipelineOutcome {
            aggregation,
            observations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DetectFailure, Detection, DetectorBackend};
    use crate::cascade::testing::*;
    use crate::cascade::DetectorCascade;
    use crate::certainty::CertaintyBand;
    use crate::types::{Auxiliary, Label};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pipeline(backends: &[Arc<ScriptedBackend>]) -> Pipeline {
        Pipeline::new(FrameAnalyzer::new(DetectorCascade::new(
            as_backends(backends),
            LabelSet::default(),
        )))
    }

    fn frames(n: usize) -> Vec<Result<Frame, DecodeError>> {
        (0..n).map(|i| Ok(blank_frame(i))).collect()
    }

    /// Reports a fixed verdict per frame index and tracks peak concurrency.
    struct PerFrameBackend {
        verdicts: Vec<(&'static str, f32, f32)>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl DetectorBackend for PerFrameBackend {
        fn id(&self) -> &str {
            "per-frame"
        }

        async fn analyze(&self, frame: &Frame) -> Result<Detection, DetectFailure> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let Some(&(label, primary, face)) = self.verdicts.get(frame.index) else {
                return Err(DetectFailure::NoFaceDetected);
            };
            Ok(Detection {
                scores: [(label.to_string(), primary)].into_iter().collect(),
                face_confidence: Some(face),
                auxiliary: Auxiliary::default(),
            })
        }
    }

    fn per_frame(verdicts: Vec<(&'static str, f32, f32)>) -> Arc<PerFrameBackend> {
        Arc::new(PerFrameBackend {
            verdicts,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn per_frame_pipeline(backend: &Arc<PerFrameBackend>) -> Pipeline {
        let backends: Vec<Arc<dyn DetectorBackend>> = vec![Arc::clone(backend) as Arc<dyn DetectorBackend>];
        Pipeline::new(FrameAnalyzer::new(DetectorCascade::new(backends, LabelSet::default())))
    }

    #[tokio::test]
    async fn test_three_frames_fuse_into_high_certainty() {
        let backend = per_frame(vec![("man", 0.95, 0.95), ("man", 0.85, 0.90), ("woman", 0.60, 0.50)]);
        let outcome = per_frame_pipeline(&backend).run(frames(3)).await.unwrap();

        let agg = &outcome.aggregation;
        assert_eq!(agg.final_label.as_str(), "man");
        assert!((agg.per_label_score[&Label::new("man")] - 0.8475).abs() < 1e-3);
        assert_eq!(agg.certainty_band, CertaintyBand::High);
        assert_eq!(agg.frames_with_detection, 3);
        let indices: Vec<_> = outcome.observations.iter().map(|o| o.frame_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_all_backends_without_face_is_client_error() {
        let backends = [ScriptedBackend::new("a", Script::NoFace), ScriptedBackend::new("b", Script::NoFace)];
        let err = pipeline(&backends).run(frames(1)).await.unwrap_err();

        assert!(matches!(err, PipelineError::Aggregation(AggregationError::Empty)));
        assert!(err.is_client_error());
        assert!(err.suggestion().is_some());
    }

    #[tokio::test]
    async fn test_empty_request_rejected() {
        let backends = [ScriptedBackend::detect("a", "man", 0.9, 0.9)];
        let err = pipeline(&backends).run(Vec::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoFrames));
        assert_eq!(backends[0].calls(), 0);
    }

    #[tokio::test]
    async fn test_too_many_frames_rejected() {
        let backends = [ScriptedBackend::detect("a", "man", 0.9, 0.9)];
        let err = pipeline(&backends).with_max_frames(2).run(frames(3)).await.unwrap_err();
        assert!(matches!(err, PipelineError::TooManyFrames { count: 3, limit: 2 }));
    }

    #[tokio::test]
    async fn test_undecodable_frames_are_dropped_but_counted() {
        let backends = [ScriptedBackend::detect("a", "woman", 0.9, 0.95)];
        let mut input = frames(2);
        input.push(Frame::decode(2, b"garbage"));

        let outcome = pipeline(&backends).run(input).await.unwrap();

        assert_eq!(outcome.aggregation.frames_provided, 3);
        assert_eq!(outcome.aggregation.frames_with_detection, 2);
        assert_eq!(backends[0].calls(), 2);
    }

    #[tokio::test]
    async fn test_frames_without_detection_contribute_nothing() {
        // Frame 1 has no scripted verdict and reports no face.
        let backend = per_frame(vec![("woman", 0.9, 0.9)]);
        let outcome = per_frame_pipeline(&backend).run(frames(2)).await.unwrap();

        assert_eq!(outcome.aggregation.frames_provided, 2);
        assert_eq!(outcome.aggregation.frames_with_detection, 1);
        assert_eq!(outcome.aggregation.final_confidence, 1.0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let backend = per_frame(vec![("man", 0.9, 0.95); 12]);
        let outcome = per_frame_pipeline(&backend)
            .with_max_workers(3)
            .run(frames(12))
            .await
            .unwrap();

        assert_eq!(outcome.observations.len(), 12);
        let peak = backend.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak}");
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn test_reordered_frames_give_same_decision() {
        let verdicts = vec![("man", 0.91, 0.77), ("woman", 0.64, 0.93), ("woman", 0.83, 0.72)];
        let mut reversed = verdicts.clone();
        reversed.reverse();

        let a = per_frame_pipeline(&per_frame(verdicts)).run(frames(3)).await.unwrap();
        let b = per_frame_pipeline(&per_frame(reversed)).run(frames(3)).await.unwrap();

        assert_eq!(a.aggregation.final_label, b.aggregation.final_label);
        assert_eq!(a.aggregation.per_label_score, b.aggregation.per_label_score);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_run_cancels_frame_tasks() {
        let hang = ScriptedBackend::new("hang", Script::Hang);
        let p = pipeline(&[hang.clone()]);

        let run = p.run(frames(2));
        let timed_out = tokio::time::timeout(Duration::from_millis(100), run).await;

        assert!(timed_out.is_err());
        // Both frames got as far as the backend before the request was abandoned.
        assert_eq!(hang.calls(), 2);
        // The aborted tasks released their references to the shared analyzer.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(Arc::strong_count(&p.analyzer), 1);
    }

    #[tokio::test]
    async fn test_best_observation() {
        let backends = [
            ScriptedBackend::detect("a", "man", 0.70, 0.80),
            ScriptedBackend::detect("b", "woman", 0.80, 0.85),
        ];
        let outcome = pipeline(&backends).run(frames(1)).await.unwrap();
        assert_eq!(outcome.best_observation().unwrap().backend_id, "b");
    }
}
