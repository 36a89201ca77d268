use anyhow::Context;
use persona_core::report::{DecisionReport, ErrorReport, SingleReport};
use persona_core::{
    AggregationError, CascadeThresholds, CertaintyClassifier, DetectorCascade, Frame, FrameAnalyzer,
    LabelSet, Passthrough, Pipeline, PipelineError, Preprocessor, Resize,
};
use persona_models::{build_backends, ModelSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("analysis timed out after {0:?}")]
    TimedOut(Duration),
    #[error("frame decoding task failed: {0}")]
    Decode(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Whether the request itself was at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, EngineError::Pipeline(e) if e.is_client_error())
    }

    pub fn report(&self) -> ErrorReport {
        match self {
            EngineError::Pipeline(e) => ErrorReport::from(e),
            other => ErrorReport {
                error: other.to_string(),
                suggestion: None,
            },
        }
    }
}

/// Request front-end over the analysis pipeline: decodes raw frame bytes,
/// bounds each request by a deadline, and shapes the reports.
pub struct Engine {
    pipeline: Pipeline,
    request_timeout: Duration,
}

impl Engine {
    pub fn new(pipeline: Pipeline, request_timeout: Duration) -> Self {
        Self { pipeline, request_timeout }
    }

    /// Load models and assemble the pipeline. Fails fast if any backend is
    /// unavailable.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let labels = LabelSet::new(&config.labels).context("invalid label set")?;
        let models = ModelSet::in_dir(&config.model_dir).with_attribute_labels(config.attribute_labels.clone());
        let backends = build_backends(&config.backends, &models).context("failed to build detector backends")?;

        let cascade = DetectorCascade::new(backends, labels)
            .with_thresholds(CascadeThresholds {
                primary: config.primary_threshold,
                secondary: config.secondary_threshold,
            })
            .with_timeout(config.backend_timeout);

        let preprocessor: Arc<dyn Preprocessor> = if config.resize > 0 {
            Arc::new(Resize::square(config.resize))
        } else {
            Arc::new(Passthrough)
        };
        let analyzer = FrameAnalyzer::new(cascade)
            .with_preprocessor(preprocessor)
            .with_policy(config.candidate_policy);

        let classifier = CertaintyClassifier::new(config.certainty).context("invalid certainty thresholds")?;
        let pipeline = Pipeline::new(analyzer)
            .with_classifier(classifier)
            .with_max_workers(config.max_workers)
            .with_max_frames(config.max_frames);

        Ok(Self::new(pipeline, config.request_timeout))
    }

    /// Analyze a batch of encoded frames and fuse them into one decision.
    pub async fn analyze_frames(&self, frames: Vec<Vec<u8>>) -> Result<DecisionReport, EngineError> {
        let outcome = self.run(frames).await?;
        Ok(DecisionReport::from(&outcome.aggregation))
    }

    /// Analyze one encoded frame and report the winning candidate in detail.
    pub async fn analyze_single(&self, frame: Vec<u8>) -> Result<SingleReport, EngineError> {
        let outcome = self.run(vec![frame]).await?;
        SingleReport::from_outcome(&outcome, self.pipeline.classifier())
            .ok_or(EngineError::Pipeline(PipelineError::Aggregation(AggregationError::Empty)))
    }

    async fn run(&self, frames: Vec<Vec<u8>>) -> Result<persona_core::PipelineOutcome, EngineError> {
        // Reject oversized requests before paying for decoding.
        if frames.len() > self.pipeline.max_frames() {
            return Err(PipelineError::TooManyFrames {
                count: frames.len(),
                limit: self.pipeline.max_frames(),
            }
            .into());
        }

        let work = async {
            let decoded = tokio::task::spawn_blocking(move || {
                frames
                    .iter()
                    .enumerate()
                    .map(|(index, bytes)| Frame::decode(index, bytes))
                    .collect::<Vec<_>>()
            })
            .await?;
            Ok::<_, EngineError>(self.pipeline.run(decoded).await?)
        };

        tokio::time::timeout(self.request_timeout, work)
            .await
            .map_err(|_| EngineError::TimedOut(self.request_timeout))?
    }

    pub fn status(&self) -> serde_json::Value {
        let analyzer = self.pipeline.analyzer();
        let cascade = analyzer.cascade();
        let thresholds = cascade.thresholds();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "labels": self.pipeline.labels().iter().map(|l| l.as_str()).collect::<Vec<_>>(),
            "backends": cascade.backend_ids(),
            "primary_threshold": thresholds.primary,
            "secondary_threshold": thresholds.secondary,
            "backend_timeout_ms": cascade.timeout().as_millis() as u64,
            "request_timeout_secs": self.request_timeout.as_secs(),
            "candidate_policy": analyzer.policy(),
            "max_workers": self.pipeline.max_workers(),
            "max_frames": self.pipeline.max_frames(),
        })
    }
}
