//! The detector backend capability.
//!
//! A backend is one strategy for turning a frame into a face-attribute
//! label distribution. Backends are injected into a
//! [`DetectorCascade`](crate::cascade::DetectorCascade) as an ordered list.

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::frame::Frame;
use crate::types::Auxiliary;

/// Raw output of a backend, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// Label name → score. Either probabilities or percentages; need not sum to 1.
    pub scores: BTreeMap<String, f32>,
    /// Face-localization confidence, if the backend has one.
    pub face_confidence: Option<f32>,
    pub auxiliary: Auxiliary,
}

/// Why a backend produced no detection for a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectFailure {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("backend error: {0}")]
    Backend(String),
}

/// A face-attribute detection strategy.
///
/// Implementations must be cancel-safe: the cascade drops the returned future
/// when the backend times out, and any scratch resources must be released then.
#[async_trait]
pub trait DetectorBackend: Send + Sync {
    /// Identifier reported as the backend that produced a result.
    fn id(&self) -> &str;

    async fn analyze(&self, frame: &Frame) -> Result<Detection, DetectFailure>;
}
