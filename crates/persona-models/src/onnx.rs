//! Cascade backends built on the ONNX models.
//!
//! Inference is CPU-bound and runs on the blocking pool. If the cascade's
//! timeout fires, the awaiting future is dropped but an inference already
//! in flight finishes in the background and its result is discarded.

use async_trait::async_trait;
use std::sync::Arc;

use persona_core::backend::{DetectFailure, Detection, DetectorBackend};
use persona_core::frame::Frame;

use crate::genderage::{CropRegion, GenderAgeModel, FACE_CROP_MARGIN};
use crate::scrfd::ScrfdDetector;
use crate::ModelError;

fn backend_error(err: ModelError) -> DetectFailure {
    DetectFailure::Backend(err.to_string())
}

/// SCRFD face detection followed by gender/age on the most confident face.
pub struct FaceAttributeBackend {
    id: String,
    detector: Arc<ScrfdDetector>,
    attributes: Arc<GenderAgeModel>,
}

impl FaceAttributeBackend {
    pub fn new(id: impl Into<String>, detector: Arc<ScrfdDetector>, attributes: Arc<GenderAgeModel>) -> Self {
        Self { id: id.into(), detector, attributes }
    }
}

#[async_trait]
impl DetectorBackend for FaceAttributeBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, frame: &Frame) -> Result<Detection, DetectFailure> {
        let image = Arc::clone(&frame.image);
        let detector = Arc::clone(&self.detector);
        let attributes = Arc::clone(&self.attributes);

        tokio::task::spawn_blocking(move || {
            let faces = detector.detect(&image).map_err(backend_error)?;
            let face = faces.into_iter().next().ok_or(DetectFailure::NoFaceDetected)?;
            tracing::trace!(confidence = face.confidence, width = face.width, height = face.height, "face box");

            let region = CropRegion::around_face(&face, FACE_CROP_MARGIN);
            let attrs = attributes.predict(&image, region).map_err(backend_error)?;
            Ok(attrs.into_detection(Some(face.confidence)))
        })
        .await
        .map_err(|e| DetectFailure::Backend(format!("inference task: {e}")))?
    }
}

/// Gender/age on the whole frame with no face localisation. Last-resort
/// fallback: it never reports a missing face.
pub struct WholeFrameBackend {
    id: String,
    attributes: Arc<GenderAgeModel>,
    /// Reported as the face confidence; `None` lets the default of 1.0 apply.
    quality: Option<f32>,
}

impl WholeFrameBackend {
    pub fn new(id: impl Into<String>, attributes: Arc<GenderAgeModel>) -> Self {
        Self { id: id.into(), attributes, quality: None }
    }

    pub fn with_quality(mut self, quality: Option<f32>) -> Self {
        self.quality = quality;
        self
    }
}

#[async_trait]
impl DetectorBackend for WholeFrameBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, frame: &Frame) -> Result<Detection, DetectFailure> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(DetectFailure::NoFaceDetected);
        }
        let image = Arc::clone(&frame.image);
        let attributes = Arc::clone(&self.attributes);
        let quality = self.quality;

        tokio::task::spawn_blocking(move || {
            let region = CropRegion::whole_frame(&image);
            let attrs = attributes.predict(&image, region).map_err(backend_error)?;
            Ok(attrs.into_detection(quality))
        })
        .await
        .map_err(|e| DetectFailure::Backend(format!("inference task: {e}")))?
    }
}
