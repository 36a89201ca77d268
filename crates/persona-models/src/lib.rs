//! persona-models: detector backends for the persona cascade.
//!
//! ONNX backends (SCRFD face detection + InsightFace gender/age) and a
//! command backend for external classifiers, assembled from a declarative
//! [`BackendConfig`] list.

pub mod command;
pub mod genderage;
pub mod onnx;
pub mod registry;
pub mod scrfd;

use thiserror::Error;

pub use command::CommandBackend;
pub use genderage::GenderAgeModel;
pub use onnx::{FaceAttributeBackend, WholeFrameBackend};
pub use registry::{build_backends, BackendConfig, ModelSet};
pub use scrfd::ScrfdDetector;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0} (download it from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid backend configuration: {0}")]
    InvalidConfig(String),
    #[error("model session lock poisoned")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}
