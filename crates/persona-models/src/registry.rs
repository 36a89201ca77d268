//! Declarative backend configuration → cascade backends.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use persona_core::backend::DetectorBackend;

use crate::command::CommandBackend;
use crate::genderage::{GenderAgeModel, DEFAULT_ATTRIBUTE_LABELS};
use crate::onnx::{FaceAttributeBackend, WholeFrameBackend};
use crate::scrfd::{ScrfdDetector, SCRFD_DEFAULT_INPUT_SIZE, SCRFD_DEFAULT_SCORE_THRESHOLD};
use crate::ModelError;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const ATTRIBUTE_MODEL_FILE: &str = "genderage.onnx";

fn default_input_size() -> usize {
    SCRFD_DEFAULT_INPUT_SIZE
}

fn default_score_threshold() -> f32 {
    SCRFD_DEFAULT_SCORE_THRESHOLD
}

/// One cascade entry, in priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Scrfd {
        id: String,
        #[serde(default = "default_input_size")]
        input_size: usize,
        #[serde(default = "default_score_threshold")]
        score_threshold: f32,
    },
    WholeFrame {
        id: String,
        #[serde(default)]
        quality: Option<f32>,
    },
    Command {
        id: String,
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl BackendConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::Scrfd { id, .. } | Self::WholeFrame { id, .. } | Self::Command { id, .. } => id,
        }
    }

    fn needs_attribute_model(&self) -> bool {
        !matches!(self, Self::Command { .. })
    }

    /// Full-resolution detector, then a coarser one for small or blurry
    /// faces, then the whole-frame fallback.
    pub fn default_cascade() -> Vec<Self> {
        vec![
            Self::Scrfd {
                id: "scrfd-640".into(),
                input_size: 640,
                score_threshold: SCRFD_DEFAULT_SCORE_THRESHOLD,
            },
            Self::Scrfd {
                id: "scrfd-320".into(),
                input_size: 320,
                score_threshold: SCRFD_DEFAULT_SCORE_THRESHOLD,
            },
            Self::WholeFrame { id: "whole-frame".into(), quality: None },
        ]
    }
}

/// Where the ONNX models live and how attribute outputs are named.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSet {
    pub detector: PathBuf,
    pub attributes: PathBuf,
    pub attribute_labels: [String; 2],
}

impl ModelSet {
    pub fn in_dir(model_dir: &Path) -> Self {
        Self {
            detector: model_dir.join(DETECTOR_MODEL_FILE),
            attributes: model_dir.join(ATTRIBUTE_MODEL_FILE),
            attribute_labels: DEFAULT_ATTRIBUTE_LABELS.map(str::to_string),
        }
    }

    pub fn with_attribute_labels(mut self, labels: [String; 2]) -> Self {
        self.attribute_labels = labels;
        self
    }
}

/// Instantiate backends in declaration order. The attribute model is loaded
/// once and shared; each SCRFD entry gets its own session.
pub fn build_backends(
    entries: &[BackendConfig],
    models: &ModelSet,
) -> Result<Vec<Arc<dyn DetectorBackend>>, ModelError> {
    if entries.is_empty() {
        return Err(ModelError::InvalidConfig("no backends configured".into()));
    }
    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert(entry.id()) {
            return Err(ModelError::InvalidConfig(format!("duplicate backend id: {}", entry.id())));
        }
    }

    let attributes = if entries.iter().any(BackendConfig::needs_attribute_model) {
        Some(Arc::new(GenderAgeModel::load(&models.attributes, models.attribute_labels.clone())?))
    } else {
        None
    };
    let shared_attributes = || {
        attributes
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| ModelError::InvalidConfig("attribute model not loaded".into()))
    };

    let mut backends: Vec<Arc<dyn DetectorBackend>> = Vec::with_capacity(entries.len());
    for entry in entries {
        let backend: Arc<dyn DetectorBackend> = match entry {
            BackendConfig::Scrfd { id, input_size, score_threshold } => {
                let detector = ScrfdDetector::load(&models.detector, *input_size, *score_threshold)?;
                Arc::new(FaceAttributeBackend::new(id.clone(), Arc::new(detector), shared_attributes()?))
            }
            BackendConfig::WholeFrame { id, quality } => {
                Arc::new(WholeFrameBackend::new(id.clone(), shared_attributes()?).with_quality(*quality))
            }
            BackendConfig::Command { id, program, args } => {
                Arc::new(CommandBackend::new(id.clone(), program.clone(), args.clone()))
            }
        };
        tracing::info!(backend = entry.id(), "backend ready");
        backends.push(backend);
    }

    Ok(backends)
}
