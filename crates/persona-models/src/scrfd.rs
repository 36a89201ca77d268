//! SCRFD face localisation over RGB frames.
//!
//! The frame is letterboxed into a square input, each of the three stride
//! heads is decoded against its anchor grid, and overlapping boxes are merged
//! greedily. Keypoint heads, when the export has them, are ignored.

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

use crate::ModelError;

pub const SCRFD_DEFAULT_INPUT_SIZE: usize = 640;
pub const SCRFD_DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
/// Boxes overlapping a kept box by more than this IoU are discarded.
const SCRFD_MAX_OVERLAP: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// Score + bbox heads for three strides.
const SCRFD_MIN_OUTPUTS: usize = 6;

/// Face box in original frame coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self { x: x1, y: y1, width: x2 - x1, height: y2 - y1, confidence }
    }

    fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union; 0 for degenerate boxes.
    fn iou(&self, other: &BoundingBox) -> f32 {
        let overlap_w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let overlap_h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        let inter = overlap_w.max(0.0) * overlap_h.max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }
}

/// How the frame was placed inside the square model input.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxInfo {
    /// Model-input coordinates back to frame coordinates.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Mutex<Session>,
    input_size: usize,
    score_threshold: f32,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model. `input_size` must be a multiple of 32.
    pub fn load(model_path: &Path, input_size: usize, score_threshold: f32) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }
        if input_size == 0 || input_size % 32 != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "SCRFD input size must be a positive multiple of 32, got {input_size}"
            )));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            input_size,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < SCRFD_MIN_OUTPUTS {
            return Err(ModelError::InferenceFailed(format!(
                "SCRFD model requires at least {SCRFD_MIN_OUTPUTS} outputs (3 strides × score/bbox), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            input_size,
            score_threshold,
            stride_indices,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Detect faces in an RGB frame, returning boxes sorted by confidence.
    pub fn detect(&self, frame: &RgbImage) -> Result<Vec<BoundingBox>, ModelError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = preprocess(frame, self.input_size);

        let mut session = self.session.lock().map_err(|_| ModelError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in SCRFD_STRIDES.iter().zip(&self.stride_indices) {
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InferenceFailed(format!("score head, stride {stride}: {e}")))?;
            let (_, distances) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InferenceFailed(format!("bbox head, stride {stride}: {e}")))?;

            let head = StrideHead { stride, scores, distances };
            candidates.extend(head.decode(self.input_size, &letterbox, self.score_threshold));
        }

        Ok(suppress_overlaps(candidates, SCRFD_MAX_OVERLAP))
    }
}

/// Letterbox an RGB frame into a square NCHW float tensor.
fn preprocess(frame: &RgbImage, input_size: usize) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as usize).clamp(1, input_size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, input_size);
    let pad_x = (input_size - new_w) as f32 / 2.0;
    let pad_y = (input_size - new_h) as f32 / 2.0;

    let resized = image::imageops::resize(frame, new_w as u32, new_h as u32, FilterType::Triangle);

    // Pad with SCRFD_MEAN so padding normalizes to 0.0
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));
    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    for (x, y, pixel) in resized.enumerate_pixels() {
        let ty = pad_y_start + y as usize;
        let tx = pad_x_start + x as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x: pad_x_start as f32, pad_y: pad_y_start as f32 })
}

/// Discover output tensor ordering by name.
///
/// Named exports ("score_8", "bbox_16", ...) are mapped to stride slots.
/// Otherwise falls back to the standard positional ordering, which is the
/// same for exports with and without keypoint heads:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
            );
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Raw outputs of one stride level.
struct StrideHead<'a> {
    stride: usize,
    scores: &'a [f32],
    /// Per anchor: distances from the anchor point to the left, top, right
    /// and bottom edges, in stride units.
    distances: &'a [f32],
}

impl StrideHead<'_> {
    fn decode(&self, input_size: usize, letterbox: &LetterboxInfo, threshold: f32) -> Vec<BoundingBox> {
        let cells_per_row = input_size / self.stride;
        let anchors = cells_per_row * cells_per_row * SCRFD_ANCHORS_PER_CELL;
        let step = self.stride as f32;

        self.scores
            .iter()
            .take(anchors)
            .enumerate()
            .filter(|&(_, &score)| score > threshold)
            .filter_map(|(anchor, &score)| {
                let d = self.distances.get(anchor * 4..anchor * 4 + 4)?;
                let cell = anchor / SCRFD_ANCHORS_PER_CELL;
                let cx = (cell % cells_per_row) as f32 * step;
                let cy = (cell / cells_per_row) as f32 * step;

                let (x1, y1) = letterbox.to_frame(cx - d[0] * step, cy - d[1] * step);
                let (x2, y2) = letterbox.to_frame(cx + d[2] * step, cy + d[3] * step);
                Some(BoundingBox::from_corners(x1, y1, x2, y2, score))
            })
            .collect()
    }
}

/// Greedy non-maximum suppression. The result is ordered by confidence,
/// highest first.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, max_overlap: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= max_overlap) {
            kept.push(candidate);
        }
    }
    kept
}
