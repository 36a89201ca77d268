//! InsightFace gender/age attribute model via ONNX Runtime.
//!
//! Takes a 96×96 RGB crop centred on a face box (scaled so the box's longer
//! side plus margin fills the crop) and produces a two-way gender
//! distribution plus an age estimate.

use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use persona_core::backend::Detection;
use persona_core::types::Auxiliary;

use crate::scrfd::BoundingBox;
use crate::ModelError;

// --- Named constants ---
const GENDERAGE_INPUT_SIZE: usize = 96;
// The exported graph normalizes internally; raw pixel values go in.
const GENDERAGE_MEAN: f32 = 0.0;
const GENDERAGE_STD: f32 = 1.0;
/// Box side × margin gives the square region mapped onto the crop.
pub const FACE_CROP_MARGIN: f32 = 1.5;
/// [gender_0, gender_1, age / 100]
const GENDERAGE_OUTPUT_DIM: usize = 3;
const AGE_SCALE: f32 = 100.0;

/// Output slot → label name. The stock model emits [female, male].
pub const DEFAULT_ATTRIBUTE_LABELS: [&str; 2] = ["woman", "man"];

/// Square source region mapped onto the model's input crop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRegion {
    pub center_x: f32,
    pub center_y: f32,
    /// Side length of the square source region, in frame pixels.
    pub side: f32,
}

impl CropRegion {
    pub fn around_face(face: &BoundingBox, margin: f32) -> Self {
        Self {
            center_x: face.x + face.width / 2.0,
            center_y: face.y + face.height / 2.0,
            side: face.width.max(face.height) * margin,
        }
    }

    /// The whole frame, letterboxed into the crop.
    pub fn whole_frame(image: &RgbImage) -> Self {
        Self {
            center_x: image.width() as f32 / 2.0,
            center_y: image.height() as f32 / 2.0,
            side: image.width().max(image.height()) as f32,
        }
    }
}

/// Gender distribution and age estimate for one crop.
#[derive(Debug, Clone, PartialEq)]
pub struct Attributes {
    pub scores: BTreeMap<String, f32>,
    pub age: f32,
}

impl Attributes {
    pub fn into_detection(self, face_confidence: Option<f32>) -> Detection {
        Detection {
            scores: self.scores,
            face_confidence,
            auxiliary: Auxiliary { age: Some(self.age) },
        }
    }
}

/// Gender/age attribute model.
pub struct GenderAgeModel {
    session: Mutex<Session>,
    labels: [String; 2],
}

impl GenderAgeModel {
    /// Load the attribute ONNX model. `labels` names output slots 0 and 1.
    pub fn load(model_path: &Path, labels: [String; 2]) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            ?labels,
            "loaded gender/age model"
        );

        Ok(Self { session: Mutex::new(session), labels })
    }

    pub fn labels(&self) -> &[String; 2] {
        &self.labels
    }

    /// Predict attributes for the given region of an RGB frame.
    pub fn predict(&self, frame: &RgbImage, region: CropRegion) -> Result<Attributes, ModelError> {
        let crop = crop_region(frame, region, GENDERAGE_INPUT_SIZE);
        let input = preprocess(&crop);

        let raw: Vec<f32> = {
            let mut session = self.session.lock().map_err(|_| ModelError::Poisoned)?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InferenceFailed(format!("attribute extraction: {e}")))?;
            data.to_vec()
        };

        if raw.len() < GENDERAGE_OUTPUT_DIM {
            return Err(ModelError::InferenceFailed(format!(
                "expected {GENDERAGE_OUTPUT_DIM} attribute outputs, got {}",
                raw.len()
            )));
        }

        Ok(decode_output(&raw, &self.labels))
    }
}

/// Map raw model output onto named scores and an age in years.
fn decode_output(raw: &[f32], labels: &[String; 2]) -> Attributes {
    let [p0, p1] = to_distribution([raw[0], raw[1]]);
    let scores = [(labels[0].clone(), p0), (labels[1].clone(), p1)]
        .into_iter()
        .collect();
    Attributes {
        scores,
        age: (raw[2] * AGE_SCALE).max(0.0),
    }
}

/// Softmax the pair unless it already reads as a probability distribution.
fn to_distribution(pair: [f32; 2]) -> [f32; 2] {
    let in_unit = pair.iter().all(|v| (0.0..=1.0).contains(v));
    if in_unit && ((pair[0] + pair[1]) - 1.0).abs() < 1e-3 {
        return pair;
    }
    let max = pair[0].max(pair[1]);
    let e0 = (pair[0] - max).exp();
    let e1 = (pair[1] - max).exp();
    let sum = e0 + e1;
    [e0 / sum, e1 / sum]
}

/// Resample a square source region into an `out_size`×`out_size` crop.
///
/// Uses bilinear interpolation. Out-of-bounds pixels are filled with 0 (black).
fn crop_region(frame: &RgbImage, region: CropRegion, out_size: usize) -> RgbImage {
    let mut output = RgbImage::new(out_size as u32, out_size as u32);
    if region.side <= 0.0 || !region.side.is_finite() {
        return output;
    }
    // Source pixels per output pixel.
    let step = region.side / out_size as f32;
    let half = out_size as f32 / 2.0;
    let (src_w, src_h) = (frame.width() as i64, frame.height() as i64);

    let sample = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < src_w && y >= 0 && y < src_h {
            frame.get_pixel(x as u32, y as u32).0[c] as f32
        } else {
            0.0
        }
    };

    for (ox, oy, pixel) in output.enumerate_pixels_mut() {
        let sx = region.center_x + (ox as f32 + 0.5 - half) * step - 0.5;
        let sy = region.center_y + (oy as f32 + 0.5 - half) * step - 0.5;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        for c in 0..3 {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            pixel.0[c] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    output
}

/// RGB crop → NCHW float tensor.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = GENDERAGE_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - GENDERAGE_MEAN) / GENDERAGE_STD;
        }
    }

    tensor
}
