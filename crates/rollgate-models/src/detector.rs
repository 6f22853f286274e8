//! UltraFace (RFB-320) face detector via ONNX Runtime.
//!
//! The model takes a 320x240 RGB image and emits one `[bg, face]` score
//! pair and one normalized `[x1, y1, x2, y2]` box per prior. Priors are
//! decoded inside the exported graph, so no anchor math is needed here.

use crate::ModelError;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ULTRAFACE_INPUT_WIDTH: u32 = 320;
const ULTRAFACE_INPUT_HEIGHT: u32 = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const ULTRAFACE_CONFIDENCE_THRESHOLD: f32 = 0.7;

/// A detected face in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

pub struct FaceDetector {
    session: Session,
}

impl FaceDetector {
    pub fn load(model_path: &str) -> Result<Self, ModelError> {
        if !Path::new(model_path).exists() {
            return Err(ModelError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        if session.outputs().len() < 2 {
            return Err(ModelError::InferenceFailed(format!(
                "UltraFace model requires 2 outputs (scores, boxes), got {}",
                session.outputs().len()
            )));
        }

        tracing::info!(path = model_path, "loaded UltraFace detector");
        Ok(Self { session })
    }

    /// Detect the most confident face in a grayscale frame.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FaceBox>, ModelError> {
        let input = preprocess(frame, width, height)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("boxes: {e}")))?;

        Ok(best_face(
            scores,
            boxes,
            width,
            height,
            ULTRAFACE_CONFIDENCE_THRESHOLD,
        ))
    }
}

/// Resize the grayscale frame to the model input and replicate into 3 channels.
fn preprocess(frame: &[u8], width: u32, height: u32) -> Result<Array4<f32>, ModelError> {
    let img = GrayImage::from_raw(width, height, frame.to_vec()).ok_or_else(|| {
        ModelError::InvalidFrame(format!("{} bytes is not a {width}x{height} frame", frame.len()))
    })?;
    let resized = imageops::resize(
        &img,
        ULTRAFACE_INPUT_WIDTH,
        ULTRAFACE_INPUT_HEIGHT,
        FilterType::Triangle,
    );

    let h = ULTRAFACE_INPUT_HEIGHT as usize;
    let w = ULTRAFACE_INPUT_WIDTH as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let normalized = (pixel.0[0] as f32 - ULTRAFACE_MEAN) / ULTRAFACE_STD;
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = normalized;
        }
    }
    Ok(tensor)
}

/// Pick the highest-scoring face above `threshold` and map it to frame pixels.
fn best_face(
    scores: &[f32],
    boxes: &[f32],
    width: u32,
    height: u32,
    threshold: f32,
) -> Option<FaceBox> {
    let priors = (scores.len() / 2).min(boxes.len() / 4);
    let mut best: Option<FaceBox> = None;

    for i in 0..priors {
        let confidence = scores[i * 2 + 1];
        if confidence <= threshold {
            continue;
        }
        if best.is_some_and(|b| b.confidence >= confidence) {
            continue;
        }

        let x1 = boxes[i * 4].clamp(0.0, 1.0) * width as f32;
        let y1 = boxes[i * 4 + 1].clamp(0.0, 1.0) * height as f32;
        let x2 = boxes[i * 4 + 2].clamp(0.0, 1.0) * width as f32;
        let y2 = boxes[i * 4 + 3].clamp(0.0, 1.0) * height as f32;
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        best = Some(FaceBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence,
        });
    }

    best
}
