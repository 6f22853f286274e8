//! ArcFace face recognizer via ONNX Runtime.
//!
//! Crops the detected face to a square, resizes to 112x112 and extracts a
//! 512-dimensional L2-normalized embedding with the w600k_r50 model.

use crate::detector::FaceBox;
use crate::ModelError;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollgate_core::Embedding;
use std::path::Path;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";
/// Margin added around the detector box before cropping.
const CROP_MARGIN: f32 = 0.15;

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &str) -> Result<Self, ModelError> {
        if !Path::new(model_path).exists() {
            return Err(ModelError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded ArcFace recognizer");
        Ok(Self { session })
    }

    pub fn extract(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &FaceBox,
    ) -> Result<Embedding, ModelError> {
        let crop = crop_face(frame, width, height, face)?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ModelError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// Square crop around the face (plus margin), resized to the model input.
fn crop_face(frame: &[u8], width: u32, height: u32, face: &FaceBox) -> Result<GrayImage, ModelError> {
    let img = GrayImage::from_raw(width, height, frame.to_vec()).ok_or_else(|| {
        ModelError::InvalidFrame(format!("{} bytes is not a {width}x{height} frame", frame.len()))
    })?;

    let side = face.width.max(face.height) * (1.0 + 2.0 * CROP_MARGIN);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    let x0 = (cx - side / 2.0).max(0.0) as u32;
    let y0 = (cy - side / 2.0).max(0.0) as u32;
    let w = (side as u32).min(width.saturating_sub(x0)).max(1);
    let h = (side as u32).min(height.saturating_sub(y0)).max(1);

    let cropped = imageops::crop_imm(&img, x0, y0, w, h).to_image();
    Ok(imageops::resize(
        &cropped,
        ARCFACE_INPUT_SIZE,
        ARCFACE_INPUT_SIZE,
        FilterType::Triangle,
    ))
}

/// 112x112 grayscale crop → NCHW float tensor, gray replicated to RGB.
fn preprocess(face: &GrayImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        let normalized = (pixel.0[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = normalized;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
