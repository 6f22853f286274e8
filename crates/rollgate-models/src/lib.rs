//! rollgate-models: ONNX face embedder for the attendance station.
//!
//! UltraFace finds the face, ArcFace turns it into an embedding. Both
//! sessions sit behind mutexes so one `OnnxEmbedder` can be shared across
//! blocking worker threads.

pub mod detector;
pub mod recognizer;

use detector::FaceDetector;
use recognizer::FaceRecognizer;
use rollgate_core::{EmbedError, Embedding, FaceEmbedder};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "version-RFB-320.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<ModelError> for EmbedError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::ModelNotFound(p) => EmbedError::ModelNotLoaded(p),
            ModelError::InvalidFrame(m) => EmbedError::InvalidFrame(m),
            other => EmbedError::InferenceFailed(other.to_string()),
        }
    }
}

/// Default model directory: `$XDG_DATA_HOME/rollgate/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollgate/models")
}

pub struct OnnxEmbedder {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxEmbedder {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, ModelError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE).to_string_lossy())?;
        let recognizer =
            FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE).to_string_lossy())?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed(&self, frame: &[u8], width: u32, height: u32) -> Result<Option<Embedding>, EmbedError> {
        let face = {
            let mut detector = self
                .detector
                .lock()
                .map_err(|_| EmbedError::InferenceFailed("detector lock poisoned".into()))?;
            detector.detect(frame, width, height)?
        };
        let Some(face) = face else {
            return Ok(None);
        };

        let mut recognizer = self
            .recognizer
            .lock()
            .map_err(|_| EmbedError::InferenceFailed("recognizer lock poisoned".into()))?;
        let embedding = recognizer.extract(frame, width, height, &face)?;
        tracing::trace!(confidence = face.confidence, "face embedded");
        Ok(Some(embedding))
    }
}
