use crate::types::Embedding;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Opaque boundary around the face model: grayscale frame in, embedding out.
///
/// `Ok(None)` means no face was found in the frame. That is a normal
/// non-match, not an error.
pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, frame: &[u8], width: u32, height: u32) -> Result<Option<Embedding>, EmbedError>;
}
