use crate::types::DetectedFace;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Face detector + embedder.
///
/// Returns every face found in `image`, possibly none. Implementations are
/// not retried by callers.
pub trait EmbeddingProvider {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ProviderError>;
}

impl<T: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<T> {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ProviderError> {
        (**self).detect(image)
    }
}
