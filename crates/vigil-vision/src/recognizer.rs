//! ArcFace embedding extractor (insightface `w600k_r50`) via ONNX Runtime.

use crate::alignment::ALIGNED_SIZE;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;
use vigil_core::Embedding;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace model");
        Ok(Self { session })
    }

    /// Embed an aligned 112×112 RGB face crop.
    ///
    /// The raw model output is returned without normalization.
    pub fn embed(&mut self, aligned: &RgbImage) -> Result<Embedding, RecognizerError> {
        let input = preprocess(aligned)?;
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding output: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(raw.to_vec()))
    }
}

fn preprocess(aligned: &RgbImage) -> Result<Array4<f32>, RecognizerError> {
    if aligned.dimensions() != (ALIGNED_SIZE, ALIGNED_SIZE) {
        return Err(RecognizerError::InferenceFailed(format!(
            "aligned crop must be {ALIGNED_SIZE}x{ALIGNED_SIZE}, got {:?}",
            aligned.dimensions()
        )));
    }

    let side = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_shape_and_range() {
        let crop = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([255, 0, 128]));
        let tensor = preprocess(&crop).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 7]] - (0.5 / 127.5)).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_rejects_unaligned_crop() {
        let crop = RgbImage::new(100, 112);
        assert!(matches!(
            preprocess(&crop),
            Err(RecognizerError::InferenceFailed(_))
        ));
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceRecognizer::load(Path::new("/nonexistent/w600k_r50.onnx")).err();
        assert!(matches!(err, Some(RecognizerError::ModelNotFound(_))));
    }
}
